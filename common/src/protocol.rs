use std::{fmt, time::Duration};

use serde::Serialize;

use crate::{
    config::DispatchConfig,
    framing::FrameKind,
    params::{ParamValue, Parameter},
};

pub const CMD_GET_DATA: &str = "CMD:GET_DATA";
pub const CMD_SET_PREFIX: &str = "CMD:SET_";
pub const CMD_TOGGLE_LOAD: &str = "CMD:TOGGLE_LOAD";
pub const CMD_CANCEL_TEMP_OFF: &str = "CMD:CANCEL_TEMP_OFF";

pub const RESP_DATA_PREFIX: &str = "DATA:";
pub const RESP_OK_PREFIX: &str = "OK:";
pub const RESP_ERROR_PREFIX: &str = "ERROR:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ReadTelemetry,
    SetParameter,
    ToggleLoad,
    CancelOverride,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadTelemetry => "read_telemetry",
            Self::SetParameter => "set_parameter",
            Self::ToggleLoad => "toggle_load",
            Self::CancelOverride => "cancel_override",
        }
    }

    pub fn expects(self) -> FrameKind {
        match self {
            Self::ReadTelemetry => FrameKind::Telemetry,
            _ => FrameKind::Acknowledgement,
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, Self::ReadTelemetry)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-attempt timeout of each read strategy plus the retry allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBudget {
    pub strategy_timeout: Duration,
    pub retries: u8,
}

impl CommandBudget {
    pub fn for_kind(kind: CommandKind, config: &DispatchConfig) -> Self {
        if kind.is_write() {
            Self {
                strategy_timeout: Duration::from_millis(config.write_strategy_timeout_ms),
                retries: config.write_retries,
            }
        } else {
            Self {
                strategy_timeout: Duration::from_millis(config.read_strategy_timeout_ms),
                retries: 0,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    wire: String,
    budget: CommandBudget,
}

impl Command {
    fn new(kind: CommandKind, wire: String, config: &DispatchConfig) -> Self {
        Self {
            kind,
            wire,
            budget: CommandBudget::for_kind(kind, config),
        }
    }

    pub fn read_telemetry(config: &DispatchConfig) -> Self {
        Self::new(CommandKind::ReadTelemetry, CMD_GET_DATA.to_string(), config)
    }

    pub fn set_parameter(param: Parameter, value: &ParamValue, config: &DispatchConfig) -> Self {
        Self::new(
            CommandKind::SetParameter,
            format!("{CMD_SET_PREFIX}{}:{value}", param.wire_name()),
            config,
        )
    }

    pub fn toggle_load(seconds: u32, config: &DispatchConfig) -> Self {
        Self::new(
            CommandKind::ToggleLoad,
            format!("{CMD_TOGGLE_LOAD}:{seconds}"),
            config,
        )
    }

    pub fn cancel_override(config: &DispatchConfig) -> Self {
        Self::new(
            CommandKind::CancelOverride,
            CMD_CANCEL_TEMP_OFF.to_string(),
            config,
        )
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn wire(&self) -> &str {
        &self.wire
    }

    pub fn budget(&self) -> CommandBudget {
        self.budget
    }
}
