use std::time::Duration;

use thiserror::Error;

use crate::{
    protocol::CommandKind, rate_limit::RateLimitDenial, schedule::ScheduleConfigError,
};

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("serial link unavailable: {0}")]
    ConnectionLost(String),

    #[error("no complete frame for {command} within {}ms", waited.as_millis())]
    FrameTimeout {
        command: CommandKind,
        waited: Duration,
    },

    #[error("invalid frame: {0}")]
    FrameInvalid(String),

    #[error("device rejected command: {0}")]
    DeviceRejected(String),

    #[error("channel busy, lock not acquired within {}ms", waited.as_millis())]
    LockTimeout { waited: Duration },

    #[error("rate limit exceeded for {}", .0.operation.as_str())]
    RateLimitExceeded(RateLimitDenial),

    #[error("invalid schedule configuration: {0}")]
    ScheduleConfigInvalid(#[from] ScheduleConfigError),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid preset: {0}")]
    PresetInvalid(String),

    #[error("telemetry unavailable ({0})")]
    Unavailable(Box<GatewayError>),
}

impl GatewayError {
    /// Failures that mean the physical link can no longer be trusted.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionLost(_) => "connection_lost",
            Self::FrameTimeout { .. } => "frame_timeout",
            Self::FrameInvalid(_) => "frame_invalid",
            Self::DeviceRejected(_) => "device_rejected",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::RateLimitExceeded(_) => "rate_limit_exceeded",
            Self::ScheduleConfigInvalid(_) => "schedule_config_invalid",
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::PresetInvalid(_) => "preset_invalid",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
