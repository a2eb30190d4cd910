use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeState {
    #[serde(rename = "BULK_CHARGE")]
    Bulk,
    #[serde(rename = "ABSORPTION_CHARGE")]
    Absorption,
    #[serde(rename = "FLOAT_CHARGE")]
    Float,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(other, rename = "UNKNOWN")]
    Unknown,
}

/// Decoded telemetry body. The measurement core is required; everything the
/// firmware reports beyond it is optional, and unrecognised keys are kept so
/// single-field lookups still find them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub panel_to_battery_current: f64,
    pub battery_to_load_current: f64,
    pub voltage_panel: f64,
    pub voltage_battery_sensor2: f64,
    #[serde(rename = "currentPWM")]
    pub current_pwm: u16,
    pub temperature: f64,
    pub charge_state: ChargeState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absorption_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float_voltage: Option<f64>,
    #[serde(default, rename = "LVD", skip_serializing_if = "Option::is_none")]
    pub lvd: Option<f64>,
    #[serde(default, rename = "LVR", skip_serializing_if = "Option::is_none")]
    pub lvr: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_capacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allowed_current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_lithium: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_battery_voltage_allowed: Option<f64>,

    #[serde(
        default,
        rename = "absorptionCurrentThreshold_mA",
        skip_serializing_if = "Option::is_none"
    )]
    pub absorption_current_threshold_ma: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_limit_into_float_stage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculated_absorption_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_bulk_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated_ah: Option<f64>,
    #[serde(default, rename = "estimatedSOC", skip_serializing_if = "Option::is_none")]
    pub estimated_soc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor_divider: Option<i64>,

    #[serde(default, rename = "useFuenteDC", skip_serializing_if = "Option::is_none")]
    pub use_fuente_dc: Option<bool>,
    #[serde(default, rename = "fuenteDC_Amps", skip_serializing_if = "Option::is_none")]
    pub fuente_dc_amps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bulk_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_sensor_available: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_absorption_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charged_battery_rest_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub re_enter_bulk_voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwm_frequency: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_threshold: Option<i64>,

    #[serde(default)]
    pub temporary_load_off: bool,
    #[serde(default)]
    pub load_off_remaining_seconds: u64,
    #[serde(default)]
    pub load_off_duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_control_state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub led_solar_state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nota_personalizada: Option<String>,

    #[serde(default, rename = "firmware_version", skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Load-control subset served by the action status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadStatus {
    pub temporary_load_off: bool,
    pub load_off_remaining_seconds: u64,
    pub load_off_duration: u64,
    pub load_control_state: Option<bool>,
    pub charge_state: ChargeState,
}

impl Telemetry {
    pub fn from_object(object: Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(object))
            .map_err(|err| GatewayError::FrameInvalid(format!("telemetry does not decode: {err}")))
    }

    pub fn load_status(&self) -> LoadStatus {
        LoadStatus {
            temporary_load_off: self.temporary_load_off,
            load_off_remaining_seconds: self.load_off_remaining_seconds,
            load_off_duration: self.load_off_duration,
            load_control_state: self.load_control_state,
            charge_state: self.charge_state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(flatten)]
    pub telemetry: Telemetry,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(telemetry: Telemetry, captured_at: DateTime<Utc>) -> Self {
        Self {
            telemetry,
            captured_at,
        }
    }

    /// Looks a single field up by its device-side name.
    pub fn field(&self, name: &str) -> Option<Value> {
        match serde_json::to_value(&self.telemetry) {
            Ok(Value::Object(mut object)) => object.remove(name),
            _ => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode() -> Telemetry {
        match fixtures::telemetry_json() {
            Value::Object(object) => Telemetry::from_object(object).unwrap(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn decodes_core_optional_and_extra_fields() {
        let telemetry = decode();
        assert_eq!(telemetry.charge_state, ChargeState::Bulk);
        assert_eq!(telemetry.current_pwm, 128);
        assert_eq!(telemetry.lvd, Some(12.0));
        assert_eq!(telemetry.estimated_soc, Some(74.0));
        assert_eq!(telemetry.firmware_version.as_deref(), Some("2.3.1"));
        assert_eq!(telemetry.extra.get("wifiRssi"), Some(&Value::from(-61)));
    }

    #[test]
    fn missing_core_field_is_invalid() {
        let mut object = match fixtures::telemetry_json() {
            Value::Object(object) => object,
            _ => unreachable!(),
        };
        object.remove("voltagePanel");
        let err = Telemetry::from_object(object).unwrap_err();
        assert!(matches!(err, GatewayError::FrameInvalid(_)));
    }

    #[test]
    fn unknown_charge_state_does_not_reject_frame() {
        let mut object = match fixtures::telemetry_json() {
            Value::Object(object) => object,
            _ => unreachable!(),
        };
        object.insert("chargeState".into(), Value::from("EQUALIZE"));
        let telemetry = Telemetry::from_object(object).unwrap();
        assert_eq!(telemetry.charge_state, ChargeState::Unknown);
    }

    #[test]
    fn snapshot_field_lookup_uses_device_names() {
        let snapshot = Snapshot::new(decode(), Utc::now());
        assert_eq!(snapshot.field("voltagePanel"), Some(Value::from(18.2)));
        assert_eq!(snapshot.field("isLithium"), Some(Value::from(false)));
        assert_eq!(snapshot.field("wifiRssi"), Some(Value::from(-61)));
        assert_eq!(snapshot.field("missing"), None);
    }

    #[test]
    fn load_status_projects_load_fields() {
        let status = decode().load_status();
        assert!(!status.temporary_load_off);
        assert_eq!(status.charge_state, ChargeState::Bulk);
    }
}
