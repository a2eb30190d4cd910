use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Tagged parameter value. Booleans travel as `1`/`0` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("1"),
            Self::Bool(false) => f.write_str("0"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl ParamValue {
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Int,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub kind: ValueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    #[serde(rename = "bulkVoltage")]
    BulkVoltage,
    #[serde(rename = "absorptionVoltage")]
    AbsorptionVoltage,
    #[serde(rename = "floatVoltage")]
    FloatVoltage,
    #[serde(rename = "batteryCapacity")]
    BatteryCapacity,
    #[serde(rename = "thresholdPercentage")]
    ThresholdPercentage,
    #[serde(rename = "maxAllowedCurrent")]
    MaxAllowedCurrent,
    #[serde(rename = "isLithium")]
    IsLithium,
    #[serde(rename = "factorDivider")]
    FactorDivider,
    #[serde(rename = "useFuenteDC")]
    UseFuenteDc,
    #[serde(rename = "fuenteDC_Amps")]
    FuenteDcAmps,
}

impl Parameter {
    pub const ALL: [Self; 10] = [
        Self::BulkVoltage,
        Self::AbsorptionVoltage,
        Self::FloatVoltage,
        Self::BatteryCapacity,
        Self::ThresholdPercentage,
        Self::MaxAllowedCurrent,
        Self::IsLithium,
        Self::FactorDivider,
        Self::UseFuenteDc,
        Self::FuenteDcAmps,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::BulkVoltage => "bulkVoltage",
            Self::AbsorptionVoltage => "absorptionVoltage",
            Self::FloatVoltage => "floatVoltage",
            Self::BatteryCapacity => "batteryCapacity",
            Self::ThresholdPercentage => "thresholdPercentage",
            Self::MaxAllowedCurrent => "maxAllowedCurrent",
            Self::IsLithium => "isLithium",
            Self::FactorDivider => "factorDivider",
            Self::UseFuenteDc => "useFuenteDC",
            Self::FuenteDcAmps => "fuenteDC_Amps",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|param| param.wire_name() == name)
            .ok_or_else(|| GatewayError::InvalidParameter(format!("unknown parameter '{name}'")))
    }

    pub fn spec(self) -> ParameterSpec {
        let (kind, min, max, description) = match self {
            Self::BulkVoltage => (ValueKind::Float, Some(12.0), Some(15.0), "Bulk charge voltage (V)"),
            Self::AbsorptionVoltage => (
                ValueKind::Float,
                Some(12.0),
                Some(15.0),
                "Absorption charge voltage (V)",
            ),
            Self::FloatVoltage => (ValueKind::Float, Some(12.0), Some(15.0), "Float charge voltage (V)"),
            Self::BatteryCapacity => (ValueKind::Float, Some(1.0), Some(1_000.0), "Battery capacity (Ah)"),
            Self::ThresholdPercentage => (
                ValueKind::Float,
                Some(0.1),
                Some(5.0),
                "Absorption exit current threshold (%)",
            ),
            Self::MaxAllowedCurrent => (
                ValueKind::Float,
                Some(1_000.0),
                Some(15_000.0),
                "Maximum charge current (mA)",
            ),
            Self::IsLithium => (ValueKind::Bool, None, None, "Lithium battery chemistry"),
            Self::FactorDivider => (ValueKind::Int, Some(1.0), Some(10.0), "Current factor divider"),
            Self::UseFuenteDc => (ValueKind::Bool, None, None, "Use external DC source"),
            Self::FuenteDcAmps => (ValueKind::Float, Some(0.0), Some(50.0), "External DC source current (A)"),
        };
        ParameterSpec {
            kind,
            min,
            max,
            description,
        }
    }

    /// Converts a loosely typed input into this parameter's declared type and
    /// checks its range.
    pub fn coerce(self, value: ParamValue) -> Result<ParamValue> {
        let spec = self.spec();
        let name = self.wire_name();
        let invalid = |detail: String| GatewayError::InvalidParameter(format!("{name}: {detail}"));

        let coerced = match spec.kind {
            ValueKind::Bool => ParamValue::Bool(match value {
                ParamValue::Bool(b) => b,
                ParamValue::Int(0) => false,
                ParamValue::Int(1) => true,
                ParamValue::Text(ref text) => match text.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "on" | "yes" => true,
                    "false" | "0" | "off" | "no" => false,
                    _ => return Err(invalid(format!("'{text}' is not a boolean"))),
                },
                other => return Err(invalid(format!("{other} is not a boolean"))),
            }),
            ValueKind::Int => ParamValue::Int(match value {
                ParamValue::Int(n) => n,
                ParamValue::Float(f) if f.is_finite() && f.fract() == 0.0 => f as i64,
                ParamValue::Text(ref text) => text
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| invalid(format!("'{text}' is not an integer")))?,
                other => return Err(invalid(format!("{other} is not an integer"))),
            }),
            ValueKind::Float => ParamValue::Float(match value {
                ParamValue::Float(f) => f,
                ParamValue::Int(n) => n as f64,
                ParamValue::Text(ref text) => text
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("'{text}' is not a number")))?,
                ParamValue::Bool(b) => return Err(invalid(format!("{b} is not a number"))),
            }),
        };

        let numeric = match coerced {
            ParamValue::Int(n) => Some(n as f64),
            ParamValue::Float(f) => Some(f),
            _ => None,
        };
        if let Some(number) = numeric {
            if !number.is_finite() {
                return Err(invalid("value must be finite".to_string()));
            }
            if let (Some(min), Some(max)) = (spec.min, spec.max) {
                if number < min || number > max {
                    return Err(invalid(format!("{number} outside {min}..={max}")));
                }
            }
        }
        Ok(coerced)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn booleans_encode_as_digits() {
        assert_eq!(ParamValue::Bool(true).to_string(), "1");
        assert_eq!(ParamValue::Bool(false).to_string(), "0");
        assert_eq!(ParamValue::Float(14.4).to_string(), "14.4");
        assert_eq!(ParamValue::Int(3).to_string(), "3");
    }

    #[test]
    fn coercion_accepts_loose_inputs() {
        assert_eq!(
            Parameter::IsLithium.coerce(ParamValue::Text("TRUE".into())).unwrap(),
            ParamValue::Bool(true)
        );
        assert_eq!(
            Parameter::IsLithium.coerce(ParamValue::Int(0)).unwrap(),
            ParamValue::Bool(false)
        );
        assert_eq!(
            Parameter::FactorDivider.coerce(ParamValue::Float(4.0)).unwrap(),
            ParamValue::Int(4)
        );
        assert_eq!(
            Parameter::BulkVoltage.coerce(ParamValue::Int(14)).unwrap(),
            ParamValue::Float(14.0)
        );
        assert_eq!(
            Parameter::FuenteDcAmps.coerce(ParamValue::Text(" 12.5 ".into())).unwrap(),
            ParamValue::Float(12.5)
        );
    }

    #[test]
    fn coercion_rejects_wrong_types_and_ranges() {
        let cases = [
            (Parameter::BulkVoltage, ParamValue::Float(11.9)),
            (Parameter::BulkVoltage, ParamValue::Bool(true)),
            (Parameter::FactorDivider, ParamValue::Float(2.5)),
            (Parameter::FactorDivider, ParamValue::Int(11)),
            (Parameter::IsLithium, ParamValue::Int(2)),
            (Parameter::IsLithium, ParamValue::Text("maybe".into())),
            (Parameter::MaxAllowedCurrent, ParamValue::Text("lots".into())),
            (Parameter::ThresholdPercentage, ParamValue::Float(f64::NAN)),
        ];
        for (param, value) in cases {
            let err = param.coerce(value.clone()).unwrap_err();
            assert!(
                matches!(err, GatewayError::InvalidParameter(_)),
                "{param} accepted {value:?}"
            );
        }
    }

    #[test]
    fn names_round_trip_through_registry() {
        for param in Parameter::ALL {
            assert_eq!(Parameter::from_name(param.wire_name()).unwrap(), param);
        }
        assert!(Parameter::from_name("chargeState").is_err());
    }

    #[test]
    fn json_values_map_to_tags() {
        assert_eq!(
            ParamValue::from_json(&serde_json::json!(3)),
            Some(ParamValue::Int(3))
        );
        assert_eq!(
            ParamValue::from_json(&serde_json::json!(3.5)),
            Some(ParamValue::Float(3.5))
        );
        assert_eq!(ParamValue::from_json(&serde_json::json!(null)), None);
    }
}
