use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{GatewayError, Result},
    params::{ParamValue, Parameter},
};

pub const MAX_PRESET_NAME_LEN: usize = 100;

/// Named bundle of charger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub battery_capacity: f64,
    pub is_lithium: bool,
    pub threshold_percentage: f64,
    pub max_allowed_current: f64,
    pub bulk_voltage: f64,
    pub absorption_voltage: f64,
    pub float_voltage: f64,
    #[serde(rename = "useFuenteDC")]
    pub use_fuente_dc: bool,
    #[serde(rename = "fuenteDC_Amps")]
    pub fuente_dc_amps: f64,
    pub factor_divider: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Preset {
    /// Parameter writes in device order: chemistry and capacity first so the
    /// firmware recomputes its thresholds before the voltages land.
    pub fn parameters(&self) -> Vec<(Parameter, ParamValue)> {
        vec![
            (Parameter::IsLithium, ParamValue::Bool(self.is_lithium)),
            (Parameter::BatteryCapacity, ParamValue::Float(self.battery_capacity)),
            (Parameter::ThresholdPercentage, ParamValue::Float(self.threshold_percentage)),
            (Parameter::MaxAllowedCurrent, ParamValue::Float(self.max_allowed_current)),
            (Parameter::BulkVoltage, ParamValue::Float(self.bulk_voltage)),
            (Parameter::AbsorptionVoltage, ParamValue::Float(self.absorption_voltage)),
            (Parameter::FloatVoltage, ParamValue::Float(self.float_voltage)),
            (Parameter::UseFuenteDc, ParamValue::Bool(self.use_fuente_dc)),
            (Parameter::FuenteDcAmps, ParamValue::Float(self.fuente_dc_amps)),
            (Parameter::FactorDivider, ParamValue::Int(self.factor_divider)),
        ]
    }

    /// Every problem found, keyed by field name.
    pub fn problems(&self) -> BTreeMap<&'static str, String> {
        let mut problems = BTreeMap::new();
        for (param, value) in self.parameters() {
            if let Err(err) = param.coerce(value) {
                problems.insert(param.wire_name(), err.to_string());
            }
        }
        if self.absorption_voltage < self.bulk_voltage {
            problems.insert(
                Parameter::AbsorptionVoltage.wire_name(),
                "absorption voltage must be at least the bulk voltage".to_string(),
            );
        }
        if self.float_voltage > self.absorption_voltage {
            problems.insert(
                Parameter::FloatVoltage.wire_name(),
                "float voltage must not exceed the absorption voltage".to_string(),
            );
        }
        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        let joined = problems
            .iter()
            .map(|(field, problem)| format!("{field}: {problem}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(GatewayError::PresetInvalid(joined))
    }
}

pub fn validate_preset_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_PRESET_NAME_LEN {
        return Err(GatewayError::PresetInvalid(format!(
            "preset name must be 1 to {MAX_PRESET_NAME_LEN} characters"
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresetCatalog {
    presets: BTreeMap<String, Preset>,
}

impl PresetCatalog {
    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Preset)> {
        self.presets.iter()
    }

    /// Validates and stores, keeping the original creation time on update.
    pub fn upsert(&mut self, name: &str, mut preset: Preset, now: DateTime<Utc>) -> Result<&Preset> {
        let name = validate_preset_name(name)?.to_string();
        preset.validate()?;
        preset.created_at = self
            .presets
            .get(&name)
            .and_then(|existing| existing.created_at)
            .or(preset.created_at)
            .or(Some(now));
        preset.updated_at = Some(now);
        self.presets.insert(name.clone(), preset);
        Ok(&self.presets[&name])
    }

    pub fn remove(&mut self, name: &str) -> Option<Preset> {
        self.presets.remove(name)
    }
}

#[cfg(test)]
pub(crate) fn sample_preset() -> Preset {
    Preset {
        battery_capacity: 100.0,
        is_lithium: true,
        threshold_percentage: 1.0,
        max_allowed_current: 8_000.0,
        bulk_voltage: 14.2,
        absorption_voltage: 14.4,
        float_voltage: 13.6,
        use_fuente_dc: false,
        fuente_dc_amps: 0.0,
        factor_divider: 1,
        created_at: None,
        updated_at: None,
    }
}
