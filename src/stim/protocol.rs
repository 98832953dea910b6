//! rTMS stimulation protocol: raw configuration block and validated value.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::stim::field::SpatialField;
use crate::units;

/// `[tms_params]` block as written in configuration files.
///
/// Every stimulation parameter is required; an absent key is reported as
/// [`ConfigError::MissingField`] when the protocol is built. The spatial
/// keys form one optional group: give all four or none.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TmsParams {
    #[serde(rename = "freq_Hz", default, skip_serializing_if = "Option::is_none")]
    pub freq_hz: Option<f64>,
    #[serde(rename = "ef_amp_V_per_m", default, skip_serializing_if = "Option::is_none")]
    pub ef_amp_v_per_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stim_start_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stim_end_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pop: Option<String>,

    #[serde(rename = "E_field_dir", default, skip_serializing_if = "Option::is_none")]
    pub e_field_dir: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_dir: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_rate_percent_per_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_point_um: Option<[f32; 3]>,
}

fn require<T: Clone>(value: &Option<T>, name: &'static str) -> Result<T, ConfigError> {
    value.clone().ok_or(ConfigError::MissingField(name))
}

impl TmsParams {
    fn spatial_field(&self) -> Result<Option<SpatialField>, ConfigError> {
        let any = self.e_field_dir.is_some()
            || self.decay_dir.is_some()
            || self.decay_rate_percent_per_mm.is_some()
            || self.ref_point_um.is_some();
        if !any {
            return Ok(None);
        }
        Ok(Some(SpatialField {
            field_direction: require(&self.e_field_dir, "E_field_dir")?,
            decay_direction: require(&self.decay_dir, "decay_dir")?,
            decay_rate_percent_per_mm: require(
                &self.decay_rate_percent_per_mm,
                "decay_rate_percent_per_mm",
            )?,
            reference_point_um: require(&self.ref_point_um, "ref_point_um")?,
        }))
    }
}

/// Validated, immutable stimulation protocol.
///
/// Fields are private: a protocol can only be obtained through
/// [`StimulationProtocol::from_params`], [`StimulationProtocol::new`] or
/// deserialization, all of which validate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ProtocolFields")]
pub struct StimulationProtocol {
    field_amplitude_v_per_m: f64,
    frequency_hz: f64,
    window_start_ms: f64,
    window_end_ms: f64,
    pulse_width_ms: f64,
    target_population: String,
    spatial: Option<SpatialField>,
}

#[derive(Deserialize)]
struct ProtocolFields {
    field_amplitude_v_per_m: f64,
    frequency_hz: f64,
    window_start_ms: f64,
    window_end_ms: f64,
    pulse_width_ms: f64,
    target_population: String,
    spatial: Option<SpatialField>,
}

impl TryFrom<ProtocolFields> for StimulationProtocol {
    type Error = ConfigError;

    fn try_from(f: ProtocolFields) -> Result<Self, Self::Error> {
        let protocol = StimulationProtocol {
            field_amplitude_v_per_m: f.field_amplitude_v_per_m,
            frequency_hz: f.frequency_hz,
            window_start_ms: f.window_start_ms,
            window_end_ms: f.window_end_ms,
            pulse_width_ms: f.pulse_width_ms,
            target_population: f.target_population,
            spatial: f.spatial,
        };
        protocol.validate()?;
        Ok(protocol)
    }
}

impl StimulationProtocol {
    pub fn new(
        field_amplitude_v_per_m: f64,
        frequency_hz: f64,
        window_start_ms: f64,
        window_end_ms: f64,
        pulse_width_ms: f64,
        target_population: impl Into<String>,
        spatial: Option<SpatialField>,
    ) -> Result<Self, ConfigError> {
        ProtocolFields {
            field_amplitude_v_per_m,
            frequency_hz,
            window_start_ms,
            window_end_ms,
            pulse_width_ms,
            target_population: target_population.into(),
            spatial,
        }
        .try_into()
    }

    pub fn from_params(params: &TmsParams) -> Result<Self, ConfigError> {
        Self::new(
            require(&params.ef_amp_v_per_m, "ef_amp_V_per_m")?,
            require(&params.freq_hz, "freq_Hz")?,
            require(&params.stim_start_ms, "stim_start_ms")?,
            require(&params.stim_end_ms, "stim_end_ms")?,
            require(&params.width_ms, "width_ms")?,
            require(&params.target_pop, "target_pop")?,
            params.spatial_field()?,
        )
    }

    /// Inverse of [`StimulationProtocol::from_params`].
    pub fn to_params(&self) -> TmsParams {
        let spatial = self.spatial.as_ref();
        TmsParams {
            freq_hz: Some(self.frequency_hz),
            ef_amp_v_per_m: Some(self.field_amplitude_v_per_m),
            stim_start_ms: Some(self.window_start_ms),
            stim_end_ms: Some(self.window_end_ms),
            width_ms: Some(self.pulse_width_ms),
            target_pop: Some(self.target_population.clone()),
            e_field_dir: spatial.map(|s| s.field_direction),
            decay_dir: spatial.map(|s| s.decay_direction),
            decay_rate_percent_per_mm: spatial.map(|s| s.decay_rate_percent_per_mm),
            ref_point_um: spatial.map(|s| s.reference_point_um),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("ef_amp_V_per_m", self.field_amplitude_v_per_m),
            ("freq_Hz", self.frequency_hz),
            ("stim_start_ms", self.window_start_ms),
            ("stim_end_ms", self.window_end_ms),
            ("width_ms", self.pulse_width_ms),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NonFinite { field, value });
            }
        }
        if self.frequency_hz <= 0.0 {
            return Err(ConfigError::NonPositiveFrequency(self.frequency_hz));
        }
        if self.window_end_ms <= self.window_start_ms {
            return Err(ConfigError::EmptyWindow {
                start_ms: self.window_start_ms,
                end_ms: self.window_end_ms,
            });
        }
        if self.pulse_width_ms <= 0.0 {
            return Err(ConfigError::NonPositiveWidth(self.pulse_width_ms));
        }
        let period_ms = self.period_ms();
        if self.pulse_width_ms >= period_ms {
            return Err(ConfigError::OverlappingPulses {
                width_ms: self.pulse_width_ms,
                period_ms,
            });
        }
        if self.target_population.is_empty() {
            return Err(ConfigError::Empty("target_pop"));
        }
        if let Some(spatial) = &self.spatial {
            spatial.validate()?;
        }
        Ok(())
    }

    pub fn field_amplitude_v_per_m(&self) -> f64 {
        self.field_amplitude_v_per_m
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    pub fn window_start_ms(&self) -> f64 {
        self.window_start_ms
    }

    pub fn window_end_ms(&self) -> f64 {
        self.window_end_ms
    }

    pub fn pulse_width_ms(&self) -> f64 {
        self.pulse_width_ms
    }

    pub fn target_population(&self) -> &str {
        &self.target_population
    }

    pub fn spatial(&self) -> Option<&SpatialField> {
        self.spatial.as_ref()
    }

    /// Onset-to-onset spacing.
    pub fn period_ms(&self) -> f64 {
        units::period_ms(self.frequency_hz)
    }

    /// Canonical byte encoding; equal fingerprints mean bit-identical protocols.
    pub fn fingerprint(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Name of the first parameter whose bits differ from `other`.
    pub fn first_difference(&self, other: &StimulationProtocol) -> Option<&'static str> {
        let scalars = [
            ("ef_amp_V_per_m", self.field_amplitude_v_per_m, other.field_amplitude_v_per_m),
            ("freq_Hz", self.frequency_hz, other.frequency_hz),
            ("stim_start_ms", self.window_start_ms, other.window_start_ms),
            ("stim_end_ms", self.window_end_ms, other.window_end_ms),
            ("width_ms", self.pulse_width_ms, other.pulse_width_ms),
        ];
        for (name, a, b) in scalars {
            if a.to_bits() != b.to_bits() {
                return Some(name);
            }
        }
        if self.target_population != other.target_population {
            return Some("target_pop");
        }
        match (&self.spatial, &other.spatial) {
            (None, None) => None,
            (Some(a), Some(b)) => {
                let bits = |v: [f32; 3]| v.map(f32::to_bits);
                if bits(a.field_direction) != bits(b.field_direction) {
                    Some("E_field_dir")
                } else if bits(a.decay_direction) != bits(b.decay_direction) {
                    Some("decay_dir")
                } else if a.decay_rate_percent_per_mm.to_bits()
                    != b.decay_rate_percent_per_mm.to_bits()
                {
                    Some("decay_rate_percent_per_mm")
                } else if bits(a.reference_point_um) != bits(b.reference_point_um) {
                    Some("ref_point_um")
                } else {
                    None
                }
            }
            _ => Some("spatial field"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TmsParams {
        TmsParams {
            freq_hz: Some(30.0),
            ef_amp_v_per_m: Some(60.0),
            stim_start_ms: Some(2000.0),
            stim_end_ms: Some(3000.0),
            width_ms: Some(1.0),
            target_pop: Some("HL23PYR".into()),
            ..Default::default()
        }
    }

    #[test]
    fn builds_from_complete_params() {
        let p = StimulationProtocol::from_params(&params()).unwrap();
        assert_eq!(p.frequency_hz(), 30.0);
        assert_eq!(p.target_population(), "HL23PYR");
        assert!(p.spatial().is_none());
        assert_eq!(p.to_params(), params());
    }

    #[test]
    fn missing_field_is_named() {
        let mut raw = params();
        raw.width_ms = None;
        match StimulationProtocol::from_params(&raw) {
            Err(ConfigError::MissingField(name)) => assert_eq!(name, "width_ms"),
            other => panic!("expected missing field, got {:?}", other),
        }
    }

    #[test]
    fn partial_spatial_group_is_rejected() {
        let mut raw = params();
        raw.decay_dir = Some([0.0, 0.0, -1.0]);
        assert!(matches!(
            StimulationProtocol::from_params(&raw),
            Err(ConfigError::MissingField("E_field_dir"))
        ));
    }

    #[test]
    fn rejects_invalid_windows_and_rates() {
        let mut raw = params();
        raw.freq_hz = Some(0.0);
        assert!(matches!(
            StimulationProtocol::from_params(&raw),
            Err(ConfigError::NonPositiveFrequency(_))
        ));

        let mut raw = params();
        raw.stim_end_ms = Some(2000.0);
        assert!(matches!(
            StimulationProtocol::from_params(&raw),
            Err(ConfigError::EmptyWindow { .. })
        ));

        let mut raw = params();
        raw.freq_hz = Some(1000.0);
        assert!(matches!(
            StimulationProtocol::from_params(&raw),
            Err(ConfigError::OverlappingPulses { .. })
        ));
    }

    #[test]
    fn deserialization_validates() {
        let p = StimulationProtocol::from_params(&params()).unwrap();
        let mut json = serde_json::to_value(&p).unwrap();
        json["frequency_hz"] = serde_json::json!(-5.0);
        assert!(serde_json::from_value::<StimulationProtocol>(json).is_err());
    }

    #[test]
    fn fingerprint_tracks_bits() {
        let a = StimulationProtocol::from_params(&params()).unwrap();
        let b = StimulationProtocol::from_params(&params()).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.first_difference(&b), None);

        let mut raw = params();
        raw.ef_amp_v_per_m = Some(40.0);
        let c = StimulationProtocol::from_params(&raw).unwrap();
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
        assert_eq!(a.first_difference(&c), Some("ef_amp_V_per_m"));
    }
}
