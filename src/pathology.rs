//! Alzheimer's-Disease pathophysiology stages.
//!
//! Each stage scales a fixed set of channel densities on the affected
//! populations. The scalings are handed to the engine; how they alter
//! membrane dynamics is the engine's business.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AdStage {
    /// Stage 0.
    Healthy,
    /// Stage 1: early hyperexcitability.
    Hyperexcitable,
    /// Stage 2: impaired dynamic range, partial hypoexcitability.
    Impaired,
    /// Stage 3: prone to depolarization block.
    DepolarizationBlockProne,
}

impl TryFrom<u8> for AdStage {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AdStage::Healthy),
            1 => Ok(AdStage::Hyperexcitable),
            2 => Ok(AdStage::Impaired),
            3 => Ok(AdStage::DepolarizationBlockProne),
            other => Err(ConfigError::UnknownStage(other)),
        }
    }
}

impl From<AdStage> for u8 {
    fn from(stage: AdStage) -> u8 {
        stage.number()
    }
}

impl fmt::Display for AdStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Multiplicative channel-density changes relative to the healthy cell.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelScaling {
    pub na_transient: f64,
    pub na_persistent: f64,
    pub kv3_1: f64,
    pub sk: f64,
    pub k_transient: f64,
    pub ih: f64,
    pub leak: f64,
}

impl ChannelScaling {
    pub const IDENTITY: ChannelScaling = ChannelScaling {
        na_transient: 1.0,
        na_persistent: 1.0,
        kv3_1: 1.0,
        sk: 1.0,
        k_transient: 1.0,
        ih: 1.0,
        leak: 1.0,
    };

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl AdStage {
    pub const ALL: [AdStage; 4] = [
        AdStage::Healthy,
        AdStage::Hyperexcitable,
        AdStage::Impaired,
        AdStage::DepolarizationBlockProne,
    ];

    pub fn number(&self) -> u8 {
        match self {
            AdStage::Healthy => 0,
            AdStage::Hyperexcitable => 1,
            AdStage::Impaired => 2,
            AdStage::DepolarizationBlockProne => 3,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AdStage::Healthy => "Healthy",
            AdStage::Hyperexcitable => "AD1",
            AdStage::Impaired => "AD2",
            AdStage::DepolarizationBlockProne => "AD3",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AdStage::Healthy => "healthy",
            AdStage::Hyperexcitable => "AD stage 1 (hyperexcitable)",
            AdStage::Impaired => "AD stage 2 (impaired dynamic range)",
            AdStage::DepolarizationBlockProne => "AD stage 3 (depolarization block prone)",
        }
    }

    pub fn channel_scaling(&self) -> ChannelScaling {
        match self {
            AdStage::Healthy => ChannelScaling::IDENTITY,
            AdStage::Hyperexcitable => ChannelScaling {
                na_transient: 1.25,
                na_persistent: 1.30,
                kv3_1: 0.65,
                sk: 0.55,
                k_transient: 0.70,
                ih: 0.65,
                leak: 1.0,
            },
            AdStage::Impaired => ChannelScaling {
                na_transient: 1.10,
                na_persistent: 1.05,
                kv3_1: 0.45,
                sk: 0.35,
                k_transient: 0.50,
                ih: 0.45,
                leak: 1.15,
            },
            AdStage::DepolarizationBlockProne => ChannelScaling {
                na_transient: 1.20,
                na_persistent: 1.60,
                kv3_1: 0.30,
                sk: 0.25,
                k_transient: 0.40,
                ih: 0.30,
                leak: 1.20,
            },
        }
    }
}

/// Pathophysiology fields of a condition; the only fields allowed to vary
/// between conditions of a suite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pathophysiology {
    pub stage: AdStage,
    pub enabled: bool,
    /// Populations whose cells receive the stage's channel scaling.
    pub populations: Vec<String>,
}

impl Pathophysiology {
    pub fn healthy() -> Self {
        Self {
            stage: AdStage::Healthy,
            enabled: false,
            populations: Vec::new(),
        }
    }

    pub fn staged(stage: AdStage, populations: Vec<String>) -> Self {
        Self {
            stage,
            enabled: stage != AdStage::Healthy,
            populations,
        }
    }

    /// The stage in effect: `Healthy` whenever pathophysiology is disabled.
    pub fn effective_stage(&self) -> AdStage {
        if self.enabled {
            self.stage
        } else {
            AdStage::Healthy
        }
    }

    pub fn scaling_for(&self, population: &str) -> ChannelScaling {
        if self.enabled && self.populations.iter().any(|p| p == population) {
            self.stage.channel_scaling()
        } else {
            ChannelScaling::IDENTITY
        }
    }

    pub fn validate(&self, condition: &str) -> Result<(), ConfigError> {
        if self.enabled && self.stage == AdStage::Healthy {
            return Err(ConfigError::HealthyStageEnabled {
                condition: condition.to_string(),
            });
        }
        if self.enabled && self.populations.is_empty() {
            return Err(ConfigError::Empty("AD_populations"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_numbers_round_trip_through_u8() {
        for stage in AdStage::ALL {
            assert_eq!(AdStage::try_from(stage.number()).unwrap(), stage);
        }
        assert!(matches!(AdStage::try_from(4), Err(ConfigError::UnknownStage(4))));
    }

    #[test]
    fn scaling_only_reaches_listed_populations() {
        let p = Pathophysiology::staged(AdStage::Hyperexcitable, vec!["HL23PYR".into()]);
        assert_eq!(p.scaling_for("HL23PYR").na_transient, 1.25);
        assert!(p.scaling_for("HL23PV").is_identity());
    }

    #[test]
    fn disabled_pathology_is_healthy() {
        let mut p = Pathophysiology::staged(AdStage::DepolarizationBlockProne, vec!["HL23PYR".into()]);
        p.enabled = false;
        assert_eq!(p.effective_stage(), AdStage::Healthy);
        assert!(p.scaling_for("HL23PYR").is_identity());
    }

    #[test]
    fn enabled_healthy_stage_is_contradictory() {
        let mut p = Pathophysiology::healthy();
        p.enabled = true;
        p.populations.push("HL23PYR".into());
        assert!(p.validate("x").is_err());
        assert!(Pathophysiology::healthy().validate("x").is_ok());
    }
}
