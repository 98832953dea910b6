/// Suite configuration structures
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::runner::FailurePolicy;
use crate::condition::{ConditionSpec, OutputTarget, RunSettings};
use crate::config;
use crate::engine::{ReferenceEngineConfig, ReferenceEngineFactory};
use crate::error::ConfigError;
use crate::io::OutputFormat;
use crate::lfp::ElectrodePosition;
use crate::pathology::{AdStage, Pathophysiology};
use crate::stim::{StimulationProtocol, TmsParams};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Name of the study; prefixes the summary files
    pub study_name: String,

    /// Ordered electrode array `[[x, y, z], ...]` (µm). Required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub electrodes: Option<Vec<ElectrodePosition>>,

    /// Stimulation protocol shared by every condition
    pub tms_params: TmsParams,

    #[serde(default)]
    pub run: RunSection,

    #[serde(default)]
    pub engine: EngineSection,

    /// Conditions, run in this order
    pub conditions: Vec<ConditionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionEntry {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Whether pathophysiology is applied
    #[serde(rename = "AD_model")]
    pub ad_model: bool,

    /// AD stage 0..=3
    #[serde(rename = "AD_stage")]
    pub ad_stage: AdStage,

    /// Keys set here replace the suite-wide `tms_params`. Any replacement
    /// that changes the protocol is rejected as drift.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tms_params: Option<TmsParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Simulated time per condition (ms)
    pub duration_ms: f64,

    /// Extracellular conductivity (S/m)
    #[serde(rename = "conductivity_S_per_m")]
    pub conductivity_s_per_m: f64,

    pub output_dir: PathBuf,

    pub output_format: OutputFormat,

    /// Write per-condition records and the summary
    pub persist: bool,

    pub failure_policy: FailurePolicy,

    /// Fail a condition whose target population has no cells
    pub require_stimulated_cells: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            duration_ms: config::DEFAULT_DURATION_MS,
            conductivity_s_per_m: config::DEFAULT_CONDUCTIVITY_S_PER_M,
            output_dir: PathBuf::from(config::DEFAULT_OUTPUT_DIR),
            output_format: OutputFormat::Json,
            persist: true,
            failure_policy: FailurePolicy::AbortRemaining,
            require_stimulated_cells: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Populations receiving the stage's channel scaling in AD conditions
    #[serde(default = "default_ad_populations")]
    pub ad_populations: Vec<String>,

    #[serde(flatten)]
    pub reference: ReferenceEngineConfig,
}

fn default_ad_populations() -> Vec<String> {
    vec![config::POP_PYR.to_string()]
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            ad_populations: default_ad_populations(),
            reference: ReferenceEngineConfig::default(),
        }
    }
}

/// `overlay` keys replace `base` keys; absent keys are inherited.
fn merge_params(base: &TmsParams, overlay: &TmsParams) -> TmsParams {
    TmsParams {
        freq_hz: overlay.freq_hz.or(base.freq_hz),
        ef_amp_v_per_m: overlay.ef_amp_v_per_m.or(base.ef_amp_v_per_m),
        stim_start_ms: overlay.stim_start_ms.or(base.stim_start_ms),
        stim_end_ms: overlay.stim_end_ms.or(base.stim_end_ms),
        width_ms: overlay.width_ms.or(base.width_ms),
        target_pop: overlay.target_pop.clone().or_else(|| base.target_pop.clone()),
        e_field_dir: overlay.e_field_dir.or(base.e_field_dir),
        decay_dir: overlay.decay_dir.or(base.decay_dir),
        decay_rate_percent_per_mm: overlay.decay_rate_percent_per_mm.or(base.decay_rate_percent_per_mm),
        ref_point_um: overlay.ref_point_um.or(base.ref_point_um),
    }
}

impl SuiteConfig {
    /// Healthy, AD stage 1 and AD stage 3 under 60 V/m, 30 Hz rTMS from
    /// 2000 to 3000 ms. Only the AD flags differ between conditions.
    pub fn generate_ad_suite(study_name: String) -> Self {
        let tms_params = TmsParams {
            freq_hz: Some(30.0),
            ef_amp_v_per_m: Some(60.0),
            stim_start_ms: Some(2000.0),
            stim_end_ms: Some(3000.0),
            width_ms: Some(1.0),
            target_pop: Some(config::POP_PYR.to_string()),
            ..Default::default()
        };

        let conditions = [
            (AdStage::Healthy, false, "Healthy + 60 V/m rTMS"),
            (AdStage::Hyperexcitable, true, "AD Stage 1 (hyperexcitable) + 60 V/m rTMS"),
            (AdStage::DepolarizationBlockProne, true, "AD Stage 3 (depol. block) + 60 V/m rTMS"),
        ]
        .into_iter()
        .map(|(stage, ad_model, description)| ConditionEntry {
            name: format!("{}_60Vm", stage.label()),
            description: description.to_string(),
            ad_model,
            ad_stage: stage,
            tms_params: None,
        })
        .collect();

        SuiteConfig {
            study_name,
            electrodes: Some(ElectrodePosition::default_array()),
            tms_params,
            run: RunSection::default(),
            engine: EngineSection::default(),
            conditions,
        }
    }

    /// Load suite configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Save suite configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Suite-wide protocol.
    pub fn protocol(&self) -> Result<StimulationProtocol, ConfigError> {
        StimulationProtocol::from_params(&self.tms_params)
    }

    pub fn electrodes(&self) -> Result<&[ElectrodePosition], ConfigError> {
        self.electrodes
            .as_deref()
            .ok_or(ConfigError::MissingField("electrodes"))
    }

    /// One validated spec per `[[conditions]]` entry, in file order.
    pub fn build_conditions(&self) -> Result<Vec<ConditionSpec>, ConfigError> {
        self.electrodes()?;
        if self.conditions.is_empty() {
            return Err(ConfigError::Empty("conditions"));
        }
        let known = &self.engine.reference.cell_counts;
        if let Some(unknown) = self.engine.ad_populations.iter().find(|p| !known.contains_key(*p)) {
            return Err(ConfigError::UnknownPopulation(unknown.clone()));
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.conditions.len());
        for entry in &self.conditions {
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateCondition(entry.name.clone()));
            }
            let protocol = match &entry.tms_params {
                Some(overlay) => {
                    StimulationProtocol::from_params(&merge_params(&self.tms_params, overlay))?
                }
                None => self.protocol()?,
            };
            let pathophysiology = Pathophysiology {
                stage: entry.ad_stage,
                enabled: entry.ad_model,
                populations: if entry.ad_model {
                    self.engine.ad_populations.clone()
                } else {
                    Vec::new()
                },
            };
            let spec = ConditionSpec {
                name: entry.name.clone(),
                description: if entry.description.is_empty() {
                    pathophysiology.effective_stage().description().to_string()
                } else {
                    entry.description.clone()
                },
                pathophysiology,
                protocol,
            };
            spec.validate()?;
            specs.push(spec);
        }
        Ok(specs)
    }

    pub fn run_settings(&self) -> Result<RunSettings, ConfigError> {
        Ok(RunSettings {
            duration_ms: self.run.duration_ms,
            conductivity_s_per_m: self.run.conductivity_s_per_m,
            electrodes: self.electrodes()?.to_vec(),
            output: self.run.persist.then(|| OutputTarget {
                dir: self.run.output_dir.clone(),
                format: self.run.output_format,
            }),
            require_stimulated_cells: self.run.require_stimulated_cells,
        })
    }

    pub fn engine_factory(&self) -> ReferenceEngineFactory {
        ReferenceEngineFactory::new(self.engine.reference.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
study_name = "quick"
electrodes = [[0.0, 600.0, 0.0], [0.0, 900.0, 0.0]]

[tms_params]
freq_Hz = 30
ef_amp_V_per_m = 60.0
stim_start_ms = 2000
stim_end_ms = 3000
width_ms = 1.0
target_pop = "HL23PYR"

[run]
duration_ms = 3000
failure_policy = "continue"

[[conditions]]
name = "Healthy_60Vm"
AD_model = false
AD_stage = 0

[[conditions]]
name = "AD3_60Vm"
AD_model = true
AD_stage = 3
"#;

    #[test]
    fn parses_minimal_suite() {
        let cfg = SuiteConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.electrodes().unwrap().len(), 2);
        assert_eq!(cfg.run.failure_policy, FailurePolicy::Continue);
        assert_eq!(cfg.engine, EngineSection::default());
        let specs = cfg.build_conditions().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].protocol, specs[1].protocol);
        assert_eq!(specs[1].pathophysiology.populations, vec!["HL23PYR".to_string()]);
        assert_eq!(specs[1].description, AdStage::DepolarizationBlockProne.description());
    }

    #[test]
    fn missing_protocol_key_is_named() {
        let cfg = SuiteConfig::from_toml_str(&MINIMAL.replace("width_ms = 1.0\n", "")).unwrap();
        assert!(matches!(
            cfg.build_conditions(),
            Err(ConfigError::MissingField("width_ms"))
        ));
    }

    #[test]
    fn missing_electrodes_are_named() {
        let text = MINIMAL.replace("electrodes = [[0.0, 600.0, 0.0], [0.0, 900.0, 0.0]]\n", "");
        let cfg = SuiteConfig::from_toml_str(&text).unwrap();
        assert!(matches!(
            cfg.build_conditions(),
            Err(ConfigError::MissingField("electrodes"))
        ));
        assert!(matches!(
            cfg.run_settings(),
            Err(ConfigError::MissingField("electrodes"))
        ));
    }

    #[test]
    fn out_of_range_stage_fails_to_parse() {
        let text = MINIMAL.replace("AD_stage = 3", "AD_stage = 5");
        assert!(SuiteConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let text = MINIMAL.replace("AD3_60Vm", "Healthy_60Vm");
        let cfg = SuiteConfig::from_toml_str(&text).unwrap();
        assert!(matches!(
            cfg.build_conditions(),
            Err(ConfigError::DuplicateCondition(_))
        ));
    }

    #[test]
    fn per_condition_override_changes_only_that_condition() {
        let mut cfg = SuiteConfig::from_toml_str(MINIMAL).unwrap();
        cfg.conditions[1].tms_params = Some(TmsParams {
            freq_hz: Some(10.0),
            ..Default::default()
        });
        let specs = cfg.build_conditions().unwrap();
        assert_eq!(specs[1].protocol.frequency_hz(), 10.0);
        assert_eq!(specs[1].protocol.window_start_ms(), 2000.0);
        assert_eq!(specs[0].protocol.first_difference(&specs[1].protocol), Some("freq_Hz"));
    }

    #[test]
    fn generated_suite_survives_a_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suite.toml");
        let cfg = SuiteConfig::generate_ad_suite("rtms_ad".into());
        cfg.to_file(&path).unwrap();
        let loaded = SuiteConfig::from_file(&path).unwrap();
        assert_eq!(loaded, cfg);
        let names: Vec<_> = loaded.conditions.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Healthy_60Vm", "AD1_60Vm", "AD3_60Vm"]);
    }
}
