//! One condition: CONFIGURED → STIMULATED → INTEGRATED → MEASURED → PERSISTED.
//!
//! Stages run strictly in order. A failure stops the condition and records
//! the stage being entered; a persistence failure keeps the in-memory output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info};

use crate::analysis::ConditionStatistics;
use crate::config;
use crate::engine::{CellId, CellRecord, EngineFactory, EngineSession};
use crate::error::{ConfigError, ConsistencyError, RtmsError, StageFailure};
use crate::io::{self, OutputFormat, PersistedPaths, RecordMetadata, SimulationOutput};
use crate::lfp::{ElectrodePosition, LfpSynthesizer};
use crate::pathology::Pathophysiology;
use crate::profile_scope;
use crate::stim::{PulseScheduler, StimulationApplicator, StimulationProtocol};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Configured,
    Stimulated,
    Integrated,
    Measured,
    Persisted,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Configured => "CONFIGURED",
            RunStage::Stimulated => "STIMULATED",
            RunStage::Integrated => "INTEGRATED",
            RunStage::Measured => "MEASURED",
            RunStage::Persisted => "PERSISTED",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub name: String,
    pub description: String,
    pub pathophysiology: Pathophysiology,
    pub protocol: StimulationProtocol,
}

impl ConditionSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Empty("condition name"));
        }
        self.pathophysiology.validate(&self.name)?;
        self.protocol.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputTarget {
    pub dir: PathBuf,
    pub format: OutputFormat,
}

/// Settings shared by every condition of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSettings {
    pub duration_ms: f64,
    pub conductivity_s_per_m: f64,
    pub electrodes: Vec<ElectrodePosition>,
    /// `None` skips the PERSISTED stage's file output.
    pub output: Option<OutputTarget>,
    /// Turn an empty target population into a failure instead of a warning.
    pub require_stimulated_cells: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            duration_ms: config::DEFAULT_DURATION_MS,
            conductivity_s_per_m: config::DEFAULT_CONDUCTIVITY_S_PER_M,
            electrodes: ElectrodePosition::default_array(),
            output: Some(OutputTarget {
                dir: PathBuf::from(config::DEFAULT_OUTPUT_DIR),
                format: OutputFormat::Json,
            }),
            require_stimulated_cells: false,
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::InvalidRunSetting {
                field,
                reason: reason.to_string(),
            })
        };
        if !(self.duration_ms > 0.0) || !self.duration_ms.is_finite() {
            return invalid("duration_ms", "must be positive and finite");
        }
        if !(self.conductivity_s_per_m > 0.0) || !self.conductivity_s_per_m.is_finite() {
            return invalid("conductivity_S_per_m", "must be positive and finite");
        }
        if self.electrodes.is_empty() {
            return Err(ConfigError::Empty("electrodes"));
        }
        let finite = |e: &ElectrodePosition| e.x.is_finite() && e.y.is_finite() && e.z.is_finite();
        if !self.electrodes.iter().all(finite) {
            return invalid("electrodes", "coordinates must be finite");
        }
        Ok(())
    }

    /// The stimulation window must fit inside the simulated time.
    pub fn check_protocol(&self, protocol: &StimulationProtocol) -> Result<(), ConfigError> {
        if protocol.window_end_ms() > self.duration_ms {
            return Err(ConfigError::InvalidRunSetting {
                field: "duration_ms",
                reason: format!(
                    "{} ms ends before the stimulation window ({} ms)",
                    self.duration_ms,
                    protocol.window_end_ms()
                ),
            });
        }
        Ok(())
    }
}

/// Reference protocol every condition must match bit for bit.
#[derive(Clone, Debug)]
pub struct ProtocolSnapshot {
    protocol: StimulationProtocol,
}

impl ProtocolSnapshot {
    pub fn capture(protocol: &StimulationProtocol) -> Self {
        Self {
            protocol: protocol.clone(),
        }
    }

    pub fn protocol(&self) -> &StimulationProtocol {
        &self.protocol
    }

    /// Field-by-field bit comparison, then the encoded bytes. An encoding
    /// failure counts as drift.
    pub fn verify(&self, condition: &str, protocol: &StimulationProtocol) -> Result<(), ConfigError> {
        let drift = |field| ConfigError::ProtocolDrift {
            condition: condition.to_string(),
            field,
        };
        if let Some(field) = self.protocol.first_difference(protocol) {
            return Err(drift(field));
        }
        match (self.protocol.fingerprint(), protocol.fingerprint()) {
            (Ok(a), Ok(b)) if a == b => Ok(()),
            _ => Err(drift("protocol")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConditionStatus {
    Succeeded,
    Failed { stage: RunStage, reason: String },
    NotAttempted,
}

impl ConditionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ConditionStatus::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConditionStatus::Succeeded => "succeeded",
            ConditionStatus::Failed { .. } => "failed",
            ConditionStatus::NotAttempted => "not_attempted",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConditionResult {
    pub name: String,
    pub status: ConditionStatus,
    /// Present after MEASURED, even when persistence failed.
    pub output: Option<SimulationOutput>,
    pub persisted: Option<PersistedPaths>,
}

impl ConditionResult {
    pub fn not_attempted(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ConditionStatus::NotAttempted,
            output: None,
            persisted: None,
        }
    }

    fn failed(name: &str, failure: StageFailure, output: Option<SimulationOutput>) -> Self {
        error!("Condition {} failed: {}", name, failure);
        Self {
            name: name.to_string(),
            status: ConditionStatus::Failed {
                stage: failure.stage,
                reason: failure.source.to_string(),
            },
            output,
            persisted: None,
        }
    }
}

fn at<E: Into<RtmsError>>(stage: RunStage) -> impl Fn(E) -> StageFailure {
    move |e| StageFailure::new(stage, e)
}

pub struct ConditionRunner<'a, F> {
    factory: &'a F,
    settings: &'a RunSettings,
    scheduler: PulseScheduler,
    applicator: StimulationApplicator,
}

impl<'a, F: EngineFactory> ConditionRunner<'a, F> {
    pub fn new(factory: &'a F, settings: &'a RunSettings) -> Self {
        Self {
            factory,
            settings,
            scheduler: PulseScheduler::default(),
            applicator: StimulationApplicator::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: PulseScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn run(&self, spec: &ConditionSpec, snapshot: &ProtocolSnapshot) -> ConditionResult {
        profile_scope!(Condition);
        info!("=== Condition {}: {} ===", spec.name, spec.description);
        let output = match self.measure(spec, snapshot) {
            Ok(output) => output,
            Err(failure) => return ConditionResult::failed(&spec.name, failure, None),
        };

        let persisted = match &self.settings.output {
            Some(target) => match io::save_output(&target.dir, &output, target.format) {
                Ok(paths) => Some(paths),
                Err(e) => {
                    return ConditionResult::failed(
                        &spec.name,
                        StageFailure::new(RunStage::Persisted, e),
                        Some(output),
                    )
                }
            },
            None => None,
        };
        info!("[{}] {}", spec.name, RunStage::Persisted);

        ConditionResult {
            name: spec.name.clone(),
            status: ConditionStatus::Succeeded,
            output: Some(output),
            persisted,
        }
    }

    /// Stages up to and including MEASURED.
    fn measure(&self, spec: &ConditionSpec, snapshot: &ProtocolSnapshot) -> Result<SimulationOutput, StageFailure> {
        // CONFIGURED
        spec.validate().map_err(at(RunStage::Configured))?;
        snapshot
            .verify(&spec.name, &spec.protocol)
            .map_err(at(RunStage::Configured))?;
        self.settings
            .check_protocol(&spec.protocol)
            .map_err(at(RunStage::Configured))?;
        let mut session = {
            profile_scope!(EngineCreate);
            self.factory
                .create(&spec.pathophysiology)
                .map_err(at(RunStage::Configured))?
        };
        let populations: BTreeMap<CellId, String> = session
            .cells()
            .iter()
            .map(|c| (c.id(), c.population().to_string()))
            .collect();
        info!("[{}] {} ({} cells)", spec.name, RunStage::Configured, populations.len());

        // STIMULATED
        let train = self
            .scheduler
            .schedule(&spec.protocol)
            .map_err(at(RunStage::Stimulated))?;
        let stimuli = self
            .applicator
            .apply(&train, &spec.protocol, &mut session)
            .map_err(at(RunStage::Stimulated))?;
        if stimuli.targeted_cells().is_empty() && self.settings.require_stimulated_cells {
            return Err(StageFailure::new(
                RunStage::Stimulated,
                ConsistencyError::EmptyTargetPopulation(spec.protocol.target_population().to_string()),
            ));
        }
        info!(
            "[{}] {}: {} pulses x {} cells",
            spec.name,
            RunStage::Stimulated,
            train.n_pulses(),
            stimuli.targeted_cells().len()
        );

        // INTEGRATED
        let integrated = {
            profile_scope!(Integrate);
            session
                .integrate(self.settings.duration_ms, &stimuli)
                .map_err(at(RunStage::Integrated))?
        };
        info!("[{}] {}", spec.name, RunStage::Integrated);

        // MEASURED
        let expected_dt = session.recording_dt_ms();
        let currents = &integrated.currents;
        if currents.sample_dt_ms.to_bits() != expected_dt.to_bits() {
            return Err(StageFailure::new(
                RunStage::Measured,
                ConsistencyError::ResolutionMismatch {
                    expected: expected_dt,
                    actual: currents.sample_dt_ms,
                },
            ));
        }
        let expected_samples = (self.settings.duration_ms / expected_dt).round() as usize;
        if currents.sample_count() != expected_samples {
            return Err(StageFailure::new(
                RunStage::Measured,
                ConsistencyError::SampleCountMismatch {
                    expected: expected_samples,
                    actual: currents.sample_count(),
                },
            ));
        }
        if let Some((segment, trace)) = currents
            .traces
            .iter()
            .enumerate()
            .find(|(_, t)| t.len() != expected_samples)
        {
            return Err(StageFailure::new(
                RunStage::Measured,
                ConsistencyError::SegmentLengthMismatch {
                    segment,
                    expected: expected_samples,
                    actual: trace.len(),
                },
            ));
        }
        let lfp = LfpSynthesizer::new(self.settings.conductivity_s_per_m)
            .compute(currents, &self.settings.electrodes)
            .map_err(at(RunStage::Measured))?;
        if let Some((electrode, trace)) = lfp
            .traces
            .iter()
            .enumerate()
            .find(|(_, t)| t.len() != expected_samples)
        {
            return Err(StageFailure::new(
                RunStage::Measured,
                ConsistencyError::ElectrodeLengthMismatch {
                    electrode,
                    expected: expected_samples,
                    actual: trace.len(),
                },
            ));
        }
        let statistics = ConditionStatistics::compute(
            &integrated.spikes,
            &populations,
            &lfp,
            self.settings.duration_ms,
            (spec.protocol.window_start_ms(), spec.protocol.window_end_ms()),
        );
        info!(
            "[{}] {}: {} spikes, {} electrodes x {} samples",
            spec.name,
            RunStage::Measured,
            statistics.total_spikes,
            lfp.traces.len(),
            lfp.sample_count()
        );

        let metadata = RecordMetadata {
            condition: spec.name.clone(),
            description: spec.description.clone(),
            ad_stage: spec.pathophysiology.effective_stage(),
            ad_enabled: spec.pathophysiology.enabled,
            ad_populations: spec.pathophysiology.populations.clone(),
            protocol: spec.protocol.clone(),
            duration_ms: self.settings.duration_ms,
            recording_dt_ms: expected_dt,
            conductivity_s_per_m: self.settings.conductivity_s_per_m,
            pulse_count: train.n_pulses(),
            pulse_amplitude_na: train.amplitude_na(),
            stimulated_cells: stimuli.targeted_cells().len(),
            injections: stimuli.len(),
            warnings: stimuli.warnings().to_vec(),
            statistics,
        };
        Ok(SimulationOutput {
            spike_times: integrated
                .spikes
                .into_iter()
                .map(|(id, times)| (id.0, times))
                .collect(),
            cell_populations: populations.into_iter().map(|(id, p)| (id.0, p)).collect(),
            lfp,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        IntegrationOutput, ReferenceEngine, ReferenceEngineConfig, ReferenceEngineFactory, StimulusHandle,
    };
    use crate::error::EngineError;
    use crate::pathology::AdStage;
    use crate::stim::{CurrentInjection, InjectionSite, StimulusSet};

    fn factory() -> ReferenceEngineFactory {
        ReferenceEngineFactory::new(ReferenceEngineConfig {
            cell_counts: BTreeMap::from([("HL23PYR".to_string(), 3), ("HL23PV".to_string(), 1)]),
            ..Default::default()
        })
    }

    fn settings() -> RunSettings {
        RunSettings {
            duration_ms: 60.0,
            output: None,
            ..Default::default()
        }
    }

    fn spec(target: &str) -> ConditionSpec {
        ConditionSpec {
            name: "Healthy_60Vm".into(),
            description: "healthy".into(),
            pathophysiology: Pathophysiology::healthy(),
            protocol: StimulationProtocol::new(60.0, 100.0, 10.0, 50.0, 1.0, target, None).unwrap(),
        }
    }

    #[test]
    fn healthy_condition_runs_to_completion() {
        let (f, s, c) = (factory(), settings(), spec("HL23PYR"));
        let result = ConditionRunner::new(&f, &s).run(&c, &ProtocolSnapshot::capture(&c.protocol));
        assert_eq!(result.status, ConditionStatus::Succeeded);
        let output = result.output.unwrap();
        assert_eq!(output.metadata.pulse_count, 4);
        assert_eq!(output.metadata.stimulated_cells, 3);
        assert_eq!(output.metadata.injections, 3 * 4 * 2);
        assert_eq!(output.lfp.traces.len(), 5);
        assert!(output.lfp.traces.iter().all(|t| t.len() == 600));
        assert_eq!(output.cell_populations.len(), 4);
    }

    #[test]
    fn drifted_protocol_fails_at_configured() {
        let (f, s, c) = (factory(), settings(), spec("HL23PYR"));
        let other = StimulationProtocol::new(60.0, 100.0, 10.0, 50.0, 0.5, "HL23PYR", None).unwrap();
        let result = ConditionRunner::new(&f, &s).run(&c, &ProtocolSnapshot::capture(&other));
        match result.status {
            ConditionStatus::Failed { stage, reason } => {
                assert_eq!(stage, RunStage::Configured);
                assert!(reason.contains("width_ms"));
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn empty_target_population_warns_or_fails() {
        let f = factory();
        let c = spec("HL23SST");
        let snapshot = ProtocolSnapshot::capture(&c.protocol);

        let lenient = settings();
        let result = ConditionRunner::new(&f, &lenient).run(&c, &snapshot);
        let output = result.output.unwrap();
        assert_eq!(output.metadata.stimulated_cells, 0);
        assert_eq!(output.metadata.warnings.len(), 1);

        let strict = RunSettings {
            require_stimulated_cells: true,
            ..settings()
        };
        let result = ConditionRunner::new(&f, &strict).run(&c, &snapshot);
        assert!(matches!(
            result.status,
            ConditionStatus::Failed { stage: RunStage::Stimulated, .. }
        ));
    }

    #[test]
    fn persistence_failure_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();
        let s = RunSettings {
            output: Some(OutputTarget {
                dir: blocker,
                format: OutputFormat::Json,
            }),
            ..settings()
        };
        let (f, c) = (factory(), spec("HL23PYR"));
        let result = ConditionRunner::new(&f, &s).run(&c, &ProtocolSnapshot::capture(&c.protocol));
        assert!(matches!(
            result.status,
            ConditionStatus::Failed { stage: RunStage::Persisted, .. }
        ));
        assert!(result.output.is_some());
    }

    #[test]
    fn enabled_stage_zero_is_rejected() {
        let mut c = spec("HL23PYR");
        c.pathophysiology = Pathophysiology {
            stage: AdStage::Healthy,
            enabled: true,
            populations: vec!["HL23PYR".into()],
        };
        let err = StageFailure::new(RunStage::Configured, c.validate().unwrap_err());
        assert!(matches!(err.source, RtmsError::Config(ConfigError::HealthyStageEnabled { .. })));
    }

    /// Drops the last recorded sample of every segment.
    struct ShortRecordingFactory(ReferenceEngineFactory);

    struct ShortRecordingSession(ReferenceEngine);

    impl EngineSession for ShortRecordingSession {
        type Cell = <ReferenceEngine as EngineSession>::Cell;

        fn cells(&self) -> &[Self::Cell] {
            self.0.cells()
        }

        fn recording_dt_ms(&self) -> f64 {
            self.0.recording_dt_ms()
        }

        fn inject_current(
            &mut self,
            cell: CellId,
            site: &InjectionSite,
            injection: CurrentInjection,
        ) -> Result<StimulusHandle, EngineError> {
            self.0.inject_current(cell, site, injection)
        }

        fn integrate(&mut self, duration_ms: f64, stimuli: &StimulusSet) -> Result<IntegrationOutput, EngineError> {
            let mut out = self.0.integrate(duration_ms, stimuli)?;
            out.currents.n_samples -= 1;
            for trace in &mut out.currents.traces {
                trace.pop();
            }
            Ok(out)
        }
    }

    impl EngineFactory for ShortRecordingFactory {
        type Session = ShortRecordingSession;

        fn create(&self, pathology: &Pathophysiology) -> Result<ShortRecordingSession, EngineError> {
            self.0.create(pathology).map(ShortRecordingSession)
        }
    }

    #[test]
    fn empty_network_records_full_length_lfp() {
        let f = ReferenceEngineFactory::new(ReferenceEngineConfig {
            cell_counts: BTreeMap::from([("HL23PYR".to_string(), 0)]),
            ..Default::default()
        });
        let (s, c) = (settings(), spec("HL23PYR"));
        let result = ConditionRunner::new(&f, &s).run(&c, &ProtocolSnapshot::capture(&c.protocol));
        assert_eq!(result.status, ConditionStatus::Succeeded);
        let output = result.output.unwrap();
        assert_eq!(output.lfp.traces.len(), 5);
        assert!(output.lfp.traces.iter().all(|t| t.len() == 600));
        assert!(output.lfp.traces.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn short_recording_fails_at_measured() {
        let f = ShortRecordingFactory(factory());
        let (s, c) = (settings(), spec("HL23PYR"));
        let result = ConditionRunner::new(&f, &s).run(&c, &ProtocolSnapshot::capture(&c.protocol));
        match result.status {
            ConditionStatus::Failed { stage, reason } => {
                assert_eq!(stage, RunStage::Measured);
                assert!(reason.contains("599"));
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert!(result.output.is_none());
    }

    #[test]
    fn identical_protocol_passes_and_each_field_is_named() {
        let c = spec("HL23PYR");
        let snapshot = ProtocolSnapshot::capture(&c.protocol);
        assert!(snapshot.verify("same", &c.protocol.clone()).is_ok());

        let shifted = StimulationProtocol::new(60.0, 100.0, 10.0 + 1e-9, 50.0, 1.0, "HL23PYR", None).unwrap();
        match snapshot.verify("shifted", &shifted) {
            Err(ConfigError::ProtocolDrift { condition, field }) => {
                assert_eq!(condition, "shifted");
                assert_eq!(field, "stim_start_ms");
            }
            other => panic!("expected drift, got {:?}", other),
        }
    }
}
