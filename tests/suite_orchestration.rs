use std::cell::Cell;
use std::collections::BTreeMap;

use rtms_lfp::condition::{ConditionSpec, ConditionStatus, OutputTarget, RunSettings, RunStage};
use rtms_lfp::engine::{
    EngineFactory, EngineSession, IntegrationOutput, ReferenceEngine, ReferenceEngineConfig,
    ReferenceEngineFactory, StimulusHandle,
};
use rtms_lfp::error::{ConfigError, EngineError};
use rtms_lfp::io::{load_output, OutputFormat};
use rtms_lfp::pathology::{AdStage, Pathophysiology};
use rtms_lfp::stim::{CurrentInjection, InjectionSite, StimulationProtocol, StimulusSet};
use rtms_lfp::suite::{FailurePolicy, SuiteConfig, SuiteOrchestrator, SuiteStatus};

fn engine_config() -> ReferenceEngineConfig {
    ReferenceEngineConfig {
        cell_counts: BTreeMap::from([("HL23PYR".to_string(), 4), ("HL23PV".to_string(), 1)]),
        ..Default::default()
    }
}

fn protocol() -> StimulationProtocol {
    StimulationProtocol::new(60.0, 50.0, 20.0, 80.0, 1.0, "HL23PYR", None).unwrap()
}

fn conditions() -> Vec<ConditionSpec> {
    [
        ("Healthy_60Vm", Pathophysiology::healthy()),
        (
            "AD1_60Vm",
            Pathophysiology::staged(AdStage::Hyperexcitable, vec!["HL23PYR".into()]),
        ),
        (
            "AD3_60Vm",
            Pathophysiology::staged(AdStage::DepolarizationBlockProne, vec!["HL23PYR".into()]),
        ),
    ]
    .into_iter()
    .map(|(name, pathophysiology)| ConditionSpec {
        name: name.to_string(),
        description: pathophysiology.effective_stage().description().to_string(),
        pathophysiology,
        protocol: protocol(),
    })
    .collect()
}

fn settings(output: Option<OutputTarget>) -> RunSettings {
    RunSettings {
        duration_ms: 100.0,
        output,
        ..Default::default()
    }
}

/// Reference engine whose integration fails for one AD stage.
struct FlakyFactory {
    inner: ReferenceEngineFactory,
    failing_stage: AdStage,
    created: Cell<usize>,
}

impl FlakyFactory {
    fn new(failing_stage: AdStage) -> Self {
        Self {
            inner: ReferenceEngineFactory::new(engine_config()),
            failing_stage,
            created: Cell::new(0),
        }
    }
}

struct FlakySession {
    inner: ReferenceEngine,
    fail: bool,
}

impl EngineSession for FlakySession {
    type Cell = <ReferenceEngine as EngineSession>::Cell;

    fn cells(&self) -> &[Self::Cell] {
        self.inner.cells()
    }

    fn recording_dt_ms(&self) -> f64 {
        self.inner.recording_dt_ms()
    }

    fn inject_current(
        &mut self,
        cell: rtms_lfp::engine::CellId,
        site: &InjectionSite,
        injection: CurrentInjection,
    ) -> Result<StimulusHandle, EngineError> {
        self.inner.inject_current(cell, site, injection)
    }

    fn integrate(&mut self, duration_ms: f64, stimuli: &StimulusSet) -> Result<IntegrationOutput, EngineError> {
        if self.fail {
            return Err(EngineError::Integration {
                time_ms: duration_ms / 2.0,
                reason: "solver diverged".into(),
            });
        }
        self.inner.integrate(duration_ms, stimuli)
    }
}

impl EngineFactory for FlakyFactory {
    type Session = FlakySession;

    fn create(&self, pathology: &Pathophysiology) -> Result<FlakySession, EngineError> {
        self.created.set(self.created.get() + 1);
        Ok(FlakySession {
            inner: self.inner.create(pathology)?,
            fail: pathology.effective_stage() == self.failing_stage,
        })
    }
}

#[test]
fn identical_protocols_run_to_completion_and_persist() {
    let dir = tempfile::tempdir().unwrap();
    let target = OutputTarget {
        dir: dir.path().to_path_buf(),
        format: OutputFormat::Binary,
    };
    let orchestrator = SuiteOrchestrator::new(
        "suite",
        ReferenceEngineFactory::new(engine_config()),
        settings(Some(target)),
    );
    let outcome = orchestrator.run_suite(&conditions()).unwrap();
    assert_eq!(outcome.summary.status, SuiteStatus::Complete);

    let outputs: Vec<_> = outcome
        .results
        .iter()
        .map(|r| r.output.as_ref().unwrap())
        .collect();
    for output in &outputs {
        assert_eq!(output.metadata.protocol, protocol());
        assert_eq!(output.metadata.pulse_count, 3);
        assert_eq!(output.metadata.stimulated_cells, 4);
        assert_eq!(output.lfp.traces.len(), 5);
        assert!(output.lfp.traces.iter().all(|t| t.len() == 1000));
    }
    assert_eq!(outputs[0].cell_populations, outputs[2].cell_populations);
    let recorded: Vec<Vec<u8>> = outputs.iter().map(|o| o.metadata.protocol.fingerprint().unwrap()).collect();
    assert!(recorded.windows(2).all(|w| w[0] == w[1]));

    let paths = outcome.results[1].persisted.as_ref().unwrap();
    assert_eq!(&load_output(&paths.record).unwrap(), outputs[1]);
    assert!(paths.lfp_csv.exists());

    let summary_paths = orchestrator.persist_summary(&outcome.summary).unwrap().unwrap();
    assert!(summary_paths.json.ends_with("suite_summary.json"));
    assert!(summary_paths.csv.exists());
}

#[test]
fn integration_failure_aborts_remaining_by_default() {
    let orchestrator = SuiteOrchestrator::new("s", FlakyFactory::new(AdStage::Hyperexcitable), settings(None));
    let outcome = orchestrator.run_suite(&conditions()).unwrap();
    let statuses: Vec<_> = outcome.summary.records.iter().map(|r| r.status.clone()).collect();
    assert_eq!(statuses[0], ConditionStatus::Succeeded);
    assert!(matches!(
        &statuses[1],
        ConditionStatus::Failed { stage: RunStage::Integrated, reason } if reason.contains("solver diverged")
    ));
    assert_eq!(statuses[2], ConditionStatus::NotAttempted);
    assert_eq!(outcome.summary.status, SuiteStatus::Aborted);
    assert!(outcome.results[0].output.is_some());
}

#[test]
fn continue_policy_attempts_every_condition() {
    let orchestrator = SuiteOrchestrator::new("s", FlakyFactory::new(AdStage::Hyperexcitable), settings(None))
        .with_policy(FailurePolicy::Continue);
    let outcome = orchestrator.run_suite(&conditions()).unwrap();
    assert_eq!(outcome.summary.status, SuiteStatus::Partial);
    assert_eq!(outcome.summary.succeeded(), 2);
    let failed: Vec<_> = outcome.summary.failed().map(|r| r.name.as_str()).collect();
    assert_eq!(failed, ["AD1_60Vm"]);
}

#[test]
fn drift_is_rejected_before_any_session_exists() {
    let factory = FlakyFactory::new(AdStage::Impaired);
    let mut specs = conditions();
    specs[2].protocol = StimulationProtocol::new(60.0, 50.0, 20.0, 80.0, 1.0 + 1e-12, "HL23PYR", None).unwrap();
    let orchestrator = SuiteOrchestrator::new("s", &factory, settings(None));
    match orchestrator.run_suite(&specs) {
        Err(ConfigError::ProtocolDrift { condition, field }) => {
            assert_eq!(condition, "AD3_60Vm");
            assert_eq!(field, "width_ms");
        }
        other => panic!("expected drift, got {:?}", other.map(|o| o.summary)),
    }
    assert_eq!(factory.created.get(), 0);
}

#[test]
fn single_condition_runs_by_name() {
    let orchestrator = SuiteOrchestrator::new(
        "s",
        ReferenceEngineFactory::new(engine_config()),
        settings(None),
    );
    let result = orchestrator.run_condition(&conditions(), "AD3_60Vm").unwrap();
    assert_eq!(result.status, ConditionStatus::Succeeded);
    assert_eq!(
        result.output.unwrap().metadata.ad_stage,
        AdStage::DepolarizationBlockProne
    );
    assert!(matches!(
        orchestrator.run_condition(&conditions(), "AD2_60Vm"),
        Err(ConfigError::NoSuchCondition(_))
    ));
}

#[test]
fn generated_config_builds_identical_protocols() {
    let config = SuiteConfig::generate_ad_suite("rtms".into());
    let specs = config.build_conditions().unwrap();
    let fingerprints: Vec<_> = specs.iter().map(|s| s.protocol.fingerprint().unwrap()).collect();
    assert!(fingerprints.windows(2).all(|w| w[0] == w[1]));
    assert!(!specs[0].pathophysiology.enabled);
    assert_eq!(specs[2].pathophysiology.stage, AdStage::DepolarizationBlockProne);
    assert_eq!(config.run_settings().unwrap().duration_ms, 3000.0);
}
