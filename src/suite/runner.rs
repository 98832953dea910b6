use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

use super::export::{export_summary, SummaryPaths};
use crate::condition::{
    ConditionResult, ConditionRunner, ConditionSpec, ConditionStatus, ProtocolSnapshot, RunSettings,
};
use crate::engine::EngineFactory;
use crate::error::{ConfigError, PersistenceError};
use crate::io::RecordMetadata;
use crate::pathology::AdStage;
use crate::profile_scope;

/// What happens to the remaining conditions after one fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    AbortRemaining,
    Continue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuiteStatus {
    /// Every condition succeeded.
    Complete,
    /// Every condition was attempted; at least one failed.
    Partial,
    /// A failure stopped the suite before every condition was attempted.
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionRecord {
    pub name: String,
    pub description: String,
    pub ad_stage: AdStage,
    pub ad_enabled: bool,
    #[serde(flatten)]
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RecordMetadata>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub study_name: String,
    pub status: SuiteStatus,
    pub records: Vec<ConditionRecord>,
}

impl SuiteSummary {
    pub fn failed(&self) -> impl Iterator<Item = &ConditionRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.status, ConditionStatus::Failed { .. }))
    }

    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| r.status.is_success()).count()
    }
}

/// Summary plus the full per-condition results, in condition order.
#[derive(Debug)]
pub struct SuiteOutcome {
    pub summary: SuiteSummary,
    pub results: Vec<ConditionResult>,
}

/// Runs conditions one after another, each on a fresh engine session.
pub struct SuiteOrchestrator<F> {
    study_name: String,
    factory: F,
    settings: RunSettings,
    policy: FailurePolicy,
}

impl<F: EngineFactory> SuiteOrchestrator<F> {
    pub fn new(study_name: impl Into<String>, factory: F, settings: RunSettings) -> Self {
        Self {
            study_name: study_name.into(),
            factory,
            settings,
            policy: FailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Rejects the suite before any simulation: invalid settings, invalid or
    /// duplicate conditions, or any protocol that is not bit-identical to the
    /// first condition's.
    pub fn preflight(&self, conditions: &[ConditionSpec]) -> Result<ProtocolSnapshot, ConfigError> {
        self.settings.validate()?;
        let first = conditions.first().ok_or(ConfigError::Empty("conditions"))?;
        let snapshot = ProtocolSnapshot::capture(&first.protocol);
        self.settings.check_protocol(snapshot.protocol())?;

        let mut names = HashSet::new();
        for spec in conditions {
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateCondition(spec.name.clone()));
            }
            spec.validate()?;
            snapshot.verify(&spec.name, &spec.protocol)?;
        }
        Ok(snapshot)
    }

    pub fn run_suite(&self, conditions: &[ConditionSpec]) -> Result<SuiteOutcome, ConfigError> {
        profile_scope!(Suite);
        let snapshot = self.preflight(conditions)?;
        info!(
            "Suite {}: {} conditions, policy {:?}",
            self.study_name,
            conditions.len(),
            self.policy
        );

        let runner = ConditionRunner::new(&self.factory, &self.settings);
        let mut results = Vec::with_capacity(conditions.len());
        let mut aborted = false;
        for spec in conditions {
            if aborted {
                results.push(ConditionResult::not_attempted(&spec.name));
                continue;
            }
            let result = runner.run(spec, &snapshot);
            if !result.status.is_success() && self.policy == FailurePolicy::AbortRemaining {
                warn!("Aborting remaining conditions after {} failed", spec.name);
                aborted = true;
            }
            results.push(result);
        }

        let summary = self.summarize(conditions, &results);
        info!(
            "Suite {} finished {:?}: {}/{} succeeded",
            self.study_name,
            summary.status,
            summary.succeeded(),
            summary.records.len()
        );
        Ok(SuiteOutcome { summary, results })
    }

    /// Runs a single named condition, after the same pre-flight as a full suite.
    pub fn run_condition(&self, conditions: &[ConditionSpec], name: &str) -> Result<ConditionResult, ConfigError> {
        let snapshot = self.preflight(conditions)?;
        let spec = conditions
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigError::NoSuchCondition(name.to_string()))?;
        Ok(ConditionRunner::new(&self.factory, &self.settings).run(spec, &snapshot))
    }

    /// Writes the summary next to the condition records; `None` when
    /// persistence is disabled.
    pub fn persist_summary(&self, summary: &SuiteSummary) -> Result<Option<SummaryPaths>, PersistenceError> {
        match &self.settings.output {
            Some(target) => export_summary(&target.dir, summary).map(Some),
            None => Ok(None),
        }
    }

    fn summarize(&self, conditions: &[ConditionSpec], results: &[ConditionResult]) -> SuiteSummary {
        let records: Vec<ConditionRecord> = conditions
            .iter()
            .zip(results)
            .map(|(spec, result)| ConditionRecord {
                name: spec.name.clone(),
                description: spec.description.clone(),
                ad_stage: spec.pathophysiology.effective_stage(),
                ad_enabled: spec.pathophysiology.enabled,
                status: result.status.clone(),
                record_path: result.persisted.as_ref().map(|p| p.record.clone()),
                metadata: result.output.as_ref().map(|o| o.metadata.clone()),
            })
            .collect();

        let status = if records.iter().all(|r| r.status.is_success()) {
            SuiteStatus::Complete
        } else if records.iter().any(|r| r.status == ConditionStatus::NotAttempted) {
            SuiteStatus::Aborted
        } else {
            SuiteStatus::Partial
        };
        SuiteSummary {
            study_name: self.study_name.clone(),
            status,
            records,
        }
    }
}
