//! Multi-condition study: configuration, orchestration and summary export.

pub mod config;
pub mod export;
pub mod runner;

pub use config::{ConditionEntry, EngineSection, RunSection, SuiteConfig};
pub use export::{export_summary, SummaryPaths};
pub use runner::{
    ConditionRecord, FailurePolicy, SuiteOrchestrator, SuiteOutcome, SuiteStatus, SuiteSummary,
};
