//! Error taxonomy for the stimulation and recording pipeline.
//!
//! - [`ConfigError`]: invalid or missing protocol fields, protocol drift.
//!   Always raised before any simulation work.
//! - [`EngineError`]: the engine collaborator failed to build or integrate.
//! - [`ConsistencyError`]: internally inconsistent measurements.
//! - [`PersistenceError`]: an output record could not be written or read.

use std::path::PathBuf;

use thiserror::Error;

use crate::condition::RunStage;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required parameter `{0}`")]
    MissingField(&'static str),

    #[error("parameter `{field}` must be finite (got {value})")]
    NonFinite { field: &'static str, value: f64 },

    #[error("frequency must be positive (got {0} Hz)")]
    NonPositiveFrequency(f64),

    #[error("stimulation window is empty: end {end_ms} ms <= start {start_ms} ms")]
    EmptyWindow { start_ms: f64, end_ms: f64 },

    #[error("pulse width must be positive (got {0} ms)")]
    NonPositiveWidth(f64),

    #[error("pulses would overlap: width {width_ms} ms >= period {period_ms} ms")]
    OverlappingPulses { width_ms: f64, period_ms: f64 },

    #[error("unknown AD stage {0} (expected 0, 1, 2 or 3)")]
    UnknownStage(u8),

    #[error("condition `{condition}` enables pathophysiology with stage 0")]
    HealthyStageEnabled { condition: String },

    #[error("unknown cell population `{0}`")]
    UnknownPopulation(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("duplicate condition name `{0}`")]
    DuplicateCondition(String),

    #[error("no condition named `{0}`")]
    NoSuchCondition(String),

    #[error("protocol drift in condition `{condition}`: `{field}` differs from the reference protocol")]
    ProtocolDrift { condition: String, field: &'static str },

    #[error("invalid run setting `{field}`: {reason}")]
    InvalidRunSetting { field: &'static str, reason: String },

    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write configuration {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine construction failed: {0}")]
    Construction(String),

    #[error("no cell with id {0}")]
    UnknownCell(u32),

    #[error("invalid injection: {0}")]
    InvalidInjection(String),

    #[error("integration failed at t = {time_ms} ms: {reason}")]
    Integration { time_ms: f64, reason: String },
}

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("segment {segment} has {actual} current samples, expected {expected}")]
    SegmentLengthMismatch {
        segment: usize,
        expected: usize,
        actual: usize,
    },

    #[error("electrode {electrode} produced {actual} samples, expected {expected}")]
    ElectrodeLengthMismatch {
        electrode: usize,
        expected: usize,
        actual: usize,
    },

    #[error("engine recorded {actual} samples, expected {expected}")]
    SampleCountMismatch { expected: usize, actual: usize },

    #[error("recording resolution {actual} ms does not match the configured {expected} ms")]
    ResolutionMismatch { expected: f64, actual: f64 },

    #[error("{positions} segment positions but {traces} current traces")]
    SegmentCountMismatch { positions: usize, traces: usize },

    #[error("target population `{0}` selected zero cells")]
    EmptyTargetPopulation(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary encoding error: {0}")]
    Binary(#[from] bincode::Error),
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum RtmsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// A condition aborted in `stage`.
#[derive(Debug, Error)]
#[error("stage {stage} failed: {source}")]
pub struct StageFailure {
    pub stage: RunStage,
    #[source]
    pub source: RtmsError,
}

impl StageFailure {
    pub fn new(stage: RunStage, source: impl Into<RtmsError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

pub type Result<T, E = RtmsError> = std::result::Result<T, E>;
