//! Contract between the pipeline and the compartmental simulation engine.
//!
//! The pipeline never touches global simulation state: every operation goes
//! through an explicit [`EngineSession`] created by an [`EngineFactory`], one
//! session per condition.

pub mod reference;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ultraviolet::Vec3;

use crate::error::EngineError;
use crate::pathology::Pathophysiology;
use crate::stim::apply::{InjectionSite, StimulusSet};
use crate::stim::schedule::CurrentInjection;

pub use reference::{ReferenceEngine, ReferenceEngineConfig, ReferenceEngineFactory};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(pub u32);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the pipeline may read from an engine-owned cell.
pub trait CellRecord {
    fn id(&self) -> CellId;

    /// Population tag, e.g. `HL23PYR`.
    fn population(&self) -> &str;

    /// Key into the field-conversion geometry table.
    fn cell_type(&self) -> &str {
        self.population()
    }

    /// Segment midpoints in µm; the first entry is the soma.
    fn segment_positions(&self) -> &[Vec3];

    /// Soma → most distal segment; zero for single-segment cells.
    fn somatodendritic_axis(&self) -> Vec3 {
        match self.segment_positions() {
            [soma, .., distal] => *distal - *soma,
            _ => Vec3::zero(),
        }
    }
}

/// Opaque token for one engine-side current injection.
///
/// Deliberately neither `Clone` nor `Copy`: the [`StimulusSet`] holding it is
/// the single owner, and integration borrows that set.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StimulusHandle {
    id: u64,
    cell: CellId,
}

impl StimulusHandle {
    /// Issued by engine implementations only.
    pub fn new(id: u64, cell: CellId) -> Self {
        Self { id, cell }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }
}

/// Per-segment transmembrane currents sampled at the recording resolution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransmembraneCurrents {
    pub sample_dt_ms: f64,
    /// Samples recorded per segment; also holds when there are no segments.
    pub n_samples: usize,
    pub positions: Vec<Vec3>,
    /// `traces[segment][sample]`, nA.
    pub traces: Vec<Vec<f64>>,
}

impl TransmembraneCurrents {
    pub fn segment_count(&self) -> usize {
        self.positions.len()
    }

    pub fn sample_count(&self) -> usize {
        self.n_samples
    }
}

#[derive(Clone, Debug, Default)]
pub struct IntegrationOutput {
    /// Spike times (ms) per cell, in ascending order.
    pub spikes: BTreeMap<CellId, Vec<f64>>,
    pub currents: TransmembraneCurrents,
}

/// One engine instance bound to a single condition.
pub trait EngineSession {
    type Cell: CellRecord;

    fn cells(&self) -> &[Self::Cell];

    /// Resolution at which currents are recorded.
    fn recording_dt_ms(&self) -> f64;

    fn inject_current(
        &mut self,
        cell: CellId,
        site: &InjectionSite,
        injection: CurrentInjection,
    ) -> Result<StimulusHandle, EngineError>;

    /// Blocking time integration. Only stimuli whose handles are in
    /// `stimuli` are delivered.
    fn integrate(
        &mut self,
        duration_ms: f64,
        stimuli: &StimulusSet,
    ) -> Result<IntegrationOutput, EngineError>;
}

/// Builds a fresh session per condition.
pub trait EngineFactory {
    type Session: EngineSession;

    fn create(&self, pathology: &Pathophysiology) -> Result<Self::Session, EngineError>;
}

impl<F: EngineFactory + ?Sized> EngineFactory for &F {
    type Session = F::Session;

    fn create(&self, pathology: &Pathophysiology) -> Result<Self::Session, EngineError> {
        (**self).create(pathology)
    }
}
