//! Binding a pulse train to the target population of an engine session.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ultraviolet::Vec3;

use crate::config;
use crate::engine::{CellId, CellRecord, EngineSession, StimulusHandle};
use crate::error::EngineError;
use crate::stim::protocol::StimulationProtocol;
use crate::stim::schedule::PulseTrain;

/// Location of every rTMS injection on a cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InjectionSite {
    pub section: String,
    pub loc: f64,
}

impl InjectionSite {
    pub fn soma() -> Self {
        Self {
            section: config::INJECTION_SECTION.to_string(),
            loc: config::INJECTION_LOC,
        }
    }
}

/// Owned stimulus handles for one condition.
///
/// Must be kept alive until integration returns; the engine only delivers
/// stimuli whose handles are passed to [`EngineSession::integrate`].
#[must_use = "dropping the stimulus set before integration removes the stimulation"]
#[derive(Debug, Default)]
pub struct StimulusSet {
    handles: Vec<StimulusHandle>,
    targeted_cells: Vec<CellId>,
    pulses_per_cell: usize,
    warnings: Vec<String>,
}

impl StimulusSet {
    pub fn handles(&self) -> &[StimulusHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn targeted_cells(&self) -> &[CellId] {
        &self.targeted_cells
    }

    pub fn pulses_per_cell(&self) -> usize {
        self.pulses_per_cell
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn contains(&self, handle_id: u64) -> bool {
        self.handles.iter().any(|h| h.id() == handle_id)
    }
}

#[derive(Clone, Debug)]
pub struct StimulationApplicator {
    site: InjectionSite,
}

impl Default for StimulationApplicator {
    fn default() -> Self {
        Self::new(InjectionSite::soma())
    }
}

impl StimulationApplicator {
    pub fn new(site: InjectionSite) -> Self {
        Self { site }
    }

    pub fn site(&self) -> &InjectionSite {
        &self.site
    }

    /// Injects both phases of every pulse into every cell of the target
    /// population. An empty population yields an empty set with a warning.
    pub fn apply<S: EngineSession>(
        &self,
        train: &PulseTrain,
        protocol: &StimulationProtocol,
        session: &mut S,
    ) -> Result<StimulusSet, EngineError> {
        let target = protocol.target_population();
        let targets: Vec<(CellId, f64)> = session
            .cells()
            .iter()
            .filter(|cell| cell.population() == target)
            .map(|cell| {
                let scale = protocol
                    .spatial()
                    .map(|field| {
                        let soma = cell
                            .segment_positions()
                            .first()
                            .copied()
                            .unwrap_or_else(Vec3::zero);
                        field.scale(soma, cell.somatodendritic_axis())
                    })
                    .unwrap_or(1.0);
                (cell.id(), scale)
            })
            .collect();

        let mut set = StimulusSet {
            pulses_per_cell: train.n_pulses(),
            ..Default::default()
        };

        if targets.is_empty() {
            let message = format!("target population `{}` has no cells; nothing stimulated", target);
            warn!("{}", message);
            set.warnings.push(message);
            return Ok(set);
        }

        for (cell, scale) in targets {
            for pulse in train.restart() {
                for injection in pulse.injections(scale) {
                    let handle = session.inject_current(cell, &self.site, injection)?;
                    set.handles.push(handle);
                }
            }
            debug!("cell {} stimulated with amplitude scale {:.3}", cell, scale);
            set.targeted_cells.push(cell);
        }

        info!(
            "Applied {} pulses ({:.4} nA) to {} cells of {}: {} injections",
            set.pulses_per_cell,
            train.amplitude_na(),
            set.targeted_cells.len(),
            target,
            set.handles.len()
        );
        Ok(set)
    }
}
