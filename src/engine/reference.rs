//! Deterministic reference engine.
//!
//! A seeded leaky integrate-and-fire surrogate of the L2/3 column: point
//! somata with passive dendritic segments, Poisson background drive, and a
//! dipolar current source per cell (soma current returned through the
//! dendrites). It satisfies the [`EngineSession`] contract so the pipeline
//! can run end to end; it is not a biophysical model.
//!
//! Placement and background drive depend only on the seed, so conditions of
//! a suite see the same network and the same input.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};
use ultraviolet::Vec3;

use super::{
    CellId, CellRecord, EngineFactory, EngineSession, IntegrationOutput, StimulusHandle,
    TransmembraneCurrents,
};
use crate::config;
use crate::error::EngineError;
use crate::pathology::{ChannelScaling, Pathophysiology};
use crate::stim::apply::{InjectionSite, StimulusSet};
use crate::stim::schedule::CurrentInjection;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceEngineConfig {
    pub cell_counts: BTreeMap<String, usize>,
    pub seed: u64,
    pub background_rate_hz: f64,
    /// Depolarization per background event (mV).
    pub background_weight_mv: f64,
    pub integration_dt_ms: f64,
    pub recording_dt_ms: f64,
    pub column_radius_um: f32,
    pub depth_range_um: [f32; 2],
}

impl Default for ReferenceEngineConfig {
    fn default() -> Self {
        Self {
            cell_counts: config::DEFAULT_CELL_COUNTS
                .iter()
                .map(|&(pop, n)| (pop.to_string(), n))
                .collect(),
            seed: config::DEFAULT_ENGINE_SEED,
            background_rate_hz: config::DEFAULT_BACKGROUND_RATE_HZ,
            background_weight_mv: 1.5,
            integration_dt_ms: config::DEFAULT_INTEGRATION_DT_MS,
            recording_dt_ms: config::DEFAULT_RECORDING_DT_MS,
            column_radius_um: config::COLUMN_RADIUS_UM,
            depth_range_um: [config::L23_DEPTH_UM.0, config::L23_DEPTH_UM.1],
        }
    }
}

impl ReferenceEngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let bad = |what: &str| Err(EngineError::Construction(what.to_string()));
        if !(self.integration_dt_ms > 0.0) || !self.integration_dt_ms.is_finite() {
            return bad("integration_dt_ms must be positive");
        }
        if !(self.recording_dt_ms >= self.integration_dt_ms) || !self.recording_dt_ms.is_finite() {
            return bad("recording_dt_ms must be >= integration_dt_ms");
        }
        let ratio = self.recording_dt_ms / self.integration_dt_ms;
        if (ratio - ratio.round()).abs() > 1e-6 {
            return bad("recording_dt_ms must be a multiple of integration_dt_ms");
        }
        if !(self.background_rate_hz >= 0.0) || !self.background_rate_hz.is_finite() {
            return bad("background_rate_hz must be non-negative");
        }
        if !(self.column_radius_um > 0.0) || !(self.depth_range_um[1] > self.depth_range_um[0]) {
            return bad("column geometry is degenerate");
        }
        Ok(())
    }

    fn record_every(&self) -> usize {
        (self.recording_dt_ms / self.integration_dt_ms).round().max(1.0) as usize
    }
}

/// Effective membrane parameters of one surrogate cell.
#[derive(Clone, Copy, Debug, PartialEq)]
struct CellParams {
    tau_m_ms: f64,
    r_m_mohm: f64,
    v_rest_mv: f64,
    v_threshold_mv: f64,
    v_reset_mv: f64,
    refractory_ms: f64,
    adaptation_na: f64,
    tau_adaptation_ms: f64,
    persistent_inward_na: f64,
    inactivation_per_spike: f64,
    spike_current_na: f64,
}

impl CellParams {
    fn base(population: &str) -> Self {
        let pyramidal = CellParams {
            tau_m_ms: 20.0,
            r_m_mohm: 100.0,
            v_rest_mv: -70.0,
            v_threshold_mv: -50.0,
            v_reset_mv: -65.0,
            refractory_ms: 2.0,
            adaptation_na: 0.02,
            tau_adaptation_ms: 100.0,
            persistent_inward_na: 0.0,
            inactivation_per_spike: 0.02,
            spike_current_na: 1.0,
        };
        match population {
            config::POP_PV => CellParams {
                tau_m_ms: 8.0,
                r_m_mohm: 80.0,
                refractory_ms: 1.0,
                adaptation_na: 0.0,
                inactivation_per_spike: 0.005,
                spike_current_na: 0.6,
                ..pyramidal
            },
            config::POP_SST | config::POP_VIP => CellParams {
                tau_m_ms: 15.0,
                r_m_mohm: 150.0,
                adaptation_na: 0.01,
                spike_current_na: 0.5,
                ..pyramidal
            },
            _ => pyramidal,
        }
    }

    /// Maps channel-density scaling onto the surrogate's parameters.
    fn scaled(self, s: &ChannelScaling) -> Self {
        let sodium_gain = 8.0 * (s.na_transient - 1.0) + 6.0 * (s.na_persistent - 1.0);
        let repolarization_loss = (1.0 - s.kv3_1) + (1.0 - s.k_transient);
        CellParams {
            tau_m_ms: self.tau_m_ms / s.leak,
            r_m_mohm: self.r_m_mohm / s.leak * (1.0 + 0.2 * (1.0 - s.ih)),
            v_threshold_mv: self.v_threshold_mv - sodium_gain,
            v_reset_mv: (self.v_reset_mv + 4.0 * repolarization_loss).min(self.v_threshold_mv - 1.0),
            adaptation_na: self.adaptation_na * s.sk,
            persistent_inward_na: self.persistent_inward_na + 0.5 * (s.na_persistent - 1.0),
            inactivation_per_spike: self.inactivation_per_spike * s.na_persistent / s.kv3_1,
            ..self
        }
    }
}

/// Sodium availability below which threshold crossings do not spike.
const BLOCK_AVAILABILITY: f64 = 0.3;
const TAU_RECOVERY_MS: f64 = 50.0;
const SPIKE_CURRENT_MS: f64 = 1.0;

#[derive(Clone, Debug)]
pub struct ReferenceCell {
    id: CellId,
    population: String,
    positions: Vec<Vec3>,
    params: CellParams,
}

impl CellRecord for ReferenceCell {
    fn id(&self) -> CellId {
        self.id
    }

    fn population(&self) -> &str {
        &self.population
    }

    fn segment_positions(&self) -> &[Vec3] {
        &self.positions
    }
}

#[derive(Clone, Copy, Debug)]
struct CellState {
    v: f64,
    w: f64,
    availability: f64,
    refractory_left_ms: f64,
    spike_current_left_ms: f64,
}

pub struct ReferenceEngine {
    config: ReferenceEngineConfig,
    cells: Vec<ReferenceCell>,
    pending: Vec<(u64, CellId, CurrentInjection)>,
    next_handle: u64,
}

impl ReferenceEngine {
    pub fn new(config: ReferenceEngineConfig, pathology: &Pathophysiology) -> Result<Self, EngineError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut cells = Vec::new();
        for (population, &count) in &config.cell_counts {
            let params = CellParams::base(population).scaled(&pathology.scaling_for(population));
            let spacing = if population == config::POP_PYR {
                config::SEGMENT_SPACING_UM
            } else {
                config::SEGMENT_SPACING_UM * 0.5
            };
            for _ in 0..count {
                let soma = random_soma(&mut rng, &config);
                // Apical direction points toward the pia (decreasing depth).
                let positions = (0..config::SEGMENTS_PER_CELL)
                    .map(|k| soma - Vec3::new(0.0, k as f32 * spacing, 0.0))
                    .collect();
                cells.push(ReferenceCell {
                    id: CellId(cells.len() as u32),
                    population: population.clone(),
                    positions,
                    params,
                });
            }
        }
        info!(
            "Reference engine: {} cells, AD stage {} ({})",
            cells.len(),
            pathology.effective_stage().number(),
            if pathology.enabled { "enabled" } else { "disabled" }
        );
        Ok(Self {
            config,
            cells,
            pending: Vec::new(),
            next_handle: 0,
        })
    }

    pub fn config(&self) -> &ReferenceEngineConfig {
        &self.config
    }

    /// Delivered injections per cell, sorted by onset.
    fn delivered_injections(&self, stimuli: &StimulusSet) -> Vec<Vec<CurrentInjection>> {
        let held: HashSet<u64> = stimuli.handles().iter().map(StimulusHandle::id).collect();
        let mut per_cell = vec![Vec::new(); self.cells.len()];
        let mut dropped = 0usize;
        for (handle, cell, injection) in &self.pending {
            if held.contains(handle) {
                per_cell[cell.0 as usize].push(*injection);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("{} injections not delivered: handles not held by caller", dropped);
        }
        for list in &mut per_cell {
            list.sort_by(|a: &CurrentInjection, b: &CurrentInjection| a.onset_ms.total_cmp(&b.onset_ms));
        }
        per_cell
    }
}

fn random_soma(rng: &mut StdRng, config: &ReferenceEngineConfig) -> Vec3 {
    let r = config.column_radius_um * rng.random::<f32>().sqrt();
    let theta = rng.random::<f32>() * std::f32::consts::TAU;
    let depth = rng.random_range(config.depth_range_um[0]..config.depth_range_um[1]);
    Vec3::new(r * theta.cos(), depth, r * theta.sin())
}

impl EngineSession for ReferenceEngine {
    type Cell = ReferenceCell;

    fn cells(&self) -> &[ReferenceCell] {
        &self.cells
    }

    fn recording_dt_ms(&self) -> f64 {
        self.config.recording_dt_ms
    }

    fn inject_current(
        &mut self,
        cell: CellId,
        site: &InjectionSite,
        injection: CurrentInjection,
    ) -> Result<StimulusHandle, EngineError> {
        if cell.0 as usize >= self.cells.len() {
            return Err(EngineError::UnknownCell(cell.0));
        }
        if site.section != config::INJECTION_SECTION || !(0.0..=1.0).contains(&site.loc) {
            return Err(EngineError::InvalidInjection(format!(
                "no section {}({})",
                site.section, site.loc
            )));
        }
        if !injection.amplitude_na.is_finite()
            || !injection.onset_ms.is_finite()
            || injection.onset_ms < 0.0
            || !(injection.duration_ms > 0.0)
        {
            return Err(EngineError::InvalidInjection(format!("{:?}", injection)));
        }
        let id = self.next_handle;
        self.next_handle += 1;
        self.pending.push((id, cell, injection));
        Ok(StimulusHandle::new(id, cell))
    }

    fn integrate(
        &mut self,
        duration_ms: f64,
        stimuli: &StimulusSet,
    ) -> Result<IntegrationOutput, EngineError> {
        if !(duration_ms > 0.0) || !duration_ms.is_finite() {
            return Err(EngineError::Integration {
                time_ms: 0.0,
                reason: format!("invalid duration {}", duration_ms),
            });
        }
        let dt = self.config.integration_dt_ms;
        let record_every = self.config.record_every();
        let n_samples = (duration_ms / self.config.recording_dt_ms).round() as usize;
        let n_steps = n_samples * record_every;
        let segments = config::SEGMENTS_PER_CELL;

        let injections = self.delivered_injections(stimuli);
        let mut cursors = vec![0usize; self.cells.len()];
        let mut states: Vec<CellState> = self
            .cells
            .iter()
            .map(|c| CellState {
                v: c.params.v_rest_mv,
                w: 0.0,
                availability: 1.0,
                refractory_left_ms: 0.0,
                spike_current_left_ms: 0.0,
            })
            .collect();

        let lambda = self.config.background_rate_hz * dt / 1000.0;
        let background = if lambda > 0.0 {
            Some(Poisson::new(lambda).map_err(|e| EngineError::Integration {
                time_ms: 0.0,
                reason: format!("background drive: {}", e),
            })?)
        } else {
            None
        };
        // Offset from the placement stream so drive and geometry are independent.
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));

        let positions: Vec<Vec3> = self.cells.iter().flat_map(|c| c.positions.iter().copied()).collect();
        let mut traces = vec![Vec::with_capacity(n_samples); positions.len()];
        let mut spikes: BTreeMap<CellId, Vec<f64>> = BTreeMap::new();

        for step in 0..n_steps {
            let t = step as f64 * dt;
            let record = step % record_every == 0;

            for (idx, cell) in self.cells.iter().enumerate() {
                let p = &cell.params;
                let state = &mut states[idx];

                let list = &injections[idx];
                let cursor = &mut cursors[idx];
                while *cursor < list.len() && list[*cursor].end_ms() <= t {
                    *cursor += 1;
                }
                let i_inj = list
                    .get(*cursor)
                    .filter(|inj| inj.is_active(t))
                    .map(|inj| inj.amplitude_na)
                    .unwrap_or(0.0);

                if record {
                    let mut i_soma = (state.v - p.v_rest_mv) / p.r_m_mohm;
                    if state.spike_current_left_ms > 0.0 {
                        i_soma += p.spike_current_na;
                    }
                    let base = idx * segments;
                    traces[base].push(i_soma);
                    let returned = -i_soma / (segments - 1) as f64;
                    for seg in 1..segments {
                        traces[base + seg].push(returned);
                    }
                }

                if let Some(dist) = &background {
                    let events: f64 = dist.sample(&mut rng);
                    state.v += self.config.background_weight_mv * events;
                }

                let drive = p.r_m_mohm * (i_inj + p.persistent_inward_na - state.w);
                state.v += dt / p.tau_m_ms * (-(state.v - p.v_rest_mv) + drive);
                state.w -= dt / p.tau_adaptation_ms * state.w;
                state.availability += dt / TAU_RECOVERY_MS * (1.0 - state.availability);
                state.spike_current_left_ms = (state.spike_current_left_ms - dt).max(0.0);

                if state.refractory_left_ms > 0.0 {
                    state.refractory_left_ms -= dt;
                    state.v = p.v_reset_mv;
                } else if state.v >= p.v_threshold_mv {
                    if state.availability > BLOCK_AVAILABILITY {
                        spikes.entry(cell.id).or_default().push(t + dt);
                        state.v = p.v_reset_mv;
                        state.w += p.adaptation_na;
                        state.availability = (state.availability - p.inactivation_per_spike).max(0.0);
                        state.refractory_left_ms = p.refractory_ms;
                        state.spike_current_left_ms = SPIKE_CURRENT_MS;
                    } else {
                        // Depolarization block: held at threshold without firing.
                        state.v = p.v_threshold_mv;
                    }
                }

                if !state.v.is_finite() {
                    return Err(EngineError::Integration {
                        time_ms: t,
                        reason: format!("membrane potential of cell {} diverged", cell.id),
                    });
                }
            }
        }

        let total: usize = spikes.values().map(Vec::len).sum();
        info!(
            "Integrated {} ms: {} spikes, {} samples x {} segments",
            duration_ms,
            total,
            n_samples,
            positions.len()
        );

        Ok(IntegrationOutput {
            spikes,
            currents: TransmembraneCurrents {
                sample_dt_ms: self.config.recording_dt_ms,
                n_samples,
                positions,
                traces,
            },
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReferenceEngineFactory {
    config: ReferenceEngineConfig,
}

impl ReferenceEngineFactory {
    pub fn new(config: ReferenceEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReferenceEngineConfig {
        &self.config
    }
}

impl EngineFactory for ReferenceEngineFactory {
    type Session = ReferenceEngine;

    fn create(&self, pathology: &Pathophysiology) -> Result<ReferenceEngine, EngineError> {
        ReferenceEngine::new(self.config.clone(), pathology)
    }
}
