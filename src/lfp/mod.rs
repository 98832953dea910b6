//! Point-source extracellular potential at virtual electrodes.
//!
//! `V(e, t) = 1 / (4πσ) · Σ_seg I_seg(t) / max(|r_seg − r_e|, r_min)`
//!
//! With currents in nA, distances in µm and σ in S/m the result is in mV.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use ultraviolet::Vec3;

use crate::config;
use crate::engine::TransmembraneCurrents;
use crate::error::ConsistencyError;
use crate::profile_scope;
use crate::units;

/// Electrode location in µm. Serialized as `[x, y, z]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct ElectrodePosition {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl From<[f32; 3]> for ElectrodePosition {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<ElectrodePosition> for [f32; 3] {
    fn from(e: ElectrodePosition) -> Self {
        [e.x, e.y, e.z]
    }
}

impl ElectrodePosition {
    pub fn to_vec3(self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    /// The default laminar array.
    pub fn default_array() -> Vec<ElectrodePosition> {
        config::DEFAULT_ELECTRODES.iter().copied().map(Self::from).collect()
    }
}

/// One trace per electrode, all at the recording resolution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LfpRecording {
    pub sample_dt_ms: f64,
    pub electrodes: Vec<ElectrodePosition>,
    /// `traces[electrode][sample]`, mV.
    pub traces: Vec<Vec<f64>>,
}

impl LfpRecording {
    pub fn sample_count(&self) -> usize {
        self.traces.first().map(Vec::len).unwrap_or(0)
    }

    pub fn time_ms(&self, sample: usize) -> f64 {
        sample as f64 * self.sample_dt_ms
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LfpSynthesizer {
    conductivity_s_per_m: f64,
    min_distance_um: f64,
}

impl Default for LfpSynthesizer {
    fn default() -> Self {
        Self::new(config::DEFAULT_CONDUCTIVITY_S_PER_M)
    }
}

impl LfpSynthesizer {
    pub fn new(conductivity_s_per_m: f64) -> Self {
        Self {
            conductivity_s_per_m,
            min_distance_um: config::LFP_MIN_DISTANCE_UM,
        }
    }

    pub fn with_min_distance(mut self, min_distance_um: f64) -> Self {
        self.min_distance_um = min_distance_um;
        self
    }

    pub fn conductivity(&self) -> f64 {
        self.conductivity_s_per_m
    }

    /// Sums every segment's contribution at every electrode. Electrodes are
    /// processed in parallel; output order follows `electrodes`.
    pub fn compute(
        &self,
        currents: &TransmembraneCurrents,
        electrodes: &[ElectrodePosition],
    ) -> Result<LfpRecording, ConsistencyError> {
        profile_scope!(LfpCompute);
        if currents.positions.len() != currents.traces.len() {
            return Err(ConsistencyError::SegmentCountMismatch {
                positions: currents.positions.len(),
                traces: currents.traces.len(),
            });
        }
        let n_samples = currents.sample_count();
        for (segment, trace) in currents.traces.iter().enumerate() {
            if trace.len() != n_samples {
                return Err(ConsistencyError::SegmentLengthMismatch {
                    segment,
                    expected: n_samples,
                    actual: trace.len(),
                });
            }
        }

        let prefactor = units::point_source_prefactor(self.conductivity_s_per_m);
        let traces: Vec<Vec<f64>> = electrodes
            .par_iter()
            .map(|electrode| {
                let e = electrode.to_vec3();
                let mut trace = vec![0.0; n_samples];
                for (pos, seg) in currents.positions.iter().zip(&currents.traces) {
                    let r = ((*pos - e).mag() as f64).max(self.min_distance_um);
                    let weight = prefactor / r;
                    for (v, i) in trace.iter_mut().zip(seg) {
                        *v += weight * i;
                    }
                }
                trace
            })
            .collect();

        debug!(
            "LFP: {} segments x {} samples -> {} electrodes",
            currents.segment_count(),
            n_samples,
            electrodes.len()
        );
        Ok(LfpRecording {
            sample_dt_ms: currents.sample_dt_ms,
            electrodes: electrodes.to_vec(),
            traces,
        })
    }
}
