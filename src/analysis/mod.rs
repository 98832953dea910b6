//! Post-integration statistics stored with each condition record.

pub mod spectrum;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::CellId;
use crate::lfp::LfpRecording;
use crate::profile_scope;
use crate::units;

pub use spectrum::{welch_psd, PowerSpectrum, WELCH_SEGMENT_LEN};

/// Bin width of the firing-rate histogram (ms).
pub const RATE_BIN_MS: f64 = 50.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PopulationRate {
    pub population: String,
    pub cells: usize,
    pub spikes: usize,
    /// Mean rate per cell over the whole run (Hz).
    pub rate_hz: f64,
}

/// Mean per-cell firing rate for every population in `populations`.
pub fn population_rates(
    spikes: &BTreeMap<CellId, Vec<f64>>,
    populations: &BTreeMap<CellId, String>,
    duration_ms: f64,
) -> Vec<PopulationRate> {
    let mut table: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for (cell, population) in populations {
        let entry = table.entry(population.as_str()).or_default();
        entry.0 += 1;
        entry.1 += spikes.get(cell).map(Vec::len).unwrap_or(0);
    }
    let seconds = duration_ms / units::MS_PER_SECOND;
    table
        .into_iter()
        .map(|(population, (cells, count))| PopulationRate {
            population: population.to_string(),
            cells,
            spikes: count,
            rate_hz: if cells > 0 && seconds > 0.0 {
                count as f64 / seconds / cells as f64
            } else {
                0.0
            },
        })
        .collect()
}

/// Per-cell firing rate (Hz) in consecutive `bin_ms` bins for one population.
pub fn rate_histogram(
    spikes: &BTreeMap<CellId, Vec<f64>>,
    cells: &[CellId],
    duration_ms: f64,
    bin_ms: f64,
) -> Vec<f64> {
    let n_bins = (duration_ms / bin_ms).ceil().max(0.0) as usize;
    let mut counts = vec![0usize; n_bins];
    for cell in cells {
        for &t in spikes.get(cell).into_iter().flatten() {
            let bin = (t / bin_ms) as usize;
            if t >= 0.0 && bin < n_bins {
                counts[bin] += 1;
            }
        }
    }
    let norm = bin_ms / units::MS_PER_SECOND * cells.len().max(1) as f64;
    counts.into_iter().map(|c| c as f64 / norm).collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateHistogram {
    pub population: String,
    pub bin_ms: f64,
    /// Per-cell rate (Hz) in each bin, starting at t = 0.
    pub rates_hz: Vec<f64>,
}

/// One [`RATE_BIN_MS`] histogram per population.
pub fn population_histograms(
    spikes: &BTreeMap<CellId, Vec<f64>>,
    populations: &BTreeMap<CellId, String>,
    duration_ms: f64,
) -> Vec<RateHistogram> {
    let mut members: BTreeMap<&str, Vec<CellId>> = BTreeMap::new();
    for (cell, population) in populations {
        members.entry(population.as_str()).or_default().push(*cell);
    }
    members
        .into_iter()
        .map(|(population, cells)| RateHistogram {
            population: population.to_string(),
            bin_ms: RATE_BIN_MS,
            rates_hz: rate_histogram(spikes, &cells, duration_ms, RATE_BIN_MS),
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub mean_mv: f64,
    pub std_mv: f64,
    pub peak_to_peak_mv: f64,
    pub samples: usize,
}

impl WindowStats {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let (lo, hi) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Self {
            mean_mv: mean,
            std_mv: var.sqrt(),
            peak_to_peak_mv: hi - lo,
            samples: values.len(),
        }
    }
}

/// LFP statistics before, during and after the stimulation window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElectrodeStats {
    pub electrode: usize,
    pub pre: WindowStats,
    pub during: WindowStats,
    pub post: WindowStats,
}

/// Sample indices of the window edges, clamped to the recording.
fn window_indices(lfp: &LfpRecording, window_start_ms: f64, window_end_ms: f64) -> (usize, usize) {
    let index = |t: f64| -> usize {
        if lfp.sample_dt_ms > 0.0 {
            ((t / lfp.sample_dt_ms).round().max(0.0) as usize).min(lfp.sample_count())
        } else {
            0
        }
    };
    let (a, b) = (index(window_start_ms), index(window_end_ms));
    (a, b.max(a))
}

pub fn lfp_window_stats(lfp: &LfpRecording, window_start_ms: f64, window_end_ms: f64) -> Vec<ElectrodeStats> {
    let (a, b) = window_indices(lfp, window_start_ms, window_end_ms);
    lfp.traces
        .iter()
        .enumerate()
        .map(|(electrode, trace)| ElectrodeStats {
            electrode,
            pre: WindowStats::of(&trace[..a]),
            during: WindowStats::of(&trace[a..b]),
            post: WindowStats::of(&trace[b..]),
        })
        .collect()
}

/// Power spectra before and after the stimulation window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElectrodeSpectra {
    pub electrode: usize,
    pub pre: PowerSpectrum,
    pub post: PowerSpectrum,
}

pub fn lfp_spectra(lfp: &LfpRecording, window_start_ms: f64, window_end_ms: f64) -> Vec<ElectrodeSpectra> {
    profile_scope!(Spectra);
    let (a, b) = window_indices(lfp, window_start_ms, window_end_ms);
    lfp.traces
        .par_iter()
        .enumerate()
        .map(|(electrode, trace)| ElectrodeSpectra {
            electrode,
            pre: welch_psd(&trace[..a], lfp.sample_dt_ms, WELCH_SEGMENT_LEN),
            post: welch_psd(&trace[b..], lfp.sample_dt_ms, WELCH_SEGMENT_LEN),
        })
        .collect()
}

/// Everything the analysis stage attaches to a record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionStatistics {
    pub total_spikes: usize,
    pub population_rates: Vec<PopulationRate>,
    pub rate_histograms: Vec<RateHistogram>,
    pub lfp: Vec<ElectrodeStats>,
    pub spectra: Vec<ElectrodeSpectra>,
}

impl ConditionStatistics {
    pub fn compute(
        spikes: &BTreeMap<CellId, Vec<f64>>,
        populations: &BTreeMap<CellId, String>,
        lfp: &LfpRecording,
        duration_ms: f64,
        window: (f64, f64),
    ) -> Self {
        Self {
            total_spikes: spikes.values().map(Vec::len).sum(),
            population_rates: population_rates(spikes, populations, duration_ms),
            rate_histograms: population_histograms(spikes, populations, duration_ms),
            lfp: lfp_window_stats(lfp, window.0, window.1),
            spectra: lfp_spectra(lfp, window.0, window.1),
        }
    }

    pub fn rate_of(&self, population: &str) -> Option<f64> {
        self.population_rates
            .iter()
            .find(|r| r.population == population)
            .map(|r| r.rate_hz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spikes() -> BTreeMap<CellId, Vec<f64>> {
        BTreeMap::from([(CellId(0), vec![10.0, 20.0, 60.0]), (CellId(2), vec![75.0])])
    }

    fn populations() -> BTreeMap<CellId, String> {
        BTreeMap::from([
            (CellId(0), "HL23PYR".to_string()),
            (CellId(1), "HL23PYR".to_string()),
            (CellId(2), "HL23PV".to_string()),
        ])
    }

    #[test]
    fn rates_are_per_cell_per_second() {
        let rates = population_rates(&spikes(), &populations(), 100.0);
        let pyr = rates.iter().find(|r| r.population == "HL23PYR").unwrap();
        assert_eq!(pyr.cells, 2);
        assert_eq!(pyr.spikes, 3);
        assert!((pyr.rate_hz - 15.0).abs() < 1e-12);
        let pv = rates.iter().find(|r| r.population == "HL23PV").unwrap();
        assert!((pv.rate_hz - 10.0).abs() < 1e-12);
    }

    #[test]
    fn histogram_bins_spikes() {
        let hist = rate_histogram(&spikes(), &[CellId(0), CellId(1)], 100.0, RATE_BIN_MS);
        assert_eq!(hist.len(), 2);
        // 2 spikes / 0.05 s / 2 cells
        assert!((hist[0] - 20.0).abs() < 1e-12);
        assert!((hist[1] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn window_stats_split_the_trace() {
        let lfp = LfpRecording {
            sample_dt_ms: 1.0,
            electrodes: Vec::new(),
            traces: vec![vec![0.0, 0.0, 1.0, -1.0, 2.0, 2.0]],
        };
        let stats = lfp_window_stats(&lfp, 2.0, 4.0);
        assert_eq!(stats[0].pre.samples, 2);
        assert_eq!(stats[0].during.samples, 2);
        assert_eq!(stats[0].during.peak_to_peak_mv, 2.0);
        assert_eq!(stats[0].during.std_mv, 1.0);
        assert_eq!(stats[0].post.mean_mv, 2.0);
    }

    #[test]
    fn empty_window_is_zeroed() {
        assert_eq!(WindowStats::of(&[]), WindowStats::default());
    }

    #[test]
    fn statistics_carry_histograms_and_spectra() {
        let lfp = LfpRecording {
            sample_dt_ms: 0.1,
            electrodes: Vec::new(),
            traces: vec![
                (0..1000).map(|i| (i as f64 * 0.3).sin()).collect(),
                vec![0.0; 1000],
            ],
        };
        let stats = ConditionStatistics::compute(&spikes(), &populations(), &lfp, 100.0, (30.0, 70.0));
        assert_eq!(stats.total_spikes, 4);

        let names: Vec<_> = stats.rate_histograms.iter().map(|h| h.population.as_str()).collect();
        assert_eq!(names, ["HL23PV", "HL23PYR"]);
        assert_eq!(stats.rate_histograms[1].rates_hz, vec![20.0, 10.0]);
        assert_eq!(stats.rate_histograms[0].rates_hz, vec![0.0, 20.0]);

        assert_eq!(stats.spectra.len(), 2);
        // 300 pre samples and 300 post samples: one 256-point segment each
        assert_eq!(stats.spectra[0].pre.segments, 1);
        assert_eq!(stats.spectra[0].post.freqs_hz.len(), 129);
        assert!(stats.spectra[0].pre.band_power(0.0, 5000.0) > 0.0);
        assert!(stats.spectra[1].post.psd_mv2_per_hz.iter().all(|p| *p == 0.0));
    }
}
