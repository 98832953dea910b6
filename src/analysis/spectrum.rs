//! Welch power spectral density of LFP windows.
//!
//! Hann-windowed segments with 50% overlap, mean removed per segment,
//! one-sided density scaling (mV²/Hz).

use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::units;

/// Default Welch segment length (samples).
pub const WELCH_SEGMENT_LEN: usize = 256;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerSpectrum {
    pub freqs_hz: Vec<f64>,
    pub psd_mv2_per_hz: Vec<f64>,
    /// Segments averaged; 0 for a window too short to analyse.
    pub segments: usize,
}

impl PowerSpectrum {
    pub fn is_empty(&self) -> bool {
        self.freqs_hz.is_empty()
    }

    /// Frequency of the largest non-DC bin.
    pub fn peak_frequency_hz(&self) -> Option<f64> {
        self.psd_mv2_per_hz
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| self.freqs_hz[i])
    }

    /// Integrated power between `lo` and `hi` Hz (mV²).
    pub fn band_power(&self, lo: f64, hi: f64) -> f64 {
        let df = match self.freqs_hz.get(1) {
            Some(f1) => f1 - self.freqs_hz[0],
            None => return 0.0,
        };
        self.freqs_hz
            .iter()
            .zip(&self.psd_mv2_per_hz)
            .filter(|(f, _)| **f >= lo && **f <= hi)
            .map(|(_, p)| p * df)
            .sum()
    }
}

fn hann(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / size as f64).cos()))
        .collect()
}

/// Welch estimate of `signal` sampled every `sample_dt_ms`. Segments shorter
/// than `segment_len` shrink to the signal length; fewer than two samples
/// give an empty spectrum.
pub fn welch_psd(signal: &[f64], sample_dt_ms: f64, segment_len: usize) -> PowerSpectrum {
    let nperseg = segment_len.min(signal.len());
    if nperseg < 2 || !(sample_dt_ms > 0.0) {
        return PowerSpectrum::default();
    }
    let fs = units::MS_PER_SECOND / sample_dt_ms;
    let hop = (nperseg / 2).max(1);
    let n_segments = (signal.len() - nperseg) / hop + 1;
    let n_freq = nperseg / 2 + 1;

    let window = hann(nperseg);
    let scale = 1.0 / (fs * window.iter().map(|w| w * w).sum::<f64>());
    let fft = FftPlanner::new().plan_fft_forward(nperseg);

    let mut psd = vec![0.0; n_freq];
    let mut buffer = vec![Complex64::new(0.0, 0.0); nperseg];
    for segment in 0..n_segments {
        let chunk = &signal[segment * hop..segment * hop + nperseg];
        let mean = chunk.iter().sum::<f64>() / nperseg as f64;
        for ((slot, &s), &w) in buffer.iter_mut().zip(chunk).zip(&window) {
            *slot = Complex64::new((s - mean) * w, 0.0);
        }
        fft.process(&mut buffer);
        for (bin, p) in psd.iter_mut().enumerate() {
            *p += buffer[bin].norm_sqr() * scale;
        }
    }

    let nyquist_bin = (nperseg % 2 == 0).then_some(n_freq - 1);
    for (bin, p) in psd.iter_mut().enumerate() {
        *p /= n_segments as f64;
        if bin != 0 && Some(bin) != nyquist_bin {
            *p *= 2.0;
        }
    }

    PowerSpectrum {
        freqs_hz: (0..n_freq).map(|k| k as f64 * fs / nperseg as f64).collect(),
        psd_mv2_per_hz: psd,
        segments: n_segments,
    }
}
