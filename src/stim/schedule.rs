//! Biphasic pulse-train scheduling.

use serde::Serialize;
use smallvec::{smallvec, SmallVec};

use crate::config;
use crate::error::ConfigError;
use crate::stim::field::{Compartment, FieldConverter};
use crate::stim::protocol::StimulationProtocol;
use crate::units;

/// One charge-balanced biphasic pulse.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Pulse {
    pub onset_ms: f64,
    pub phase1_duration_ms: f64,
    pub phase1_amplitude_na: f64,
    pub phase2_duration_ms: f64,
    pub phase2_amplitude_na: f64,
}

/// A rectangular current step delivered by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CurrentInjection {
    pub onset_ms: f64,
    pub duration_ms: f64,
    pub amplitude_na: f64,
}

impl CurrentInjection {
    pub fn end_ms(&self) -> f64 {
        self.onset_ms + self.duration_ms
    }

    pub fn is_active(&self, t_ms: f64) -> bool {
        t_ms >= self.onset_ms && t_ms < self.end_ms()
    }
}

impl Pulse {
    pub fn phase2_onset_ms(&self) -> f64 {
        self.onset_ms + self.phase1_duration_ms
    }

    pub fn end_ms(&self) -> f64 {
        self.phase2_onset_ms() + self.phase2_duration_ms
    }

    /// Injected charge in nA·ms (pC); zero for every scheduled pulse.
    pub fn net_charge(&self) -> f64 {
        self.phase1_amplitude_na * self.phase1_duration_ms
            + self.phase2_amplitude_na * self.phase2_duration_ms
    }

    /// The two consecutive injections of this pulse with amplitudes scaled by `scale`.
    pub fn injections(&self, scale: f64) -> SmallVec<[CurrentInjection; 2]> {
        smallvec![
            CurrentInjection {
                onset_ms: self.onset_ms,
                duration_ms: self.phase1_duration_ms,
                amplitude_na: self.phase1_amplitude_na * scale,
            },
            CurrentInjection {
                onset_ms: self.phase2_onset_ms(),
                duration_ms: self.phase2_duration_ms,
                amplitude_na: self.phase2_amplitude_na * scale,
            },
        ]
    }
}

/// Lazy, finite pulse sequence.
///
/// Cloning or calling [`PulseTrain::restart`] yields the same sequence from the
/// first pulse; the count is fixed when the train is scheduled.
#[derive(Clone, Debug, PartialEq)]
pub struct PulseTrain {
    start_ms: f64,
    period_ms: f64,
    half_width_ms: f64,
    amplitude_na: f64,
    count: usize,
    next: usize,
}

impl PulseTrain {
    pub fn n_pulses(&self) -> usize {
        self.count
    }

    pub fn amplitude_na(&self) -> f64 {
        self.amplitude_na
    }

    pub fn period_ms(&self) -> f64 {
        self.period_ms
    }

    pub fn restart(&self) -> PulseTrain {
        PulseTrain {
            next: 0,
            ..self.clone()
        }
    }

    fn pulse_at(&self, index: usize) -> Pulse {
        Pulse {
            onset_ms: self.start_ms + index as f64 * self.period_ms,
            phase1_duration_ms: self.half_width_ms,
            phase1_amplitude_na: self.amplitude_na,
            phase2_duration_ms: self.half_width_ms,
            phase2_amplitude_na: -self.amplitude_na,
        }
    }
}

impl Iterator for PulseTrain {
    type Item = Pulse;

    fn next(&mut self) -> Option<Pulse> {
        if self.next >= self.count {
            return None;
        }
        let pulse = self.pulse_at(self.next);
        self.next += 1;
        Some(pulse)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PulseTrain {}

/// `floor((end − start) × frequency / 1000)`.
pub fn pulse_count(protocol: &StimulationProtocol) -> usize {
    let window_ms = protocol.window_end_ms() - protocol.window_start_ms();
    let exact = window_ms * protocol.frequency_hz() / units::MS_PER_SECOND;
    (exact + config::PULSE_COUNT_TOLERANCE).floor().max(0.0) as usize
}

/// Onset times of every pulse, for analysis and plotting.
pub fn pulse_onsets(protocol: &StimulationProtocol) -> Vec<f64> {
    let period = protocol.period_ms();
    (0..pulse_count(protocol))
        .map(|i| protocol.window_start_ms() + i as f64 * period)
        .collect()
}

#[derive(Clone, Debug, Default)]
pub struct PulseScheduler {
    converter: FieldConverter,
}

impl PulseScheduler {
    pub fn new(converter: FieldConverter) -> Self {
        Self { converter }
    }

    pub fn converter(&self) -> &FieldConverter {
        &self.converter
    }

    pub fn schedule(&self, protocol: &StimulationProtocol) -> Result<PulseTrain, ConfigError> {
        protocol.validate()?;
        let amplitude_na = self.converter.convert(
            protocol.field_amplitude_v_per_m(),
            protocol.target_population(),
            Compartment::Soma,
        );
        Ok(PulseTrain {
            start_ms: protocol.window_start_ms(),
            period_ms: protocol.period_ms(),
            half_width_ms: protocol.pulse_width_ms() / 2.0,
            amplitude_na,
            count: pulse_count(protocol),
            next: 0,
        })
    }
}
