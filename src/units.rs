//! Physical unit conventions for the stimulation and recording pipeline.
//!
//! Base units:
//! - Time: millisecond (ms)
//! - Length: micrometer (µm)
//! - Current: nanoampere (nA)
//! - Electric field: volt per meter (V/m)
//! - Conductivity: siemens per meter (S/m)
//! - Extracellular potential: millivolt (mV)
//!
//! With these units `I / (4π σ r)` evaluates directly to millivolts:
//! nA / (S/m · µm) = 1e-9 A / (1e-6 S) = 1e-3 V.

use std::f64::consts::PI;

/// Milliseconds in one second.
pub const MS_PER_SECOND: f64 = 1000.0;
/// Micrometers in one millimeter.
pub const UM_PER_MM: f64 = 1000.0;

/// Period of a pulse train in milliseconds for a frequency in hertz.
pub fn period_ms(frequency_hz: f64) -> f64 {
    MS_PER_SECOND / frequency_hz
}

/// Point-source prefactor `1 / (4π σ)` for a homogeneous medium.
///
/// Multiplying by `I / r` (nA / µm) yields millivolts.
pub fn point_source_prefactor(conductivity_s_per_m: f64) -> f64 {
    1.0 / (4.0 * PI * conductivity_s_per_m)
}
