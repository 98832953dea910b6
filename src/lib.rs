pub mod analysis;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod lfp;
pub mod pathology;
pub mod profiler;
pub mod stim;
pub mod suite;
pub mod units;

#[cfg(feature = "profiling")]
use once_cell::sync::Lazy;
#[cfg(feature = "profiling")]
use parking_lot::Mutex;

#[cfg(feature = "profiling")]
pub static PROFILER: Lazy<Mutex<profiler::Profiler>> =
    Lazy::new(|| Mutex::new(profiler::Profiler::new()));
