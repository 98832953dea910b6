// Centralized configuration constants for the stimulation and recording pipeline

// ====================
// Field → current conversion
// ====================
/// Conversion factor (nA per V/m) used when a (cell type, compartment) pair
/// has no entry in the geometry table.
pub const DEFAULT_FIELD_TO_CURRENT_FACTOR: f64 = 0.02;

// ====================
// Stimulation
// ====================
/// Section receiving every rTMS current injection.
pub const INJECTION_SECTION: &str = "soma_0";
/// Normalized position along the injection section.
pub const INJECTION_LOC: f64 = 0.5;
/// Absorbs float representation error in `duration × frequency / 1000`
/// so that e.g. 1000 ms at 30 Hz yields 30 pulses, not 29.
pub const PULSE_COUNT_TOLERANCE: f64 = 1e-9;

// ====================
// LFP synthesis
// ====================
/// Extracellular conductivity of cortical grey matter (S/m).
pub const DEFAULT_CONDUCTIVITY_S_PER_M: f64 = 0.3;
/// Minimum segment-to-electrode distance (µm). Closer segments are clamped.
pub const LFP_MIN_DISTANCE_UM: f64 = 1.0;

// ====================
// Run parameters
// ====================
/// Simulated duration per condition (ms).
pub const DEFAULT_DURATION_MS: f64 = 3000.0;
/// Internal integration step of the reference engine (ms).
pub const DEFAULT_INTEGRATION_DT_MS: f64 = 0.025;
/// Recording resolution for currents and LFP (ms).
pub const DEFAULT_RECORDING_DT_MS: f64 = 0.1;
/// Directory receiving per-condition records and the suite summary.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

// ====================
// Reference engine
// ====================
pub const POP_PYR: &str = "HL23PYR";
pub const POP_SST: &str = "HL23SST";
pub const POP_PV: &str = "HL23PV";
pub const POP_VIP: &str = "HL23VIP";

/// Cells per population (Yao et al. L2/3 proportions, 100 cells).
pub const DEFAULT_CELL_COUNTS: [(&str, usize); 4] =
    [(POP_PYR, 80), (POP_SST, 8), (POP_PV, 6), (POP_VIP, 6)];
/// Background Poisson drive rate per cell (Hz).
pub const DEFAULT_BACKGROUND_RATE_HZ: f64 = 100.0;
/// Seed for cell placement and background drive.
pub const DEFAULT_ENGINE_SEED: u64 = 4321;
/// Column radius (µm).
pub const COLUMN_RADIUS_UM: f32 = 250.0;
/// Depth range of L2/3 somata (µm).
pub const L23_DEPTH_UM: (f32, f32) = (250.0, 1200.0);
/// Number of recorded segments per cell (soma + dendrites).
pub const SEGMENTS_PER_CELL: usize = 4;
/// Spacing between segments along the apical axis (µm).
pub const SEGMENT_SPACING_UM: f32 = 60.0;

/// 5-electrode laminar array spanning L2/3 (µm).
pub const DEFAULT_ELECTRODES: [[f32; 3]; 5] = [
    [0.0, 600.0, 0.0],
    [0.0, 700.0, 0.0],
    [0.0, 800.0, 0.0],
    [0.0, 900.0, 0.0],
    [0.0, 1000.0, 0.0],
];
