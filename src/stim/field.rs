//! Electric-field → injected-current conversion.

use serde::{Deserialize, Serialize};
use std::fmt;
use ultraviolet::Vec3;

use crate::config;
use crate::error::ConfigError;
use crate::units;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compartment {
    Soma,
    Apical,
    Basal,
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compartment::Soma => "soma",
            Compartment::Apical => "apical",
            Compartment::Basal => "basal",
        };
        write!(f, "{}", name)
    }
}

/// Conversion factor for one (cell type, compartment) pair, in nA per V/m.
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryEntry {
    pub cell_type: &'static str,
    pub compartment: Compartment,
    pub factor: f64,
}

const STANDARD_GEOMETRY: [(&str, Compartment, f64); 6] = [
    (config::POP_PYR, Compartment::Soma, 0.025),
    (config::POP_PYR, Compartment::Apical, 0.05),
    (config::POP_PYR, Compartment::Basal, 0.03),
    (config::POP_PV, Compartment::Soma, 0.015),
    (config::POP_SST, Compartment::Soma, 0.015),
    (config::POP_VIP, Compartment::Soma, 0.015),
];

/// Maps field amplitude and target geometry to an injected current amplitude.
///
/// Pairs missing from the table use [`config::DEFAULT_FIELD_TO_CURRENT_FACTOR`].
#[derive(Clone, Debug)]
pub struct FieldConverter {
    table: Vec<GeometryEntry>,
    fallback: f64,
}

impl Default for FieldConverter {
    fn default() -> Self {
        Self::standard()
    }
}

impl FieldConverter {
    /// Geometry table for the L2/3 cell types.
    pub fn standard() -> Self {
        Self {
            table: STANDARD_GEOMETRY
                .iter()
                .map(|&(cell_type, compartment, factor)| GeometryEntry {
                    cell_type,
                    compartment,
                    factor,
                })
                .collect(),
            fallback: config::DEFAULT_FIELD_TO_CURRENT_FACTOR,
        }
    }

    pub fn entries(&self) -> &[GeometryEntry] {
        &self.table
    }

    pub fn factor(&self, cell_type: &str, compartment: Compartment) -> f64 {
        self.table
            .iter()
            .find(|e| e.cell_type == cell_type && e.compartment == compartment)
            .map(|e| e.factor)
            .unwrap_or(self.fallback)
    }

    /// `field_v_per_m × factor(cell_type, compartment)`, in nA.
    pub fn convert(&self, field_v_per_m: f64, cell_type: &str, compartment: Compartment) -> f64 {
        field_v_per_m * self.factor(cell_type, compartment)
    }
}

/// Spatial profile of the induced field.
///
/// Amplitude decays linearly with the distance from `reference_point_um`
/// measured along `decay_direction`, and couples to a cell in proportion to
/// the alignment of `field_direction` with the cell's somato-dendritic axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialField {
    pub field_direction: [f32; 3],
    pub decay_direction: [f32; 3],
    pub decay_rate_percent_per_mm: f64,
    pub reference_point_um: [f32; 3],
}

impl SpatialField {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if Vec3::from(self.field_direction).mag_sq() == 0.0 {
            return Err(ConfigError::InvalidRunSetting {
                field: "E_field_dir",
                reason: "direction must be non-zero".into(),
            });
        }
        if Vec3::from(self.decay_direction).mag_sq() == 0.0 {
            return Err(ConfigError::InvalidRunSetting {
                field: "decay_dir",
                reason: "direction must be non-zero".into(),
            });
        }
        if !self.decay_rate_percent_per_mm.is_finite() {
            return Err(ConfigError::NonFinite {
                field: "decay_rate_percent_per_mm",
                value: self.decay_rate_percent_per_mm,
            });
        }
        if self.decay_rate_percent_per_mm < 0.0 {
            return Err(ConfigError::InvalidRunSetting {
                field: "decay_rate_percent_per_mm",
                reason: "decay rate must be non-negative".into(),
            });
        }
        Ok(())
    }

    /// Linear decay factor in [0, 1] at `position`.
    pub fn attenuation(&self, position: Vec3) -> f64 {
        let dir = Vec3::from(self.decay_direction).normalized();
        let depth_um = (position - Vec3::from(self.reference_point_um)).dot(dir) as f64;
        let depth_mm = depth_um.max(0.0) / units::UM_PER_MM;
        (1.0 - self.decay_rate_percent_per_mm / 100.0 * depth_mm).max(0.0)
    }

    /// |cos θ| between the field and `axis`; 1.0 when the axis is degenerate.
    pub fn alignment(&self, axis: Vec3) -> f64 {
        if axis.mag_sq() == 0.0 {
            return 1.0;
        }
        let dir = Vec3::from(self.field_direction).normalized();
        dir.dot(axis.normalized()).abs() as f64
    }

    /// Combined amplitude scale for a cell with soma at `soma` and
    /// somato-dendritic axis `axis`.
    pub fn scale(&self, soma: Vec3, axis: Vec3) -> f64 {
        self.attenuation(soma) * self.alignment(axis)
    }
}
