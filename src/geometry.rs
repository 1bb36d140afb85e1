//! Detector geometry access.
//!
//! The core never links against a concrete detector description: sensors
//! are resolved through the [`GeometryLookup`] capability trait, supplied
//! by the surrounding reconstruction framework. [`CylinderGeometry`] is a
//! self-contained barrel model used by tests and benchmarks.

use crate::types::SensorId;

/// Resolves a sensor id to its reference-frame rotation and structural
/// layer index.
pub trait GeometryLookup {
    /// Azimuthal rotation of the sensor's local frame (radians).
    fn sensor_alpha(&self, sensor: SensorId) -> f64;

    /// Structural layer the sensor belongs to, in `0..N_LAYERS`.
    fn layer(&self, sensor: SensorId) -> usize;
}

/// Idealized cylindrical barrel: `n_sectors` flat sensors per layer, each
/// layer at a fixed radius. Sensor ids encode `layer * n_sectors + sector`.
#[derive(Clone, Debug)]
pub struct CylinderGeometry {
    layer_radii: Vec<f64>,
    n_sectors: u32,
}

impl CylinderGeometry {
    pub fn new(layer_radii: Vec<f64>, n_sectors: u32) -> Self {
        assert!(n_sectors > 0, "barrel needs at least one sector");
        Self {
            layer_radii,
            n_sectors,
        }
    }

    /// Seven-layer silicon barrel with realistic radii (cm).
    pub fn seven_layer_barrel() -> Self {
        Self::new(vec![2.3, 3.1, 3.9, 19.6, 24.4, 34.4, 39.3], 12)
    }

    pub fn n_layers(&self) -> usize {
        self.layer_radii.len()
    }

    pub fn layer_radius(&self, layer: usize) -> f64 {
        self.layer_radii[layer]
    }

    /// Sensor id for a (layer, sector) pair.
    pub fn sensor(&self, layer: usize, sector: u32) -> SensorId {
        SensorId(layer as u32 * self.n_sectors + sector % self.n_sectors)
    }

    /// Sector whose frame contains the azimuth `phi`.
    pub fn sector_at(&self, phi: f64) -> u32 {
        let tau = std::f64::consts::TAU;
        let p = phi.rem_euclid(tau);
        ((p / tau * self.n_sectors as f64).round() as u32) % self.n_sectors
    }
}

impl GeometryLookup for CylinderGeometry {
    fn sensor_alpha(&self, sensor: SensorId) -> f64 {
        let sector = sensor.0 % self.n_sectors;
        let tau = std::f64::consts::TAU;
        let mut alpha = sector as f64 / self.n_sectors as f64 * tau;
        if alpha > std::f64::consts::PI {
            alpha -= tau;
        }
        alpha
    }

    fn layer(&self, sensor: SensorId) -> usize {
        ((sensor.0 / self.n_sectors) as usize).min(self.layer_radii.len() - 1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
