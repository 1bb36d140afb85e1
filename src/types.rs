//! Fundamental types shared across the crate.

use nalgebra::{Matrix3, Matrix5, Vector3, Vector5};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Scalar type: f64 throughout for numerical stability of the track fit.
// ---------------------------------------------------------------------------

/// Local track parameter vector: [y, z, snp, tgl, q2pt]
pub type ParVec = Vector5<f64>;

/// 5×5 track parameter covariance matrix
pub type ParCov = Matrix5<f64>;

/// 3D position / momentum vector (global frame, cm / GeV/c)
pub type Vec3 = Vector3<f64>;

/// 3×3 vertex position covariance
pub type Mat3 = Matrix3<f64>;

/// Number of detector layers the attachment record spans.
pub const N_LAYERS: usize = 7;

// ---------------------------------------------------------------------------
// Identifier types — newtype wrappers so IDs are never confused at compile time
// ---------------------------------------------------------------------------

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SensorId(pub u32);

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProngId(pub u32);

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

impl fmt::Display for ProngId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Particle identity hypotheses
// ---------------------------------------------------------------------------

/// Particle-identity hypothesis carried by a trajectory. Determines the
/// mass used for material corrections and invariant-mass computation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pid {
    #[default]
    Pion,
    Proton,
    Helium3,
    Triton,
    HyperTriton,
}

impl Pid {
    /// Mass in GeV/c².
    pub fn mass(self) -> f64 {
        match self {
            Pid::Pion => 0.139_570,
            Pid::Proton => 0.938_272,
            Pid::Helium3 => 2.808_391,
            Pid::Triton => 2.808_921,
            Pid::HyperTriton => 2.991_310,
        }
    }

    /// Mass squared in (GeV/c²)².
    pub fn mass2(self) -> f64 {
        let m = self.mass();
        m * m
    }
}

// ---------------------------------------------------------------------------
// Cluster — one position measurement in detector-local coordinates
// ---------------------------------------------------------------------------

/// A position measurement on one detector sensor. `x` is the sensor's
/// radial coordinate in its own reference frame; (`y`, `z`) are measured
/// with the quoted covariance. The sensor id resolves to the frame
/// rotation and structural layer through [`crate::geometry::GeometryLookup`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub sensor_id: SensorId,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub sigma_y2: f64,
    pub sigma_z2: f64,
    pub sigma_yz: f64,
}

impl Cluster {
    /// Squared distance from the detector axis. Frame rotations preserve
    /// the transverse norm, so no geometry lookup is needed here.
    pub fn r2(&self) -> f64 {
        self.x * self.x + self.y * self.y
    }
}

// ---------------------------------------------------------------------------
// Attachment record — fixed per-layer bookkeeping
// ---------------------------------------------------------------------------

/// Which member of the decay a layer's measurement was attached to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attachment {
    #[default]
    Unattached,
    Composite,
    FirstDaughter,
    SecondDaughter,
}

/// Per-candidate attachment bookkeeping, one entry per detector layer.
/// The layer count is a geometry constant, so this is a fixed array and
/// entries are mutually exclusive per layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    arr: [Attachment; N_LAYERS],
}

impl AttachmentRecord {
    pub fn get(&self, layer: usize) -> Attachment {
        self.arr[layer]
    }

    pub fn set(&mut self, layer: usize, att: Attachment) {
        self.arr[layer] = att;
    }

    /// Number of layers carrying an attachment.
    pub fn attached_count(&self) -> usize {
        self.arr
            .iter()
            .filter(|a| **a != Attachment::Unattached)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
