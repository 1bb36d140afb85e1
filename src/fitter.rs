//! Constrained common-vertex fitting.
//!
//! The matching core drives any fitter through the [`VertexFitter`]
//! capability trait using the fixed call sequence
//! `process → propagate_to_vertex → track(i) / vertex_pos / vertex_cov`.
//! [`DcaFitter`] is the default implementation: an iterative linearized
//! least-squares fit of the absolute distances of closest approach, for
//! two or three prongs.
//!
//! A fitter instance holds scratch state across that call sequence and is
//! owned by one worker; it must not be shared concurrently.

use crate::error::FitError;
use crate::track::TrackParCov;
use crate::types::{Mat3, Vec3};
use nalgebra::Matrix3;
use tracing::trace;

/// Capability interface for a constrained vertex fit.
pub trait VertexFitter {
    /// Run the fit on 2 or 3 prongs. Returns the number of candidate
    /// solutions found (the core only ever uses candidate 0).
    fn process(&mut self, prongs: &[TrackParCov]) -> Result<usize, FitError>;

    /// Propagate the fitted prongs to the found vertex.
    fn propagate_to_vertex(&mut self) -> Result<(), FitError>;

    /// Prong `i` after propagation to the vertex.
    fn track(&self, i: usize) -> &TrackParCov;

    /// Position of the best vertex candidate.
    fn vertex_pos(&self) -> Vec3;

    /// Covariance of the best vertex candidate (symmetric PSD).
    fn vertex_cov(&self) -> Mat3;
}

/// Configuration of the default DCA fitter.
#[derive(Clone, Copy, Debug)]
pub struct FitterConfig {
    /// Homogeneous field (kGauss).
    pub bz: f64,
    /// Maximum re-linearization iterations.
    pub max_iter: usize,
    /// Convergence: vertex step below this length (cm) stops iterating.
    pub step_tol: f64,
    /// Fiducial bound on the vertex distance from the origin (cm).
    pub max_dist: f64,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            bz: -5.0,
            max_iter: 20,
            step_tol: 1e-4,
            max_dist: 200.0,
        }
    }
}

/// Iterative linearized absolute-DCA vertex fitter.
///
/// Each iteration propagates every prong to the current vertex estimate,
/// linearizes it as a point + unit direction, and solves the normal
/// equations `Σ(I − d·dᵀ)·v = Σ(I − d·dᵀ)·p` for the point minimizing the
/// summed squared distances to the lines.
#[derive(Clone, Debug)]
pub struct DcaFitter {
    pub config: FitterConfig,
    prongs: Vec<TrackParCov>,
    vertex: Vec3,
    cov: Mat3,
    fitted: bool,
}

impl DcaFitter {
    pub fn new(config: FitterConfig) -> Self {
        Self {
            config,
            prongs: Vec::with_capacity(3),
            vertex: Vec3::zeros(),
            cov: Mat3::identity(),
            fitted: false,
        }
    }

    /// Propagate a prong to the plane containing `vertex`, in the frame
    /// aligned with the vertex azimuth.
    fn propagate_prong(track: &mut TrackParCov, vertex: &Vec3, bz: f64) -> Result<(), FitError> {
        let r = vertex.x.hypot(vertex.y);
        // Vertices on the beam axis keep the prong's own frame.
        if r > 1e-6 {
            let alpha = vertex.y.atan2(vertex.x);
            track
                .rotate(alpha)
                .map_err(|_| FitError::PropagationFailed)?;
            track
                .propagate_to(r, bz)
                .map_err(|_| FitError::PropagationFailed)?;
        }
        Ok(())
    }
}

impl VertexFitter for DcaFitter {
    fn process(&mut self, prongs: &[TrackParCov]) -> Result<usize, FitError> {
        if !(2..=3).contains(&prongs.len()) {
            return Err(FitError::ProngCount(prongs.len()));
        }
        self.fitted = false;
        self.prongs = prongs.to_vec();

        // Seed: mean of the prong reference points.
        let mut vertex = self
            .prongs
            .iter()
            .fold(Vec3::zeros(), |acc, t| acc + t.xyz_global())
            / self.prongs.len() as f64;

        let mut normal = Mat3::identity();
        let mut converged = false;
        for iter in 0..self.config.max_iter {
            let mut m = Mat3::zeros();
            let mut b = Vec3::zeros();
            for prong in &self.prongs {
                let mut t = prong.clone();
                Self::propagate_prong(&mut t, &vertex, self.config.bz)?;
                let point = t.xyz_global();
                let mom = t.pxpypz_global();
                let p = mom.norm();
                if p < 1e-9 {
                    return Err(FitError::NonConvergence);
                }
                let dir = mom / p;
                let proj = Matrix3::identity() - dir * dir.transpose();
                m += proj;
                b += proj * point;
            }
            let Some(m_inv) = m.try_inverse() else {
                return Err(FitError::NonConvergence);
            };
            let next = m_inv * b;
            let step = (next - vertex).norm();
            trace!(iter, step, "vertex fit iteration");
            normal = m_inv;
            vertex = next;
            if vertex.norm() > self.config.max_dist {
                return Err(FitError::Diverged);
            }
            if step < self.config.step_tol {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(FitError::NonConvergence);
        }

        self.vertex = vertex;
        // Inverse normal matrix of the LS system; symmetrized against
        // floating-point drift.
        self.cov = 0.5 * (normal + normal.transpose());
        self.fitted = true;
        Ok(1)
    }

    fn propagate_to_vertex(&mut self) -> Result<(), FitError> {
        if !self.fitted {
            return Err(FitError::NonConvergence);
        }
        for prong in &mut self.prongs {
            Self::propagate_prong(prong, &self.vertex, self.config.bz)?;
        }
        Ok(())
    }

    fn track(&self, i: usize) -> &TrackParCov {
        &self.prongs[i]
    }

    fn vertex_pos(&self) -> Vec3 {
        self.vertex
    }

    fn vertex_cov(&self) -> Mat3 {
        self.cov
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
