//! Composite decay candidates and the vertex refitter.
//!
//! [`Refitter`] regenerates a [`DecayCandidate`] from its prongs through a
//! [`VertexFitter`]: a pairwise recreate whenever a daughter trajectory
//! has absorbed a new measurement, and a final three-body refit of the
//! composite together with both daughters. A failed fit leaves the input
//! candidate untouched.

use crate::error::{FitError, UpdateFailure};
use crate::fitter::VertexFitter;
use crate::kinematics;
use crate::track::TrackParCov;
use crate::types::{Mat3, Pid, ProngId, Vec3};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A two-prong composite decay candidate: daughter trajectories, fitted
/// vertex, summed momentum and the composite trajectory built from them.
///
/// Invariant: `momentum` is the vector sum of the prong momenta evaluated
/// at `vertex`; `vertex_cov` stays symmetric PSD across refits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecayCandidate {
    /// Composite (parent) trajectory, seeded from vertex + momentum.
    pub track: TrackParCov,
    pub vertex: Vec3,
    pub momentum: Vec3,
    pub vertex_cov: Mat3,
    pub prongs: [TrackParCov; 2],
    pub prong_ids: [ProngId; 2],
}

impl DecayCandidate {
    pub fn new(
        vertex: Vec3,
        momentum: Vec3,
        vertex_cov: Mat3,
        prongs: [TrackParCov; 2],
        prong_ids: [ProngId; 2],
        charge: i32,
        pid: Pid,
    ) -> Result<Self, UpdateFailure> {
        let track = TrackParCov::from_vertex(&vertex, &momentum, &vertex_cov, charge, pid)?;
        Ok(Self {
            track,
            vertex,
            momentum,
            vertex_cov,
            prongs,
            prong_ids,
        })
    }

    /// Squared decay radius.
    pub fn r2(&self) -> f64 {
        self.vertex.x * self.vertex.x + self.vertex.y * self.vertex.y
    }

    /// Decay asymmetry of the two prongs along the parent direction.
    pub fn asymmetry(&self) -> f64 {
        kinematics::decay_asymmetry(
            &self.momentum,
            &self.prongs[0].pxpypz_global(),
            &self.prongs[1].pxpypz_global(),
        )
    }

    /// Invariant mass under the prongs' identity hypotheses.
    pub fn mass(&self) -> f64 {
        kinematics::mother_mass(
            self.momentum.norm_squared(),
            self.prongs[0].pxpypz_global().norm_squared(),
            self.prongs[1].pxpypz_global().norm_squared(),
            self.prongs[0].pid(),
            self.prongs[1].pid(),
        )
    }
}

/// Regenerates composite candidates through constrained vertex fits.
#[derive(Clone, Copy, Debug)]
pub struct Refitter {
    /// Identity hypothesis assigned to the refitted parent.
    pub parent_pid: Pid,
    /// Charge assigned to the refitted parent.
    pub parent_charge: i32,
}

impl Refitter {
    pub fn new(parent_pid: Pid, parent_charge: i32) -> Self {
        Self {
            parent_pid,
            parent_charge,
        }
    }

    /// Re-solve the two-prong vertex and rebuild the composite from the
    /// propagated prongs. Only the first fit candidate is used.
    pub fn recreate_pair<F: VertexFitter>(
        &self,
        fitter: &mut F,
        first: &TrackParCov,
        second: &TrackParCov,
        prong_ids: [ProngId; 2],
    ) -> Result<DecayCandidate, FitError> {
        let n_cand = fitter.process(&[first.clone(), second.clone()])?;
        if n_cand == 0 {
            return Err(FitError::NonConvergence);
        }
        fitter.propagate_to_vertex()?;
        self.build(fitter, 0, 1, prong_ids)
    }

    /// Final constrained refit of the composite trajectory together with
    /// both refined daughters.
    pub fn refit_three_body<F: VertexFitter>(
        &self,
        fitter: &mut F,
        candidate: &DecayCandidate,
    ) -> Result<DecayCandidate, FitError> {
        let n_cand = fitter.process(&[
            candidate.track.clone(),
            candidate.prongs[0].clone(),
            candidate.prongs[1].clone(),
        ])?;
        if n_cand == 0 {
            return Err(FitError::NonConvergence);
        }
        fitter.propagate_to_vertex()?;
        self.build(fitter, 1, 2, candidate.prong_ids)
    }

    fn build<F: VertexFitter>(
        &self,
        fitter: &F,
        first_idx: usize,
        second_idx: usize,
        prong_ids: [ProngId; 2],
    ) -> Result<DecayCandidate, FitError> {
        let first = fitter.track(first_idx).clone();
        let second = fitter.track(second_idx).clone();
        let momentum = first.pxpypz_global() + second.pxpypz_global();
        let vertex = fitter.vertex_pos();
        debug!(
            r = vertex.x.hypot(vertex.y),
            pt = momentum.x.hypot(momentum.y),
            "rebuilt composite from fitted prongs"
        );
        DecayCandidate::new(
            vertex,
            momentum,
            fitter.vertex_cov(),
            [first, second],
            prong_ids,
            self.parent_charge,
            self.parent_pid,
        )
        .map_err(|_| FitError::PropagationFailed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
