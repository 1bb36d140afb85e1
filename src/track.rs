//! Trajectory state: local 5-parameter track with covariance.
//!
//! # Parameterization
//! A track lives in a frame rotated by `alpha` around the detector axis,
//! at a reference coordinate `x` (cm). The parameter vector is
//! `[y, z, snp, tgl, q2pt]`:
//! - `y`, `z`   — transverse/longitudinal position at `x` (cm)
//! - `snp`      — sine of the local azimuthal track angle
//! - `tgl`      — tangent of the dip angle, pz/pt
//! - `q2pt`     — signed charge over transverse momentum, (GeV/c)⁻¹
//!
//! All math is done in `f64` via `nalgebra`. Covariance transport goes
//! through explicit Jacobians (`P' = J·P·Jᵀ`); the measurement update uses
//! the Joseph form for numerical stability.

use crate::error::UpdateFailure;
use crate::types::{Cluster, Mat3, ParCov, ParVec, Pid, Vec3};
use nalgebra::{Matrix2, Matrix5, SMatrix, Vector2, Vector5};
use serde::{Deserialize, Serialize};

/// Conversion from curvature to q/pt: kGauss · cm · GeV/c units.
pub const B2C: f64 = -0.299_792_458e-3;

/// Largest |snp| the parameterization can represent.
const MAX_SNP: f64 = 0.999;

/// Radiation length of silicon (cm).
pub const SI_RAD_LENGTH: f64 = 9.36;

/// Density of silicon (g/cm³).
pub const SI_DENSITY: f64 = 2.33;

const TINY: f64 = 1e-9;

/// Material-correction mode applied when a trajectory crosses a layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatCorrType {
    /// Skip the correction entirely.
    None,
    /// Multiple scattering plus a constant-dE/dx energy loss.
    #[default]
    Approximate,
    /// Multiple scattering plus Bethe-Bloch energy loss.
    Full,
}

/// A charged-particle trajectory: local parameters, covariance, particle
/// hypothesis and absolute charge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackParCov {
    alpha: f64,
    x: f64,
    par: ParVec,
    cov: ParCov,
    pid: Pid,
    abs_charge: f64,
}

impl TrackParCov {
    pub fn new(alpha: f64, x: f64, par: ParVec, cov: ParCov, pid: Pid, abs_charge: f64) -> Self {
        Self {
            alpha,
            x,
            par,
            cov,
            pid,
            abs_charge,
        }
    }

    /// Build a trajectory from a global vertex position, momentum and
    /// vertex covariance. The frame is aligned with the momentum azimuth,
    /// so `snp` starts at zero. Momentum-block covariance is seeded with
    /// loose diagonal values; any subsequent fit overrides them.
    pub fn from_vertex(
        xyz: &Vec3,
        pxpypz: &Vec3,
        vtx_cov: &Mat3,
        charge: i32,
        pid: Pid,
    ) -> Result<Self, UpdateFailure> {
        let pt = pxpypz.x.hypot(pxpypz.y);
        if pt < TINY {
            return Err(UpdateFailure::Geometric);
        }
        let alpha = pxpypz.y.atan2(pxpypz.x);
        let (sa, ca) = alpha.sin_cos();
        let x = xyz.x * ca + xyz.y * sa;
        let y = -xyz.x * sa + xyz.y * ca;
        let tgl = pxpypz.z / pt;
        let q = if charge == 0 { 1 } else { charge };
        let q2pt = q as f64 / pt;

        // Rotate the position covariance into the local (y, z) block.
        let var_y = sa * sa * vtx_cov[(0, 0)] - 2.0 * sa * ca * vtx_cov[(0, 1)]
            + ca * ca * vtx_cov[(1, 1)];
        let var_z = vtx_cov[(2, 2)];
        let cov_yz = ca * vtx_cov[(1, 2)] - sa * vtx_cov[(0, 2)];

        let mut cov = ParCov::zeros();
        cov[(0, 0)] = var_y.max(TINY);
        cov[(1, 1)] = var_z.max(TINY);
        cov[(0, 1)] = cov_yz;
        cov[(1, 0)] = cov_yz;
        cov[(2, 2)] = 1e-3;
        cov[(3, 3)] = 1e-3 * (1.0 + tgl * tgl) * (1.0 + tgl * tgl);
        cov[(4, 4)] = 0.01 * q2pt * q2pt + 1e-6;

        Ok(Self {
            alpha,
            x,
            par: Vector5::new(y, xyz.z, 0.0, tgl, q2pt),
            cov,
            pid,
            abs_charge: q.abs() as f64,
        })
    }

    // -- accessors ---------------------------------------------------------

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
    pub fn x(&self) -> f64 {
        self.x
    }
    pub fn y(&self) -> f64 {
        self.par[0]
    }
    pub fn z(&self) -> f64 {
        self.par[1]
    }
    pub fn snp(&self) -> f64 {
        self.par[2]
    }
    pub fn tgl(&self) -> f64 {
        self.par[3]
    }
    pub fn q2pt(&self) -> f64 {
        self.par[4]
    }
    pub fn cov(&self) -> &ParCov {
        &self.cov
    }
    pub fn pid(&self) -> Pid {
        self.pid
    }
    pub fn abs_charge(&self) -> f64 {
        self.abs_charge
    }

    /// Reinterpret the stored q/pt under a different absolute charge
    /// (e.g. a doubly-charged daughter hypothesis).
    pub fn set_abs_charge(&mut self, q: f64) {
        self.abs_charge = q.abs().max(1.0);
    }

    /// Transverse momentum (GeV/c).
    pub fn pt(&self) -> f64 {
        self.abs_charge / self.par[4].abs().max(TINY)
    }

    /// Total momentum (GeV/c).
    pub fn p(&self) -> f64 {
        self.pt() * (1.0 + self.par[3] * self.par[3]).sqrt()
    }

    /// Global position of the reference point.
    pub fn xyz_global(&self) -> Vec3 {
        let (sa, ca) = self.alpha.sin_cos();
        Vec3::new(
            self.x * ca - self.par[0] * sa,
            self.x * sa + self.par[0] * ca,
            self.par[1],
        )
    }

    /// Global momentum vector.
    pub fn pxpypz_global(&self) -> Vec3 {
        let pt = self.pt();
        let snp = self.par[2];
        let csp = ((1.0 - snp) * (1.0 + snp)).max(0.0).sqrt();
        let (sa, ca) = self.alpha.sin_cos();
        Vec3::new(
            pt * (csp * ca - snp * sa),
            pt * (csp * sa + snp * ca),
            pt * self.par[3],
        )
    }

    // -- frame rotation ----------------------------------------------------

    /// Rotate the reference frame to azimuth `alpha_new`. Fails when the
    /// track direction is ill-defined in the target frame.
    pub fn rotate(&mut self, alpha_new: f64) -> Result<(), UpdateFailure> {
        let (sa, ca) = (alpha_new - self.alpha).sin_cos();
        let sf = self.par[2];
        let cf = ((1.0 - sf) * (1.0 + sf)).max(0.0).sqrt();
        if cf < TINY {
            return Err(UpdateFailure::Geometric);
        }
        let snp_new = sf * ca - cf * sa;
        if snp_new.abs() > MAX_SNP {
            return Err(UpdateFailure::Geometric);
        }
        // Reject rotations that would flip the track direction.
        if cf * ca + sf * sa < 0.0 {
            return Err(UpdateFailure::Geometric);
        }

        let x_new = self.x * ca + self.par[0] * sa;
        let y_new = -self.x * sa + self.par[0] * ca;

        let mut jac = Matrix5::<f64>::identity();
        jac[(0, 0)] = ca;
        jac[(2, 2)] = ca + sf / cf * sa;
        self.cov = jac * self.cov * jac.transpose();

        self.alpha = alpha_new;
        self.x = x_new;
        self.par[0] = y_new;
        self.par[2] = snp_new;
        Ok(())
    }

    // -- propagation -------------------------------------------------------

    /// Propagate to the plane `x = x_to` in a homogeneous field `bz`
    /// (kGauss), transporting the covariance. Fails when the helix never
    /// reaches the plane.
    pub fn propagate_to(&mut self, x_to: f64, bz: f64) -> Result<(), UpdateFailure> {
        let dx = x_to - self.x;
        if dx.abs() < TINY {
            return Ok(());
        }
        let crv = self.par[4] * bz * B2C;
        let f1 = self.par[2];
        let f2 = f1 + crv * dx;
        if f1.abs() > MAX_SNP || f2.abs() > MAX_SNP {
            return Err(UpdateFailure::Geometric);
        }
        let r1 = ((1.0 - f1) * (1.0 + f1)).sqrt();
        let r2 = ((1.0 - f2) * (1.0 + f2)).sqrt();
        if r1 < TINY || r2 < TINY {
            return Err(UpdateFailure::Geometric);
        }

        let tgl = self.par[3];
        let dy2dx = (f1 + f2) / (r1 + r2);
        let x2r = crv * dx;

        // Covariance transport. The Jacobian is I plus the mixed terms of
        // the helix expansion.
        let rinv = 1.0 / r1;
        let r3inv = rinv * rinv * rinv;
        let f24 = dx * bz * B2C;
        let f02 = dx * r3inv;
        let f04 = 0.5 * f24 * f02;
        let f12 = f02 * tgl * f1;
        let f14 = 0.5 * f24 * f12;
        let f13 = dx * rinv;

        let mut jac = Matrix5::<f64>::identity();
        jac[(0, 2)] = f02;
        jac[(0, 4)] = f04;
        jac[(1, 2)] = f12;
        jac[(1, 3)] = f13;
        jac[(1, 4)] = f14;
        jac[(2, 4)] = f24;
        self.cov = jac * self.cov * jac.transpose();

        self.x = x_to;
        self.par[0] += dx * dy2dx;
        if x2r.abs() < 0.05 {
            self.par[1] += dx * (r2 + f2 * dy2dx) * tgl;
        } else {
            // Large sagitta: use the exact arc length in the bending plane.
            let chord = dx * (1.0 + dy2dx * dy2dx).sqrt();
            let rot = 2.0 * (0.5 * chord * crv).asin();
            self.par[1] += rot / crv * tgl;
        }
        self.par[2] = f2;
        Ok(())
    }

    // -- material correction -----------------------------------------------

    /// Account for multiple scattering and mean energy loss over a layer
    /// of `x2x0` radiation lengths and `xrho` g/cm² of material.
    pub fn correct_for_material(
        &mut self,
        x2x0: f64,
        xrho: f64,
        mode: MatCorrType,
    ) -> Result<(), UpdateFailure> {
        if mode == MatCorrType::None {
            return Ok(());
        }
        let mass = self.pid.mass();
        let p = self.p();
        let p2 = p * p;
        let e2 = p2 + mass * mass;
        let beta2 = p2 / e2;
        if beta2 < TINY {
            return Err(UpdateFailure::Geometric);
        }
        let tgl = self.par[3];
        let q2 = self.abs_charge * self.abs_charge;

        // Multiple scattering inflates the angular block of the covariance.
        if x2x0 > 0.0 {
            let theta2 = 0.0136 * 0.0136 / (beta2 * p2) * x2x0 * q2;
            let snp = self.par[2];
            let t2 = 1.0 + tgl * tgl;
            self.cov[(2, 2)] += theta2 * (1.0 - snp) * (1.0 + snp) * t2;
            self.cov[(3, 3)] += theta2 * t2 * t2;
            let c43 = theta2 * tgl * self.par[4] * t2;
            self.cov[(4, 3)] += c43;
            self.cov[(3, 4)] += c43;
            self.cov[(4, 4)] += theta2 * tgl * tgl * self.par[4] * self.par[4];
        }

        // Mean energy loss rescales q/pt.
        if xrho > 0.0 {
            let dedx = match mode {
                MatCorrType::Approximate => 0.002, // GeV per g/cm²
                MatCorrType::Full => bethe_bloch_solid(p / mass) * q2,
                MatCorrType::None => unreachable!(),
            };
            let de = dedx * xrho;
            let e = e2.sqrt();
            if de > 0.3 * e {
                return Err(UpdateFailure::Geometric);
            }
            let e_new = e - de;
            if e_new <= mass {
                return Err(UpdateFailure::Geometric);
            }
            let p_new = (e_new * e_new - mass * mass).sqrt();
            let fac = p / p_new;
            self.par[4] *= fac;

            // Energy-loss straggling on the curvature term.
            let sigma_de = 0.07 * de.sqrt();
            let sig_c = self.par[4] * e / p2 * sigma_de;
            self.cov[(4, 4)] += sig_c * sig_c;
        }
        Ok(())
    }

    // -- measurement compatibility and update ------------------------------

    /// Chi-square of a cluster against the current state. The trajectory
    /// must already be rotated and propagated to the cluster surface.
    pub fn predicted_chi2(&self, clus: &Cluster) -> f64 {
        let dy = clus.y - self.par[0];
        let dz = clus.z - self.par[1];
        let s00 = self.cov[(0, 0)] + clus.sigma_y2;
        let s01 = self.cov[(0, 1)] + clus.sigma_yz;
        let s11 = self.cov[(1, 1)] + clus.sigma_z2;
        let det = s00 * s11 - s01 * s01;
        if det.abs() < TINY {
            return f64::MAX;
        }
        (dy * (s11 * dy - s01 * dz) + dz * (s00 * dz - s01 * dy)) / det
    }

    /// Kalman update with a cluster measurement of (y, z). Joseph form,
    /// as in the reference Kalman update of the filter stack.
    pub fn update(&mut self, clus: &Cluster) -> Result<(), UpdateFailure> {
        let mut h = SMatrix::<f64, 2, 5>::zeros();
        h[(0, 0)] = 1.0;
        h[(1, 1)] = 1.0;
        let r = Matrix2::new(clus.sigma_y2, clus.sigma_yz, clus.sigma_yz, clus.sigma_z2);

        let s: Matrix2<f64> = h * self.cov * h.transpose() + r;
        let s_inv = s.try_inverse().ok_or(UpdateFailure::Geometric)?;
        let k: SMatrix<f64, 5, 2> = self.cov * h.transpose() * s_inv;

        let innovation = Vector2::new(clus.y - self.par[0], clus.z - self.par[1]);
        let par = self.par + k * innovation;
        if par[2].abs() > MAX_SNP {
            return Err(UpdateFailure::Geometric);
        }
        self.par = par;

        let i_kh = Matrix5::<f64>::identity() - k * h;
        self.cov = i_kh * self.cov * i_kh.transpose() + k * r * k.transpose();
        Ok(())
    }

    /// Inflate the covariance ahead of a re-pass: diagonal scaled up,
    /// correlations dropped, `snp` variance clamped to its physical range.
    pub fn reset_covariance(&mut self, scale2: f64) {
        let s2 = if scale2 > 0.0 { scale2 } else { 100.0 };
        let diag: Vec<f64> = (0..5).map(|i| self.cov[(i, i)] * s2).collect();
        self.cov = ParCov::zeros();
        for (i, d) in diag.iter().enumerate() {
            self.cov[(i, i)] = *d;
        }
        self.cov[(2, 2)] = self.cov[(2, 2)].min(1.0);
    }
}

/// Simplified Bethe-Bloch for a solid medium, in GeV per g/cm², as a
/// function of beta·gamma.
fn bethe_bloch_solid(bg: f64) -> f64 {
    let bg2 = bg * bg;
    let beta2 = bg2 / (1.0 + bg2);
    if beta2 < 1e-12 {
        return f64::MAX;
    }
    // K·Z/A with <Z/A> ≈ 0.5, I ≈ 173 eV for silicon.
    let k = 0.307_075e-3 * 0.5;
    let log_term = (bg2 * 5.0e3).max(1.001).ln();
    k / beta2 * (log_term - beta2)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorId;
    use approx::assert_abs_diff_eq;

    fn straight_track() -> TrackParCov {
        // 1 GeV/c track along local x, modest dip
        TrackParCov::new(
            0.0,
            1.0,
            Vector5::new(0.0, 0.0, 0.0, 0.2, 1.0),
            ParCov::identity() * 1e-4,
            Pid::Pion,
            1.0,
        )
    }

    #[test]
    fn propagate_field_free_is_linear() {
        let mut t = straight_track();
        t.propagate_to(11.0, 0.0).unwrap();
        assert_abs_diff_eq!(t.x(), 11.0);
        assert_abs_diff_eq!(t.y(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.z(), 10.0 * 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(t.snp(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn propagate_bends_in_field() {
        let mut t = straight_track();
        t.propagate_to(21.0, -5.0).unwrap();
        // Negative field and positive charge: snp picks up crv·dx
        let expected_snp = 1.0 * -5.0 * B2C * 20.0;
        assert_abs_diff_eq!(t.snp(), expected_snp, epsilon = 1e-12);
        assert!(t.y().abs() > 0.0, "bending must displace y");
    }

    #[test]
    fn propagation_roundtrip_restores_position() {
        let mut t = straight_track();
        let y0 = t.y();
        let z0 = t.z();
        t.propagate_to(30.0, -5.0).unwrap();
        t.propagate_to(1.0, -5.0).unwrap();
        assert_abs_diff_eq!(t.y(), y0, epsilon = 1e-9);
        assert_abs_diff_eq!(t.z(), z0, epsilon = 1e-9);
    }

    #[test]
    fn rotation_preserves_global_position() {
        let mut t = straight_track();
        let g0 = t.xyz_global();
        t.rotate(0.3).unwrap();
        let g1 = t.xyz_global();
        assert_abs_diff_eq!(g0.x, g1.x, epsilon = 1e-12);
        assert_abs_diff_eq!(g0.y, g1.y, epsilon = 1e-12);
        assert_abs_diff_eq!(g0.z, g1.z, epsilon = 1e-12);
    }

    #[test]
    fn rotation_preserves_momentum_norm() {
        let mut t = straight_track();
        let p0 = t.pxpypz_global();
        t.rotate(-0.4).unwrap();
        let p1 = t.pxpypz_global();
        assert_abs_diff_eq!(p0.norm(), p1.norm(), epsilon = 1e-12);
        assert_abs_diff_eq!(p0.x, p1.x, epsilon = 1e-12);
        assert_abs_diff_eq!(p0.y, p1.y, epsilon = 1e-12);
    }

    #[test]
    fn rotation_to_orthogonal_frame_fails() {
        let mut t = straight_track();
        assert_eq!(
            t.rotate(std::f64::consts::FRAC_PI_2 + 0.2),
            Err(UpdateFailure::Geometric)
        );
    }

    #[test]
    fn update_pulls_state_and_shrinks_covariance() {
        let mut t = straight_track();
        t.cov[(0, 0)] = 1.0;
        t.cov[(1, 1)] = 1.0;
        let clus = Cluster {
            sensor_id: SensorId(0),
            x: t.x(),
            y: 0.5,
            z: 0.1,
            sigma_y2: 1e-4,
            sigma_z2: 1e-4,
            sigma_yz: 0.0,
        };
        let chi2 = t.predicted_chi2(&clus);
        assert!(chi2 > 0.0);
        let prior = t.cov()[(0, 0)];
        t.update(&clus).unwrap();
        assert!(t.cov()[(0, 0)] < prior, "update must reduce uncertainty");
        assert_abs_diff_eq!(t.y(), 0.5, epsilon = 1e-3);
    }

    #[test]
    fn update_that_overturns_snp_leaves_the_state_untouched() {
        let mut t = straight_track();
        // Strong y-snp correlation, so a large innovation would push snp
        // past its physical range.
        t.par[2] = 0.9;
        t.cov[(0, 0)] = 1e-2;
        t.cov[(2, 2)] = 1.0;
        t.cov[(0, 2)] = 0.09;
        t.cov[(2, 0)] = 0.09;
        let before = t.clone();
        let clus = Cluster {
            sensor_id: SensorId(0),
            x: t.x(),
            y: 5.0,
            z: 0.0,
            sigma_y2: 1e-6,
            sigma_z2: 1e-6,
            sigma_yz: 0.0,
        };
        assert_eq!(t.update(&clus), Err(UpdateFailure::Geometric));
        assert_abs_diff_eq!(t.y(), before.y(), epsilon = 1e-15);
        assert_abs_diff_eq!(t.snp(), before.snp(), epsilon = 1e-15);
        assert_abs_diff_eq!(t.cov()[(0, 0)], before.cov()[(0, 0)], epsilon = 1e-15);
    }

    #[test]
    fn material_correction_inflates_angles_and_slows_track() {
        let mut t = straight_track();
        let c22 = t.cov()[(2, 2)];
        let q2pt0 = t.q2pt();
        t.correct_for_material(0.005 / SI_RAD_LENGTH, 0.005 * SI_DENSITY, MatCorrType::Full)
            .unwrap();
        assert!(t.cov()[(2, 2)] > c22);
        assert!(t.q2pt() > q2pt0, "energy loss must lower pt");
    }

    #[test]
    fn from_vertex_reproduces_kinematics() {
        let vtx = Vec3::new(3.0, 4.0, -2.0);
        let mom = Vec3::new(0.6, 0.8, 0.5);
        let t =
            TrackParCov::from_vertex(&vtx, &mom, &(Mat3::identity() * 1e-4), 1, Pid::HyperTriton)
                .unwrap();
        let g = t.xyz_global();
        assert_abs_diff_eq!(g.x, 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g.y, 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g.z, -2.0, epsilon = 1e-12);
        let p = t.pxpypz_global();
        assert_abs_diff_eq!(p.x, 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(p.y, 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(p.z, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn reset_covariance_drops_correlations() {
        let mut t = straight_track();
        t.cov[(0, 1)] = 5e-5;
        t.cov[(1, 0)] = 5e-5;
        t.reset_covariance(0.0);
        assert_eq!(t.cov()[(0, 1)], 0.0);
        assert!(t.cov()[(0, 0)] > 1e-4);
    }
}
