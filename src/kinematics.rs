//! Decay kinematics: asymmetry statistic and invariant-mass helpers.

use crate::types::{Pid, Vec3};

/// Longitudinal-momentum decay asymmetry of a two-prong decay:
/// `(ql⁺ − ql⁻) / (ql⁺ + ql⁻)` with `ql` the prong momentum projected on
/// the parent direction. The sign tells which prong carries the larger
/// momentum fraction.
pub fn decay_asymmetry(parent: &Vec3, first: &Vec3, second: &Vec3) -> f64 {
    let norm = parent.norm();
    if norm < 1e-12 {
        return 0.0;
    }
    let ql_first = first.dot(parent) / norm;
    let ql_second = second.dot(parent) / norm;
    let sum = ql_first + ql_second;
    if sum.abs() < 1e-12 {
        return 0.0;
    }
    (ql_first - ql_second) / sum
}

/// Invariant mass of the parent from daughter momenta squared and their
/// identity hypotheses: `m² = (E₁ + E₂)² − p²`.
pub fn mother_mass(p2_mother: f64, p2_first: f64, p2_second: f64, pid_first: Pid, pid_second: Pid) -> f64 {
    let e = (p2_first + pid_first.mass2()).sqrt() + (p2_second + pid_second.mass2()).sqrt();
    (e * e - p2_mother).max(0.0).sqrt()
}

/// Invariant mass of a kink mother: the unseen neutral carries the
/// momentum difference between mother and charged daughter.
pub fn kink_mother_mass(p_mother: &Vec3, p_daughter: &Vec3, pid_daughter: Pid, pid_neutral: Pid) -> f64 {
    let p_neutral = p_mother - p_daughter;
    let e_daughter = (p_daughter.norm_squared() + pid_daughter.mass2()).sqrt();
    let e_neutral = (p_neutral.norm_squared() + pid_neutral.mass2()).sqrt();
    let e = e_daughter + e_neutral;
    (e * e - p_mother.norm_squared()).max(0.0).sqrt()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn asymmetry_sign_follows_momentum_share() {
        let parent = Vec3::new(1.0, 0.0, 0.0);
        let heavy = Vec3::new(0.8, 0.1, 0.0);
        let light = Vec3::new(0.2, -0.1, 0.0);
        assert!(decay_asymmetry(&parent, &heavy, &light) > 0.0);
        assert!(decay_asymmetry(&parent, &light, &heavy) < 0.0);
    }

    #[test]
    fn asymmetry_of_symmetric_decay_is_zero() {
        let parent = Vec3::new(0.0, 2.0, 0.0);
        let a = Vec3::new(0.3, 1.0, 0.0);
        let b = Vec3::new(-0.3, 1.0, 0.0);
        assert_abs_diff_eq!(decay_asymmetry(&parent, &a, &b), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn mother_mass_at_rest_is_energy_sum() {
        // Back-to-back daughters: parent at rest, m = E1 + E2
        let p2 = 0.25;
        let m = mother_mass(0.0, p2, p2, Pid::Proton, Pid::Pion);
        let expected =
            (p2 + Pid::Proton.mass2()).sqrt() + (p2 + Pid::Pion.mass2()).sqrt();
        assert_abs_diff_eq!(m, expected, epsilon = 1e-12);
    }

    #[test]
    fn kink_mass_reduces_to_two_body_mass() {
        let p_mother = Vec3::new(1.0, 0.0, 0.2);
        let p_daughter = Vec3::new(0.7, 0.05, 0.15);
        let m = kink_mother_mass(&p_mother, &p_daughter, Pid::Triton, Pid::Pion);
        assert!(m > Pid::Triton.mass() + Pid::Pion.mass() - 1e-9);
    }
}
