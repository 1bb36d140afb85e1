//! Candidate matcher: decides, cluster by cluster, whether each outer
//! measurement extends the composite trajectory or one of its daughters.
//!
//! # Processing steps per candidate
//! 1. Reject empty measurement sequences and non-positive decay radii
//! 2. Pick the heavy daughter once, from the decay-asymmetry sign
//! 3. Walk the clusters outermost → innermost:
//!    near/inside the decay radius try the composite, outside try the
//!    heavy daughter; every daughter update triggers a pairwise refit
//! 4. Backward re-pass over composite-attached clusters after a
//!    covariance reset, to tighten the seed-side of the fit
//! 5. Final three-body refit (composite + both daughters)
//! 6. Accept only when enough clusters attached

use crate::error::{MatchError, UpdateFailure};
use crate::fitter::{DcaFitter, FitterConfig, VertexFitter};
use crate::geometry::GeometryLookup;
use crate::refit::{DecayCandidate, Refitter};
use crate::track::{MatCorrType, TrackParCov, SI_DENSITY, SI_RAD_LENGTH};
use crate::types::{Attachment, AttachmentRecord, Cluster, Pid};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Configuration of the candidate matcher. The numeric defaults are tuned
/// detector thresholds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Minimum number of attached clusters for a successful match.
    pub min_attachments: usize,
    /// Chi2 ceiling for accepting a cluster onto a trajectory.
    pub max_chi2: f64,
    /// Half-width of the squared-radius band around the decay radius (cm²).
    pub radius_tolerance: f64,
    /// Homogeneous field (kGauss).
    pub bz: f64,
    /// Material-correction mode.
    pub mat_corr: MatCorrType,
    /// Sensor thickness of the inner layer group (cm).
    pub thin_thickness: f64,
    /// Sensor thickness of the outer layer group (cm).
    pub thick_thickness: f64,
    /// First layer of the outer (thick) group.
    pub thick_layer_min: usize,
    /// Covariance inflation applied before the backward re-pass.
    pub reset_scale2: f64,
    /// Identity hypothesis for the refitted parent.
    pub parent_pid: Pid,
    /// Charge of the refitted parent.
    pub parent_charge: i32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_attachments: 2,
            max_chi2: 32.0,
            radius_tolerance: 4.0,
            bz: -5.0,
            mat_corr: MatCorrType::Approximate,
            thin_thickness: 0.005,
            thick_thickness: 0.01,
            thick_layer_min: 3,
            reset_scale2: 100.0,
            parent_pid: Pid::HyperTriton,
            parent_charge: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Outcome of one successful match; immutable once emitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchingResult {
    /// Final refitted candidate.
    pub candidate: DecayCandidate,
    /// Per-layer attachment bookkeeping.
    pub attachments: AttachmentRecord,
    /// Number of clusters attached overall.
    pub n_attached: usize,
    /// Chi2 of the final composite against the outermost cluster;
    /// negative when the propagation there did not succeed.
    pub match_chi2: f64,
    /// Invariant mass under the prong hypotheses.
    pub mass: f64,
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Drives the cluster loop for one candidate at a time. Owns its two
/// fitter instances; one matcher per worker.
pub struct CandidateMatcher<'g, G: GeometryLookup, F: VertexFitter> {
    config: MatcherConfig,
    geometry: &'g G,
    refitter: Refitter,
    fitter_pair: F,
    fitter_decay: F,
}

impl<'g, G: GeometryLookup, F: VertexFitter> CandidateMatcher<'g, G, F> {
    pub fn new(config: MatcherConfig, geometry: &'g G, fitter_pair: F, fitter_decay: F) -> Self {
        let refitter = Refitter::new(config.parent_pid, config.parent_charge);
        Self {
            config,
            geometry,
            refitter,
            fitter_pair,
            fitter_decay,
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Match one candidate against the ordered clusters of one outer
    /// track segment (outermost layer first).
    pub fn match_candidate(
        &mut self,
        seed: &DecayCandidate,
        clusters: &[Cluster],
    ) -> Result<MatchingResult, MatchError> {
        if clusters.is_empty() {
            return Err(MatchError::InsufficientAttachments {
                got: 0,
                need: self.config.min_attachments,
            });
        }
        let init_r2 = seed.r2();
        if init_r2 <= 0.0 {
            return Err(MatchError::InvalidRadius);
        }

        let mut cand = seed.clone();
        // Heavy daughter picked once for the whole match.
        let heavy = if cand.asymmetry() > 0.0 { 0 } else { 1 };
        let heavy_att = if heavy == 0 {
            Attachment::FirstDaughter
        } else {
            Attachment::SecondDaughter
        };

        let mut attachments = AttachmentRecord::default();
        let mut composite_clusters: Vec<Cluster> = Vec::new();
        let mut n_attached = 0usize;
        let mut try_daughter = true;

        for clus in clusters {
            let diff_r2 = init_r2 - clus.r2();
            let layer = self.geometry.layer(clus.sensor_id);

            // One attachment per layer: a second cluster on an occupied
            // layer is ignored, keeping the record and the counter equal.
            if attachments.get(layer) != Attachment::Unattached {
                debug!(layer, "layer already attached, skipping cluster");
                continue;
            }

            // Near or beyond the decay radius: the cluster may belong to
            // the composite itself.
            if diff_r2 > -self.config.radius_tolerance {
                match self.update_track(clus, &mut cand.track) {
                    Ok(()) => {
                        try_daughter = false;
                        attachments.set(layer, Attachment::Composite);
                        n_attached += 1;
                        composite_clusters.push(clus.clone());
                        debug!(layer, "attached cluster to composite");
                    }
                    Err(failure) => debug!(layer, %failure, "composite attachment rejected"),
                }
            }

            // Outside the decay radius the cluster can only come from the
            // daughter carrying most of the momentum.
            if diff_r2 < self.config.radius_tolerance && try_daughter {
                if self.update_track(clus, &mut cand.prongs[heavy]).is_ok() {
                    cand = self.refitter.recreate_pair(
                        &mut self.fitter_pair,
                        &cand.prongs[0],
                        &cand.prongs[1],
                        cand.prong_ids,
                    )?;
                    attachments.set(layer, heavy_att);
                    n_attached += 1;
                    debug!(layer, "attached cluster to heavy daughter, refit done");
                    continue;
                }
            }

            if n_attached == 0 {
                return Err(MatchError::InsufficientAttachments {
                    got: 0,
                    need: self.config.min_attachments,
                });
            }
        }

        // Backward re-pass: the forward pass started from an imprecise
        // seed, so re-apply the composite clusters outward-to-inward with
        // an inflated covariance.
        if !composite_clusters.is_empty() {
            cand.track.reset_covariance(self.config.reset_scale2);
            for clus in composite_clusters.iter().rev() {
                self.update_track(clus, &mut cand.track)
                    .map_err(|_| MatchError::BackwardPassFailed)?;
            }
        }

        cand = self
            .refitter
            .refit_three_body(&mut self.fitter_decay, &cand)?;

        if n_attached < self.config.min_attachments {
            return Err(MatchError::InsufficientAttachments {
                got: n_attached,
                need: self.config.min_attachments,
            });
        }

        let match_chi2 = self.matching_chi2(&cand, &clusters[0]);
        let mass = cand.mass();
        debug!(n_attached, match_chi2, mass, "candidate matched");

        Ok(MatchingResult {
            candidate: cand,
            attachments,
            n_attached,
            match_chi2,
            mass,
        })
    }

    /// Shared update procedure: rotate to the sensor frame, propagate to
    /// the cluster surface, correct for the layer material, gate on chi2,
    /// then absorb the measurement.
    pub fn update_track(
        &self,
        clus: &Cluster,
        track: &mut TrackParCov,
    ) -> Result<(), UpdateFailure> {
        let alpha = self.geometry.sensor_alpha(clus.sensor_id);
        let layer = self.geometry.layer(clus.sensor_id);
        let thick = if layer < self.config.thick_layer_min {
            self.config.thin_thickness
        } else {
            self.config.thick_thickness
        };

        let mut updated = track.clone();
        updated.rotate(alpha)?;
        updated.propagate_to(clus.x, self.config.bz)?;
        updated.correct_for_material(
            thick / SI_RAD_LENGTH,
            thick * SI_DENSITY,
            self.config.mat_corr,
        )?;
        let chi2 = updated.predicted_chi2(clus);
        if chi2 <= 0.0 || chi2 >= self.config.max_chi2 {
            return Err(UpdateFailure::Compatibility { chi2 });
        }
        updated.update(clus)?;
        *track = updated;
        Ok(())
    }

    /// Quality of the final match: chi2 of the composite trajectory
    /// against the outermost cluster. Negative when the composite cannot
    /// be brought to that surface.
    fn matching_chi2(&self, cand: &DecayCandidate, outer_clus: &Cluster) -> f64 {
        let alpha = self.geometry.sensor_alpha(outer_clus.sensor_id);
        let mut track = cand.track.clone();
        if track.rotate(alpha).is_ok() && track.propagate_to(outer_clus.x, self.config.bz).is_ok() {
            track.predicted_chi2(outer_clus)
        } else {
            -1.0
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel batch driver
// ---------------------------------------------------------------------------

/// Match a batch of independent candidates in parallel. Each rayon worker
/// owns its matcher and fitter pair; a failed candidate yields an `Err`
/// entry and never aborts the batch.
pub fn match_candidates_par<G: GeometryLookup + Sync>(
    config: &MatcherConfig,
    fitter_config: &FitterConfig,
    geometry: &G,
    jobs: &[(DecayCandidate, Vec<Cluster>)],
) -> Vec<Result<MatchingResult, MatchError>> {
    jobs.par_iter()
        .map_init(
            || {
                CandidateMatcher::new(
                    config.clone(),
                    geometry,
                    DcaFitter::new(*fitter_config),
                    DcaFitter::new(*fitter_config),
                )
            },
            |matcher, (cand, clusters)| matcher.match_candidate(cand, clusters),
        )
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::CylinderGeometry;
    use crate::types::{Mat3, ProngId, Vec3};
    use approx::assert_abs_diff_eq;

    const BZ: f64 = -5.0;

    fn geometry() -> CylinderGeometry {
        CylinderGeometry::seven_layer_barrel()
    }

    fn matcher(
        geom: &CylinderGeometry,
        config: MatcherConfig,
    ) -> CandidateMatcher<'_, CylinderGeometry, DcaFitter> {
        let fc = FitterConfig::default();
        CandidateMatcher::new(config, geom, DcaFitter::new(fc), DcaFitter::new(fc))
    }

    /// Two-prong candidate decaying at radius ~14 cm: inside the outer
    /// layer group, outside the inner one.
    fn seed_candidate() -> DecayCandidate {
        let vtx = Vec3::new(14.0, 1.0, 0.5);
        let p_heavy = Vec3::new(1.9, 0.25, 0.2);
        let p_light = Vec3::new(0.35, -0.02, 0.03);
        let mut heavy =
            TrackParCov::from_vertex(&vtx, &p_heavy, &(Mat3::identity() * 1e-4), 1, Pid::Helium3)
                .unwrap();
        heavy.set_abs_charge(2.0);
        let light =
            TrackParCov::from_vertex(&vtx, &p_light, &(Mat3::identity() * 1e-4), -1, Pid::Pion)
                .unwrap();
        DecayCandidate::new(
            vtx,
            p_heavy + p_light,
            Mat3::identity() * 1e-4,
            [heavy, light],
            [ProngId(0), ProngId(1)],
            1,
            Pid::HyperTriton,
        )
        .unwrap()
    }

    /// Put a cluster exactly on the trajectory at the given layer, in the
    /// sensor frame the trajectory's azimuth falls into.
    fn cluster_on(
        geom: &CylinderGeometry,
        track: &TrackParCov,
        layer: usize,
        sigma2: f64,
    ) -> Cluster {
        let mut t = track.clone();
        let radius = geom.layer_radius(layer);
        // Aim at the sector matching the track's azimuth at that radius.
        let g = t.xyz_global();
        let mut sector = geom.sector_at(g.y.atan2(g.x));
        for _ in 0..2 {
            let sensor = geom.sensor(layer, sector);
            let alpha = geom.sensor_alpha(sensor);
            let mut probe = track.clone();
            if probe.rotate(alpha).is_ok() && probe.propagate_to(radius, BZ).is_ok() {
                let pg = probe.xyz_global();
                sector = geom.sector_at(pg.y.atan2(pg.x));
                t = probe;
            }
        }
        let sensor = geom.sensor(layer, sector);
        // Sub-sigma offsets keep the chi2 small but strictly positive.
        let jitter = 0.4 * sigma2.sqrt();
        Cluster {
            sensor_id: sensor,
            x: radius,
            y: t.y() + jitter,
            z: t.z() - jitter,
            sigma_y2: sigma2,
            sigma_z2: sigma2,
            sigma_yz: 0.0,
        }
    }

    /// Clusters along the composite path on the inner layers, outermost
    /// first, each generated from the state the matcher will actually
    /// carry (propagation + update in sequence).
    fn composite_clusters(
        geom: &CylinderGeometry,
        cand: &DecayCandidate,
        layers: &[usize],
    ) -> Vec<Cluster> {
        let mut track = cand.track.clone();
        let mut out = Vec::new();
        for &layer in layers {
            let clus = cluster_on(geom, &track, layer, 1e-4);
            let alpha = geom.sensor_alpha(clus.sensor_id);
            track.rotate(alpha).unwrap();
            track.propagate_to(clus.x, BZ).unwrap();
            track.update(&clus).unwrap();
            out.push(clus);
        }
        out
    }

    #[test]
    fn empty_sequence_is_rejected_before_geometry() {
        let geom = geometry();
        let mut m = matcher(&geom, MatcherConfig::default());
        let cand = seed_candidate();
        assert_eq!(
            m.match_candidate(&cand, &[]).unwrap_err(),
            MatchError::InsufficientAttachments { got: 0, need: 2 }
        );
    }

    #[test]
    fn zero_attachable_clusters_fail_as_insufficient() {
        let geom = geometry();
        let mut m = matcher(&geom, MatcherConfig::default());
        let cand = seed_candidate();
        // A cluster far off any trajectory: chi2 gate rejects everything.
        let bogus = Cluster {
            sensor_id: geom.sensor(2, 6),
            x: geom.layer_radius(2),
            y: 30.0,
            z: -40.0,
            sigma_y2: 1e-4,
            sigma_z2: 1e-4,
            sigma_yz: 0.0,
        };
        assert_eq!(
            m.match_candidate(&cand, &[bogus]).unwrap_err(),
            MatchError::InsufficientAttachments { got: 0, need: 2 }
        );
    }

    #[test]
    fn on_axis_decay_vertex_is_rejected_as_invalid_radius() {
        let geom = geometry();
        let mut m = matcher(&geom, MatcherConfig::default());
        let vtx = Vec3::new(0.0, 0.0, 5.0);
        let p_heavy = Vec3::new(1.9, 0.25, 0.2);
        let p_light = Vec3::new(0.35, -0.02, 0.03);
        let heavy =
            TrackParCov::from_vertex(&vtx, &p_heavy, &(Mat3::identity() * 1e-4), 1, Pid::Helium3)
                .unwrap();
        let light =
            TrackParCov::from_vertex(&vtx, &p_light, &(Mat3::identity() * 1e-4), -1, Pid::Pion)
                .unwrap();
        let cand = DecayCandidate::new(
            vtx,
            p_heavy + p_light,
            Mat3::identity() * 1e-4,
            [heavy, light],
            [ProngId(0), ProngId(1)],
            1,
            Pid::HyperTriton,
        )
        .unwrap();
        let clus = Cluster {
            sensor_id: geom.sensor(2, 0),
            x: geom.layer_radius(2),
            y: 0.0,
            z: 0.0,
            sigma_y2: 1e-4,
            sigma_z2: 1e-4,
            sigma_yz: 0.0,
        };
        assert_eq!(
            m.match_candidate(&cand, &[clus]).unwrap_err(),
            MatchError::InvalidRadius
        );
    }

    #[test]
    fn second_cluster_on_an_occupied_layer_is_skipped() {
        let geom = geometry();
        let config = MatcherConfig {
            min_attachments: 1,
            ..Default::default()
        };
        let mut m = matcher(&geom, config);
        let cand = seed_candidate();
        let clusters = composite_clusters(&geom, &cand, &[2]);
        let twice = vec![clusters[0].clone(), clusters[0].clone()];
        let res = m.match_candidate(&cand, &twice).unwrap();
        assert_eq!(res.n_attached, 1);
        assert_eq!(res.attachments.attached_count(), res.n_attached);
        assert_eq!(res.attachments.get(2), Attachment::Composite);
    }

    #[test]
    fn chi2_equal_to_the_ceiling_is_rejected() {
        let geom = geometry();
        let cand = seed_candidate();
        let clus = cluster_on(&geom, &cand.track, 2, 1e-4);
        // Extract the exact chi2 of the attempt through the failure payload.
        let tight = matcher(
            &geom,
            MatcherConfig {
                max_chi2: 1e-12,
                ..Default::default()
            },
        );
        let mut track = cand.track.clone();
        let chi2 = match tight.update_track(&clus, &mut track) {
            Err(UpdateFailure::Compatibility { chi2 }) => chi2,
            other => panic!("expected compatibility failure, got {other:?}"),
        };
        let at_ceiling = matcher(
            &geom,
            MatcherConfig {
                max_chi2: chi2,
                ..Default::default()
            },
        );
        let mut track = cand.track.clone();
        assert!(matches!(
            at_ceiling.update_track(&clus, &mut track),
            Err(UpdateFailure::Compatibility { .. })
        ));
    }

    #[test]
    fn single_compatible_cluster_attaches_to_composite() {
        let geom = geometry();
        let config = MatcherConfig {
            min_attachments: 1,
            ..Default::default()
        };
        let mut m = matcher(&geom, config);
        let cand = seed_candidate();
        let clusters = composite_clusters(&geom, &cand, &[2]);
        let res = m.match_candidate(&cand, &clusters).unwrap();
        assert_eq!(res.n_attached, 1);
        assert_eq!(res.attachments.get(2), Attachment::Composite);
        assert_eq!(res.attachments.attached_count(), res.n_attached);
    }

    #[test]
    fn outer_cluster_attaches_to_heavy_daughter_and_triggers_refit() {
        let geom = geometry();
        let config = MatcherConfig {
            min_attachments: 1,
            ..Default::default()
        };
        let mut m = matcher(&geom, config);
        let cand = seed_candidate();
        assert!(cand.asymmetry() > 0.0, "helium prong must be the heavy one");
        // Cluster on the heavy daughter at layer 4 (r = 24.4 cm), well
        // outside the 14 cm decay radius.
        let clus = cluster_on(&geom, &cand.prongs[0], 4, 1e-4);
        let res = m.match_candidate(&cand, &[clus]).unwrap();
        assert_eq!(res.attachments.get(4), Attachment::FirstDaughter);
        assert_eq!(res.n_attached, 1);
        // The refit ran: vertex is re-solved, still near the true one.
        assert_abs_diff_eq!(res.candidate.vertex.x, 14.0, epsilon = 0.5);
    }

    #[test]
    fn full_match_attaches_inner_and_outer_clusters() {
        let geom = geometry();
        let mut m = matcher(&geom, MatcherConfig::default());
        let cand = seed_candidate();
        let mut clusters = vec![cluster_on(&geom, &cand.prongs[0], 4, 1e-4)];
        clusters.extend(composite_clusters(&geom, &cand, &[2, 1, 0]));
        let res = m.match_candidate(&cand, &clusters).unwrap();
        assert!(res.n_attached >= 3, "attached only {}", res.n_attached);
        assert_eq!(res.attachments.attached_count(), res.n_attached);
        assert_eq!(res.attachments.get(4), Attachment::FirstDaughter);
        assert_eq!(res.attachments.get(2), Attachment::Composite);
        // Momentum invariant after the final refit.
        let sum = res.candidate.prongs[0].pxpypz_global()
            + res.candidate.prongs[1].pxpypz_global();
        assert_abs_diff_eq!(res.candidate.momentum.x, sum.x, epsilon = 1e-9);
        assert!(res.mass > 2.9 && res.mass < 3.2, "mass {}", res.mass);
    }

    #[test]
    fn backward_pass_keeps_the_attached_count() {
        let geom = geometry();
        let mut m = matcher(&geom, MatcherConfig::default());
        let cand = seed_candidate();
        let clusters = composite_clusters(&geom, &cand, &[2, 1, 0]);
        let res = m.match_candidate(&cand, &clusters).unwrap();
        // All three composite clusters survived the backward re-pass.
        assert_eq!(res.n_attached, 3);
        assert_eq!(res.attachments.attached_count(), 3);
    }

    #[test]
    fn update_track_rejects_incompatible_cluster_locally() {
        let geom = geometry();
        let m = matcher(&geom, MatcherConfig::default());
        let cand = seed_candidate();
        let mut clus = cluster_on(&geom, &cand.track, 2, 1e-4);
        clus.y += 5.0; // far outside the chi2 gate
        let mut track = cand.track.clone();
        match m.update_track(&clus, &mut track) {
            Err(UpdateFailure::Compatibility { chi2 }) => assert!(chi2 > 32.0),
            other => panic!("expected compatibility failure, got {other:?}"),
        }
        // The trajectory is untouched by the failed attempt.
        assert_abs_diff_eq!(track.y(), cand.track.y(), epsilon = 1e-12);
    }

    #[test]
    fn matching_result_serializes_and_restores() {
        let geom = geometry();
        let mut m = matcher(&geom, MatcherConfig::default());
        let cand = seed_candidate();
        let clusters = composite_clusters(&geom, &cand, &[2, 1, 0]);
        let res = m.match_candidate(&cand, &clusters).unwrap();
        let json = serde_json::to_string(&res).unwrap();
        let back: MatchingResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_attached, res.n_attached);
        assert_abs_diff_eq!(back.mass, res.mass, epsilon = 1e-12);
        assert_abs_diff_eq!(
            back.candidate.vertex.x,
            res.candidate.vertex.x,
            epsilon = 1e-12
        );
    }

    #[test]
    fn parallel_batch_isolates_failures() {
        let geom = geometry();
        let cand = seed_candidate();
        let good = composite_clusters(&geom, &cand, &[2, 1, 0]);
        let jobs = vec![
            (cand.clone(), good),
            (cand.clone(), vec![]), // empty: fails, must not poison others
        ];
        let results = match_candidates_par(
            &MatcherConfig::default(),
            &FitterConfig::default(),
            &geom,
            &jobs,
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(
            results[1].as_ref().unwrap_err(),
            &MatchError::InsufficientAttachments { got: 0, need: 2 }
        );
    }
}
