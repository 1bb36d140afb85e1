//! `strange-track` — matching of decay-vertex candidates to outer-tracker
//! segments, with constrained vertex refitting.
//!
//! # Module layout
//! - [`types`]      — Fundamental types (IDs, PID table, clusters, attachments)
//! - [`track`]      — Trajectory state: rotation, propagation, material, update
//! - [`geometry`]   — Geometry capability trait + synthetic barrel
//! - [`kinematics`] — Decay asymmetry and invariant-mass helpers
//! - [`fitter`]     — Vertex-fitter capability trait + DCA fitter
//! - [`refit`]      — Composite candidates and the vertex refitter
//! - [`matcher`]    — Cluster-by-cluster candidate matching
//! - [`topology`]   — Cluster-size extraction from raw pattern data
//! - [`error`]      — Failure taxonomy

pub mod error;
pub mod fitter;
pub mod geometry;
pub mod kinematics;
pub mod matcher;
pub mod refit;
pub mod topology;
pub mod track;
pub mod types;

pub use error::{FitError, MatchError, PatternError, UpdateFailure};
pub use fitter::{DcaFitter, FitterConfig, VertexFitter};
pub use geometry::{CylinderGeometry, GeometryLookup};
pub use matcher::{match_candidates_par, CandidateMatcher, MatcherConfig, MatchingResult};
pub use refit::{DecayCandidate, Refitter};
pub use track::{MatCorrType, TrackParCov};
pub use types::{Attachment, AttachmentRecord, Cluster, Pid, ProngId, SensorId, N_LAYERS};
