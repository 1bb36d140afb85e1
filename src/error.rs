//! Failure taxonomy for matching and vertex fitting.
//!
//! Non-convergence and incompatibility are expected, frequent outcomes:
//! they are ordinary `Err` values, never panics. A failed candidate is
//! skipped by the caller; it must never abort a batch.

use thiserror::Error;

/// Failure of one attachment attempt. Local to a single cluster: the
/// matcher skips the attachment and moves on.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum UpdateFailure {
    /// Frame rotation undefined or trajectory propagation did not converge.
    #[error("rotation/propagation to the measurement surface failed")]
    Geometric,
    /// The chi2 test rejected the measurement against the propagated state.
    #[error("chi2 {chi2} outside acceptance")]
    Compatibility { chi2: f64 },
}

/// Failure of a constrained vertex fit. Aborts the refit call; the
/// candidate under construction is left untouched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitError {
    #[error("vertex fit did not converge")]
    NonConvergence,
    #[error("vertex fit diverged outside the fiducial region")]
    Diverged,
    #[error("prong propagation to the vertex failed")]
    PropagationFailed,
    #[error("fitter supports 2 or 3 prongs, got {0}")]
    ProngCount(usize),
}

/// Failure of one full match attempt.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchError {
    #[error("candidate has no positive decay-radius estimate")]
    InvalidRadius,
    #[error("only {got} measurements attached, {need} required")]
    InsufficientAttachments { got: usize, need: usize },
    #[error("backward re-pass over attached measurements failed")]
    BackwardPassFailed,
    #[error("vertex refit failed: {0}")]
    FitNonConvergence(#[from] FitError),
}

/// Failure while decoding raw cluster pattern data.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternError {
    #[error("raw pattern stream truncated at cluster {cluster}")]
    TruncatedStream { cluster: usize },
    #[error("pattern id {0} not present in the dictionary")]
    UnknownPattern(u16),
}
