use thiserror::Error;

use crate::graph_types::EdgeId;

/// Failures raised while reconciling a single feature or edge.
///
/// Everything except [`ReimportError::UnrecoverableProjection`] is recovered
/// per feature and turned into a statistic; the unrecoverable kind stops the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReimportError {
    /// Start and end point of the feature coincide (closed ring).
    #[error("feature '{external_id}' has a degenerate geometry (start equals end)")]
    DegenerateGeometry { external_id: String },

    /// Neither geometry separates the projected start/end far enough apart.
    #[error(
        "stationing direction is ambiguous (separation {old_separation:.3} on old, {new_separation:.3} on new)"
    )]
    StationingAmbiguous {
        old_separation: f64,
        new_separation: f64,
    },

    /// A projected segment ended up inverted relative to the determined direction.
    #[error("segment [{start:.2}, {end:.2}) projected against the stationing direction")]
    ProjectionOrderReversed { start: f64, end: f64 },

    /// An invariant was violated while projecting or splitting. Aborts the run.
    #[error("unrecoverable projection error on edge {edge:?}: {message}")]
    UnrecoverableProjection { edge: Option<EdgeId>, message: String },
}

impl ReimportError {
    pub fn unrecoverable(edge: impl Into<Option<EdgeId>>, message: impl Into<String>) -> Self {
        Self::UnrecoverableProjection {
            edge: edge.into(),
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::UnrecoverableProjection { .. })
    }
}

pub type Result<T> = std::result::Result<T, ReimportError>;
