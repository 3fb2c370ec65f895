//! Error taxonomy for the prefetch layer.
//!
//! Public APIs return `anyhow::Result`; the variants below are attached so
//! callers that care can downcast with `err.downcast_ref::<PrefetchError>()`.
//! Setup-time variants are unrecoverable. The only recoverable failure in
//! the whole layer, a single image failing to decode during a fill run,
//! never surfaces here: it is logged and the run moves on to the next
//! manifest entry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrefetchError {
    /// Manifest file could not be opened or parsed.
    #[error("Failed to read manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    /// Invalid option combination detected at setup.
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Image dimensions violate the crop or batch-shape constraints.
    #[error("Invalid geometry: {reason}")]
    Geometry { reason: String },

    /// Initial skip reaches past the end of the image list.
    #[error("Cannot skip {skip} entries in a list of {len} images")]
    InsufficientData { skip: usize, len: usize },

    /// Bad arguments to ad-hoc batch injection.
    #[error("Invalid argument: {reason}")]
    Argument { reason: String },

    /// The background fill thread panicked or disappeared.
    #[error("Prefetch worker failed: {reason}")]
    Runtime { reason: String },
}

impl PrefetchError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub(crate) fn geometry(reason: impl Into<String>) -> Self {
        Self::Geometry {
            reason: reason.into(),
        }
    }

    pub(crate) fn argument(reason: impl Into<String>) -> Self {
        Self::Argument {
            reason: reason.into(),
        }
    }
}
