//! Error types for solo-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from identity, marker and configuration handling.
#[derive(Debug, Error)]
pub enum SoloError {
    /// Underlying I/O failure, annotated with the path it happened on.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on config load, with file path and serde_yaml context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The identity cannot be used as a marker file name prefix.
    #[error("invalid identity '{identity}': {reason}")]
    InvalidIdentity {
        identity: String,
        reason: &'static str,
    },

    /// A marker file exists but its content is not a decimal secret.
    #[error("malformed marker at {path}: {reason}")]
    MalformedMarker { path: PathBuf, reason: String },

    /// `dirs::home_dir()` returned `None`; cannot locate the marker directory.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Convenience constructor for [`SoloError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SoloError {
    SoloError::Io {
        path: path.into(),
        source,
    }
}
