use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the singleton wire protocol, server and client.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("core error: {0}")]
    Core(#[from] solo_core::SoloError),

    #[error("unknown encoding selector {0}")]
    UnknownEncoding(u8),

    #[error("line is not valid {0}")]
    Encoding(&'static str),

    /// The connection presented a secret other than this server's.
    #[error("secret mismatch on singleton connection")]
    SecretMismatch,

    #[error("singleton protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("singleton server already running on port {port}")]
    AlreadyStarted { port: u16 },

    #[error("task join failure: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IpcError {
    /// True when nothing was listening on the port we connected to.
    pub fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            IpcError::Io { source, .. } if source.kind() == std::io::ErrorKind::ConnectionRefused
        )
    }
}

/// Convenience constructor for [`IpcError::Io`]. Socket errors use a
/// pseudo-path such as `"127.0.0.1:4000"` for context.
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> IpcError {
    IpcError::Io {
        path: path.into(),
        source,
    }
}
