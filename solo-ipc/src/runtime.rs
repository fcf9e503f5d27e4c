//! Runtime, logging and activation log helpers for embedding binaries.

use solo_core::{ActivationRequest, Identity};

use crate::error::{io_err, IpcError};

/// Build the multi-threaded runtime the launcher blocks on.
pub fn build_runtime() -> Result<tokio::runtime::Runtime, IpcError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))
}

/// Install the stderr `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` filter; `json` switches to JSON lines.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Log line for an activation the host absorbed.
pub fn log_activation(identity: &Identity, request: &ActivationRequest) {
    tracing::info!(
        identity = %identity,
        arguments = ?request.arguments,
        "new activation"
    );
}
