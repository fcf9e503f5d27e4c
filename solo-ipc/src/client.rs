//! Launch-side singleton client: find a host and hand it our arguments.
//!
//! Every failure to talk to a host collapses to [`Invocation::NotRunning`]
//! so the caller can always fall back to becoming host itself. The only
//! errors returned are requests that cannot be framed on the wire.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;

use solo_core::{
    ActivationRequest, Identity, MarkerRecord, MarkerStore, Secret, SingletonConfig, WireEncoding,
};

use crate::error::{io_err, IpcError};
use crate::protocol::{self, LineReader, Reply};

/// Result of trying to delegate a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// No reachable host; the caller should become host.
    NotRunning,
    /// The host replied `si.ack`; the caller should exit 0.
    Delegated,
    /// The host replied `si.exit` and is shutting down. `marker_cleared` is
    /// false when its marker outlived the wait; the caller becomes host
    /// either way.
    Ceded { marker_cleared: bool },
}

#[derive(Debug, Clone)]
pub struct SingletonClient {
    store: MarkerStore,
    config: SingletonConfig,
}

impl SingletonClient {
    pub fn new(store: MarkerStore, config: SingletonConfig) -> Self {
        Self { store, config }
    }

    /// Try to forward `request` to the host of `identity`.
    pub async fn invoke(
        &self,
        identity: &Identity,
        request: &ActivationRequest,
    ) -> Result<Invocation, IpcError> {
        let Some(marker) = self.store.find(identity) else {
            tracing::debug!(identity = %identity, "no running instance");
            return Ok(Invocation::NotRunning);
        };

        let payload = protocol::encode_activation(self.config.encoding, marker.secret, request)?;
        tracing::info!(identity = %identity, port = marker.port, "connecting to running instance");

        match self.exchange(&marker, &payload).await {
            Ok(Some(Reply::Ack)) => {
                tracing::debug!("got {}", Reply::Ack.as_str());
                Ok(Invocation::Delegated)
            }
            Ok(Some(Reply::Exit)) => {
                tracing::info!(port = marker.port, "running instance is exiting, waiting for it");
                let marker_cleared = self.wait_for_marker_removal(&marker).await;
                Ok(Invocation::Ceded { marker_cleared })
            }
            Ok(None) => {
                tracing::error!(port = marker.port, "no ACK from running instance");
                Ok(Invocation::NotRunning)
            }
            Err(err) => {
                if err.is_connection_refused() && self.config.remove_stale_markers {
                    tracing::warn!(port = marker.port, "nothing listening behind marker, removing it");
                    self.store.remove(&marker.identity, marker.port);
                } else {
                    tracing::error!(port = marker.port, error = %err, "cannot reach running instance");
                }
                Ok(Invocation::NotRunning)
            }
        }
    }

    /// Ask the host of `identity` to stop. Returns false when no marker exists.
    pub async fn request_stop(&self, identity: &Identity) -> Result<bool, IpcError> {
        let Some(marker) = self.store.find(identity) else {
            return Ok(false);
        };
        send_stop(
            marker.port,
            marker.secret,
            self.config.encoding,
            self.config.response_timeout(),
        )
        .await?;
        Ok(true)
    }

    /// Poll until `marker`'s file is gone or the configured wait runs out.
    ///
    /// Returns whether the marker disappeared in time. A host stuck on its
    /// way out is not fatal: callers proceed to start anyway.
    pub async fn wait_for_marker_removal(&self, marker: &MarkerRecord) -> bool {
        let deadline = Instant::now() + self.config.exit_wait_timeout();
        loop {
            if !self.store.exists(&marker.identity, marker.port) {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    identity = %marker.identity,
                    port = marker.port,
                    "previous instance marker still present, starting anyway"
                );
                return false;
            }
            tokio::time::sleep(self.config.exit_poll_interval()).await;
        }
    }

    /// Send the payload and wait for one recognised reply line.
    async fn exchange(
        &self,
        marker: &MarkerRecord,
        payload: &[u8],
    ) -> Result<Option<Reply>, IpcError> {
        let timeout = self.config.response_timeout();
        let mut stream = connect(marker.port, timeout).await?;
        let addr = loopback(marker.port).to_string();
        stream
            .write_all(payload)
            .await
            .map_err(|e| io_err(&addr, e))?;
        stream.flush().await.map_err(|e| io_err(&addr, e))?;

        let mut lines = LineReader::new(BufReader::new(stream), self.config.encoding, timeout);
        for attempt in 1..=self.config.response_attempts {
            match lines.next_line().await {
                Ok(Some(line)) => match Reply::parse(&line) {
                    Some(reply) => return Ok(Some(reply)),
                    None => tracing::debug!(attempt, line = %line, "ignoring unexpected reply line"),
                },
                Ok(None) => return Ok(None),
                Err(IpcError::Timeout(_)) => {
                    tracing::debug!(attempt, "still waiting for reply");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

async fn connect(port: u16, timeout: Duration) -> Result<TcpStream, IpcError> {
    let addr = loopback(port);
    tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| IpcError::Timeout("singleton connect"))?
        .map_err(|e| io_err(addr.to_string(), e))
}

/// Write a `si.stop` handshake to `127.0.0.1:port`. No reply is expected.
pub(crate) async fn send_stop(
    port: u16,
    secret: Secret,
    encoding: WireEncoding,
    timeout: Duration,
) -> Result<(), IpcError> {
    let addr = loopback(port).to_string();
    let mut stream = connect(port, timeout).await?;
    stream
        .write_all(&protocol::encode_stop(encoding, secret))
        .await
        .map_err(|e| io_err(&addr, e))?;
    stream.flush().await.map_err(|e| io_err(&addr, e))?;
    // The host may already have closed its end after reading the keyword.
    let _ = stream.shutdown().await;
    Ok(())
}
