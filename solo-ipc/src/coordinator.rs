//! Per-process entry point tying client, server and marker store together.
//!
//! Construct one `Coordinator` at startup and pass it by reference. It owns
//! the process's only [`SingletonServer`]; a second `start` while that
//! server runs is refused.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use solo_core::{ActivationRequest, Identity, MarkerStore, SingletonConfig};

use crate::client::{Invocation, SingletonClient};
use crate::error::IpcError;
use crate::gate::ActivationGate;
use crate::server::{ServerExit, SingletonServer};

/// What a launch turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Arguments were handed to a running host; exit 0.
    Delegated,
    /// This process is now the host, listening on `port`.
    Host { port: u16 },
}

pub struct Coordinator {
    config: SingletonConfig,
    store: MarkerStore,
    client: SingletonClient,
    server: Mutex<Option<SingletonServer>>,
}

impl Coordinator {
    pub fn new(store: MarkerStore, config: SingletonConfig) -> Self {
        let client = SingletonClient::new(store.clone(), config.clone());
        Self {
            config,
            store,
            client,
            server: Mutex::new(None),
        }
    }

    /// Store and config under `<home>/<app_dir>/`.
    pub fn for_app_at(home: &Path, app_dir: &str) -> Result<Self, IpcError> {
        let config = SingletonConfig::load_at(home, app_dir)?;
        Ok(Self::new(MarkerStore::for_app_at(home, app_dir), config))
    }

    /// `for_app_at` convenience wrapper using `dirs::home_dir()`.
    pub fn for_app(app_dir: &str) -> Result<Self, IpcError> {
        let config = SingletonConfig::load(app_dir)?;
        Ok(Self::new(MarkerStore::for_app(app_dir)?, config))
    }

    pub fn config(&self) -> &SingletonConfig {
        &self.config
    }

    pub fn store(&self) -> &MarkerStore {
        &self.store
    }

    pub fn client(&self) -> &SingletonClient {
        &self.client
    }

    /// Try to delegate to a running host for `identity`.
    pub async fn invoke(
        &self,
        identity: &Identity,
        request: &ActivationRequest,
    ) -> Result<Invocation, IpcError> {
        self.client.invoke(identity, request).await
    }

    /// Become host for `identity`. Returns the listening port.
    pub async fn start(
        &self,
        identity: Identity,
        gate: Arc<dyn ActivationGate>,
    ) -> Result<u16, IpcError> {
        let mut slot = self.server.lock().await;
        if let Some(server) = slot.as_ref() {
            if server.is_running() {
                return Err(IpcError::AlreadyStarted {
                    port: server.port(),
                });
            }
        }

        let server = SingletonServer::start(identity, self.store.clone(), gate, &self.config).await?;
        let port = server.port();
        *slot = Some(server);
        Ok(port)
    }

    /// Stop this process's server, if any.
    pub async fn stop(&self) -> Result<Option<ServerExit>, IpcError> {
        let server = self.server.lock().await.take();
        match server {
            Some(server) => server.stop().await.map(Some),
            None => {
                tracing::warn!("singleton stop called when not running");
                Ok(None)
            }
        }
    }

    /// Port of the running server, if this process is host.
    pub async fn port(&self) -> Option<u16> {
        self.server
            .lock()
            .await
            .as_ref()
            .filter(|server| server.is_running())
            .map(SingletonServer::port)
    }

    /// Delegate to a running host, or become host when there is none (or
    /// the running one ceded).
    pub async fn launch(
        &self,
        identity: Identity,
        request: &ActivationRequest,
        gate: Arc<dyn ActivationGate>,
    ) -> Result<LaunchOutcome, IpcError> {
        match self.invoke(&identity, request).await? {
            Invocation::Delegated => Ok(LaunchOutcome::Delegated),
            Invocation::NotRunning | Invocation::Ceded { .. } => {
                let port = self.start(identity, gate).await?;
                Ok(LaunchOutcome::Host { port })
            }
        }
    }
}
