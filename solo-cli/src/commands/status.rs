//! `solo status`: report the advertised instance for an identity.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use solo_core::MarkerStore;

use super::{home, IdentityArgs};

/// Arguments for `solo status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,
}

#[derive(Serialize)]
struct StatusJson {
    running: bool,
    identity: String,
    port: Option<u16>,
    marker: Option<String>,
}

impl StatusArgs {
    pub fn run(self, app_dir: &str) -> Result<()> {
        let home = home()?;
        let identity = self.identity.resolve()?;
        let store = MarkerStore::for_app_at(&home, app_dir);

        let marker = store
            .try_find(&identity)
            .with_context(|| format!("failed to scan {}", store.dir().display()))?;

        let report = StatusJson {
            running: marker.is_some(),
            identity: identity.to_string(),
            port: marker.as_ref().map(|m| m.port),
            marker: marker
                .as_ref()
                .map(|m| store.path_for(&m.identity, m.port).display().to_string()),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to render status JSON")?
        );
        Ok(())
    }
}
