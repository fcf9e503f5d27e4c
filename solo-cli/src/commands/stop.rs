//! `solo stop`: ask the running instance to shut down.

use anyhow::{Context, Result};
use clap::Args;

use solo_core::{Identity, MarkerRecord};
use solo_ipc::{build_runtime, Coordinator};

use super::{home, IdentityArgs};

/// Arguments for `solo stop`.
#[derive(Args, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,
}

impl StopArgs {
    pub fn run(self, app_dir: &str) -> Result<()> {
        let home = home()?;
        let identity = self.identity.resolve()?;
        let coordinator = Coordinator::for_app_at(&home, app_dir)
            .context("failed to load singleton configuration")?;

        let Some(marker) = coordinator.store().find(&identity) else {
            println!("not running");
            return Ok(());
        };

        let runtime = build_runtime().context("failed to start async runtime")?;
        runtime.block_on(stop_host(&coordinator, &identity, &marker))
    }
}

async fn stop_host(coordinator: &Coordinator, identity: &Identity, marker: &MarkerRecord) -> Result<()> {
    let sent = match coordinator.client().request_stop(identity).await {
        Ok(sent) => sent,
        Err(err) if err.is_connection_refused() => {
            coordinator.store().remove(&marker.identity, marker.port);
            false
        }
        Err(err) => return Err(err).context("failed to send stop request"),
    };
    if !sent {
        println!("not running");
        return Ok(());
    }

    if !coordinator.client().wait_for_marker_removal(marker).await {
        tracing::warn!(identity = %identity, "instance did not remove its marker in time");
    }
    println!("stop requested");
    Ok(())
}
