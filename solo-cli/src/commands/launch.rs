//! `solo launch`: delegate to the running instance or become it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use solo_core::{ActivationRequest, Identity, PROP_CONFIG_HASH, PROP_USER};
use solo_ipc::{build_runtime, runtime::log_activation, Coordinator, LaunchOutcome, PropertyGate};

use super::{home, IdentityArgs};

const HOST_POLL: Duration = Duration::from_millis(200);

/// Arguments for `solo launch`.
#[derive(Args, Debug)]
pub struct LaunchArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Arguments handed to the running instance.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl LaunchArgs {
    pub fn run(self, app_dir: &str) -> Result<()> {
        let home = home()?;
        let identity = self.identity.resolve()?;
        let coordinator = Coordinator::for_app_at(&home, app_dir)
            .context("failed to load singleton configuration")?;

        let request = ActivationRequest::new(self.args)
            .with_property(PROP_USER, self.identity.user.as_str())
            .with_property(PROP_CONFIG_HASH, self.identity.config_hash.as_str());

        let runtime = build_runtime().context("failed to start async runtime")?;
        runtime.block_on(host_or_delegate(&coordinator, identity, request, &self.identity))
    }
}

async fn host_or_delegate(
    coordinator: &Coordinator,
    identity: Identity,
    request: ActivationRequest,
    wanted: &IdentityArgs,
) -> Result<()> {
    let gate_identity = identity.clone();
    let gate = PropertyGate::for_instance(
        Some(wanted.user.as_str()),
        Some(wanted.config_hash.as_str()),
        move |request: ActivationRequest| {
            log_activation(&gate_identity, &request);
            print_activation(&request);
        },
    );

    let outcome = coordinator
        .launch(identity.clone(), &request, Arc::new(gate))
        .await
        .context("singleton launch failed")?;

    let port = match outcome {
        LaunchOutcome::Delegated => {
            println!("delegated");
            return Ok(());
        }
        LaunchOutcome::Host { port } => port,
    };

    println!("host {port}");
    if !request.arguments.is_empty() {
        log_activation(&identity, &request);
        print_activation(&request);
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!(identity = %identity, "interrupted, stopping singleton server");
            coordinator.stop().await.context("failed to stop singleton server")?;
        }
        _ = server_finished(coordinator) => {
            tracing::info!(identity = %identity, "singleton server ended");
        }
    }

    Ok(())
}

async fn server_finished(coordinator: &Coordinator) {
    while coordinator.port().await.is_some() {
        tokio::time::sleep(HOST_POLL).await;
    }
}

fn print_activation(request: &ActivationRequest) {
    println!("activation: {}", request.arguments.join(" "));
}
