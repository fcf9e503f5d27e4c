pub mod launch;
pub mod status;
pub mod stop;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use solo_core::Identity;

/// How a command picks the singleton identity.
#[derive(Args, Debug, Clone)]
pub struct IdentityArgs {
    /// Explicit identity; overrides the user/config derivation.
    #[arg(long)]
    pub id: Option<String>,

    /// User the instance runs for.
    #[arg(long, env = "USER", default_value = "anon")]
    pub user: String,

    /// Hash of the instance configuration.
    #[arg(long, default_value = "default")]
    pub config_hash: String,
}

impl IdentityArgs {
    pub fn resolve(&self) -> Result<Identity> {
        match &self.id {
            Some(id) => Identity::new(id.as_str()).context("invalid --id"),
            None => Ok(Identity::derive(&self.user, &self.config_hash)),
        }
    }
}

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}
