//! Paths and tunables for the single-instance subsystem.
//!
//! # Storage layout
//!
//! ```text
//! ~/<app_dir>/                  (".app" unless the embedder picks another)
//!   singleton.yaml              (optional SingletonConfig overrides)
//!   singleton/
//!     <identity>_<port>         (one marker per live host, mode 0600)
//! ```
//!
//! Like the marker store, every loader has an `_at(home, …)` form used by
//! tests and a no-arg form that resolves `dirs::home_dir()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, SoloError};

pub const DEFAULT_APP_DIR: &str = ".app";
pub const MARKER_DIR: &str = "singleton";
pub const CONFIG_FILE: &str = "singleton.yaml";

/// `<home>/<app_dir>/`
pub fn app_root(home: &Path, app_dir: &str) -> PathBuf {
    home.join(app_dir)
}

/// `<home>/<app_dir>/singleton/`
pub fn marker_dir(home: &Path, app_dir: &str) -> PathBuf {
    app_root(home, app_dir).join(MARKER_DIR)
}

/// `<home>/<app_dir>/singleton.yaml`
pub fn config_path(home: &Path, app_dir: &str) -> PathBuf {
    app_root(home, app_dir).join(CONFIG_FILE)
}

pub(crate) fn home() -> Result<PathBuf, SoloError> {
    dirs::home_dir().ok_or(SoloError::HomeNotFound)
}

/// Text encoding announced in the first byte of every connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireEncoding {
    /// Selector `1`. The platform default charset, which is UTF-8 here.
    #[default]
    Platform,
    /// Selector `2`.
    Utf16le,
}

impl WireEncoding {
    pub fn selector(self) -> u8 {
        match self {
            WireEncoding::Platform => 1,
            WireEncoding::Utf16le => 2,
        }
    }

    pub fn from_selector(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(WireEncoding::Platform),
            2 => Some(WireEncoding::Utf16le),
            _ => None,
        }
    }
}

/// What a host does when a connection presents the wrong secret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Close the listener, remove the marker and stop serving.
    #[default]
    Shutdown,
    /// Drop only the offending connection.
    DropConnection,
}

/// Timeouts, retry counts and policies for server and client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SingletonConfig {
    /// Deadline for each line the server reads from a connection.
    pub read_timeout_ms: u64,
    /// Deadline for each response read attempt on the client side.
    pub response_timeout_ms: u64,
    pub response_attempts: u32,
    pub exit_poll_interval_ms: u64,
    /// Cap on waiting for a ceding host's marker to disappear.
    pub exit_wait_timeout_ms: u64,
    pub listen_backlog: u32,
    pub encoding: WireEncoding,
    pub on_secret_mismatch: MismatchPolicy,
    /// Delete a marker whose port refuses connections.
    pub remove_stale_markers: bool,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10_000,
            response_timeout_ms: 10_000,
            response_attempts: 5,
            exit_poll_interval_ms: 100,
            exit_wait_timeout_ms: 30_000,
            listen_backlog: 16,
            encoding: WireEncoding::Platform,
            on_secret_mismatch: MismatchPolicy::Shutdown,
            remove_stale_markers: true,
        }
    }
}

impl SingletonConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }

    pub fn exit_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_wait_timeout_ms)
    }

    /// Load `<home>/<app_dir>/singleton.yaml`, falling back to defaults when
    /// the file does not exist.
    pub fn load_at(home: &Path, app_dir: &str) -> Result<Self, SoloError> {
        let path = config_path(home, app_dir);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(io_err(&path, err)),
        };

        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&text).map_err(|source| SoloError::Parse { path, source })
    }

    /// `load_at` convenience wrapper.
    pub fn load(app_dir: &str) -> Result<Self, SoloError> {
        Self::load_at(&home()?, app_dir)
    }
}
