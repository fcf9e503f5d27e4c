//! File-based advertisement of the current host for an identity.
//!
//! A host writes `<marker_dir>/<identity>_<port>` containing its secret in
//! decimal. Later launches list the directory to find it. Nothing here is
//! transactional: two hosts racing on the same identity can both believe
//! they won, and a crashed host leaves its marker behind.
//!
//! Lookups fail open. Any error while listing or reading is logged and
//! reported as "no marker", because refusing to start is worse than a
//! duplicate instance.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::{self, home};
use crate::error::{io_err, SoloError};
use crate::types::{marker_file_name, Identity, MarkerRecord, Secret};

#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at `<home>/<app_dir>/singleton/`.
    pub fn for_app_at(home: &Path, app_dir: &str) -> Self {
        Self::new(config::marker_dir(home, app_dir))
    }

    /// `for_app_at` convenience wrapper using `dirs::home_dir()`.
    pub fn for_app(app_dir: &str) -> Result<Self, SoloError> {
        Ok(Self::for_app_at(&home()?, app_dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<marker_dir>/<identity>_<port>`. Pure, no I/O.
    pub fn path_for(&self, identity: &Identity, port: u16) -> PathBuf {
        self.dir.join(marker_file_name(identity, port))
    }

    pub fn exists(&self, identity: &Identity, port: u16) -> bool {
        self.path_for(identity, port).exists()
    }

    /// Advertise `identity` as hosted on `port`.
    ///
    /// Any other marker for the same identity is deleted first (best-effort).
    /// The secret goes to a temp file that is renamed into place, so readers
    /// never see a partially written marker.
    pub fn create(
        &self,
        identity: &Identity,
        port: u16,
        secret: Secret,
    ) -> Result<MarkerRecord, SoloError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
            set_dir_permissions(&self.dir)?;
        }

        match self.scan(identity) {
            Ok(existing) => {
                for (name, _) in existing {
                    let path = self.dir.join(&name);
                    tracing::info!(marker = %path.display(), "removing marker with same identity");
                    if let Err(err) = fs::remove_file(&path) {
                        if err.kind() != ErrorKind::NotFound {
                            tracing::warn!(marker = %path.display(), error = %err, "could not remove old marker");
                        }
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "could not list markers before create"),
        }

        let record = MarkerRecord {
            identity: identity.clone(),
            port,
            secret,
        };
        let path = self.dir.join(record.file_name());
        let tmp = self.dir.join(format!(".{}.tmp", record.file_name()));

        fs::write(&tmp, secret.to_string()).map_err(|e| io_err(&tmp, e))?;
        set_file_permissions(&tmp)?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&path, err));
        }

        tracing::debug!(marker = %path.display(), "marker written");
        Ok(record)
    }

    /// First readable marker for `identity`, or `None` ("not running").
    pub fn find(&self, identity: &Identity) -> Option<MarkerRecord> {
        match self.try_find(identity) {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(identity = %identity, error = %err, "marker lookup failed, assuming not running");
                None
            }
        }
    }

    /// Like [`find`](Self::find) but reports directory errors instead of
    /// swallowing them. Unreadable individual markers are still skipped.
    pub fn try_find(&self, identity: &Identity) -> Result<Option<MarkerRecord>, SoloError> {
        for (name, port) in self.scan(identity)? {
            let path = self.dir.join(&name);
            match read_secret(&path) {
                Ok(secret) => {
                    tracing::debug!(identity = %identity, port, "found running instance marker");
                    return Ok(Some(MarkerRecord {
                        identity: identity.clone(),
                        port,
                        secret,
                    }));
                }
                Err(err) => {
                    tracing::warn!(marker = %path.display(), error = %err, "skipping unreadable marker");
                }
            }
        }
        Ok(None)
    }

    /// Delete the marker for `(identity, port)`. Errors are logged, not returned.
    pub fn remove(&self, identity: &Identity, port: u16) {
        let path = self.path_for(identity, port);
        match fs::remove_file(&path) {
            Ok(()) => tracing::info!(marker = %path.display(), "removed marker"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(marker = %path.display(), error = %err, "failed to remove marker");
            }
        }
    }

    /// Marker names for `identity`, sorted so repeated lookups agree.
    fn scan(&self, identity: &Identity) -> Result<Vec<(String, u16)>, SoloError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(io_err(&self.dir, err)),
        };

        let mut found: Vec<(String, u16)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| parse_marker_name(&name, identity).map(|port| (name, port)))
            .collect();
        found.sort();
        Ok(found)
    }
}

/// Port encoded in `name` if it is exactly `<identity>_<port>`.
fn parse_marker_name(name: &str, identity: &Identity) -> Option<u16> {
    let suffix = name.strip_prefix(identity.as_str())?.strip_prefix('_')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse::<u16>().ok().filter(|port| *port != 0)
}

fn read_secret(path: &Path) -> Result<Secret, SoloError> {
    let contents = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let first = contents.lines().next().unwrap_or_default();
    first.parse::<Secret>().map_err(|e| SoloError::MalformedMarker {
        path: path.to_path_buf(),
        reason: format!("secret is not a decimal integer: {e}"),
    })
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), SoloError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), SoloError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), SoloError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), SoloError> {
    Ok(())
}
