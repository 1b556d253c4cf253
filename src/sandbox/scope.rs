//! Per-invocation filesystem scopes
//!
//! Every compile and every run gets its own freshly created directory under the
//! scratch root. The directory is removed when the `Scope` is dropped, on every
//! exit path. A directory that cannot be removed is quarantined: the next scope
//! creation retries the removal and refuses to hand out new scopes until it succeeds.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::TempDir;
use tracing::{debug, error, warn};

use crate::error::LaunchError;

type Quarantine = Arc<Mutex<Vec<PathBuf>>>;

/// Creates scopes under one root and tracks the ones that failed cleanup
#[derive(Debug)]
pub struct ScopeManager {
    root: PathBuf,
    quarantine: Quarantine,
}

impl ScopeManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quarantine: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths that are still waiting to be removed
    pub fn quarantined(&self) -> Vec<PathBuf> {
        self.quarantine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Create a fresh, empty scope (mode 0700)
    pub fn create(&self, label: &str) -> Result<Scope, LaunchError> {
        self.purge_quarantine()?;

        fs::create_dir_all(&self.root).map_err(|source| LaunchError::ScopeCreate {
            root: self.root.clone(),
            source,
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", label))
            .tempdir_in(&self.root)
            .map_err(|source| LaunchError::ScopeCreate {
                root: self.root.clone(),
                source,
            })?;

        debug!("Created scope {}", dir.path().display());

        Ok(Scope {
            dir: Some(dir),
            quarantine: Arc::clone(&self.quarantine),
        })
    }

    fn purge_quarantine(&self) -> Result<(), LaunchError> {
        let mut quarantine = self
            .quarantine
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if quarantine.is_empty() {
            return Ok(());
        }

        quarantine.retain(|path| match force_remove(path) {
            Ok(()) => {
                warn!("Removed quarantined scope {}", path.display());
                false
            }
            Err(e) => {
                error!("Quarantined scope {} still not removable: {}", path.display(), e);
                true
            }
        });

        if quarantine.is_empty() {
            Ok(())
        } else {
            Err(LaunchError::ScopeCleanup(quarantine.clone()))
        }
    }
}

/// A private directory owned by exactly one compile or run
#[derive(Debug)]
pub struct Scope {
    dir: Option<TempDir>,
    quarantine: Quarantine,
}

impl Scope {
    pub fn path(&self) -> &Path {
        // `dir` is only taken in Drop
        self.dir.as_ref().map(TempDir::path).unwrap_or(Path::new(""))
    }

    pub async fn write_file(&self, name: &str, contents: &str) -> Result<(), LaunchError> {
        let path = self.path().join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| LaunchError::io(format!("write {}", path.display()), e))
    }

    /// Create a writable subdirectory; the executor uses one for TMPDIR
    pub async fn create_dir(&self, name: &str) -> Result<PathBuf, LaunchError> {
        let path = self.path().join(name);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| LaunchError::io(format!("create {}", path.display()), e))?;
        Ok(path)
    }

    /// Recursively copy the contents of `source_dir` into this scope.
    /// Symlinks are skipped so a scope can never be used to reach host files.
    pub async fn copy_dir_in(&self, source_dir: &Path) -> Result<(), LaunchError> {
        let mut pending = vec![(source_dir.to_path_buf(), self.path().to_path_buf())];

        while let Some((from, to)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&from)
                .await
                .map_err(|e| LaunchError::io(format!("read {}", from.display()), e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| LaunchError::io(format!("read {}", from.display()), e))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| LaunchError::io(format!("stat {}", entry.path().display()), e))?;
                let target = to.join(entry.file_name());

                if file_type.is_dir() {
                    tokio::fs::create_dir(&target)
                        .await
                        .map_err(|e| LaunchError::io(format!("create {}", target.display()), e))?;
                    pending.push((entry.path(), target));
                } else if file_type.is_file() {
                    tokio::fs::copy(entry.path(), &target)
                        .await
                        .map_err(|e| LaunchError::io(format!("copy {}", target.display()), e))?;
                } else {
                    debug!("Skipping non-regular file {}", entry.path().display());
                }
            }
        }

        Ok(())
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else { return };
        let path = dir.path().to_path_buf();

        let removed = dir.close().or_else(|_| force_remove(&path));
        match removed {
            Ok(()) => debug!("Removed scope {}", path.display()),
            Err(e) => {
                error!(
                    "Failed to remove scope {}: {}. Quarantining it.",
                    path.display(),
                    e
                );
                self.quarantine
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(path);
            }
        }
    }
}

/// Remove a directory tree, restoring owner permissions that the sandboxed
/// program may have taken away (e.g. `chmod 000` on a subdirectory)
fn force_remove(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(_) => {}
    }

    restore_permissions(path);
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn restore_permissions(root: &Path) {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
        let Ok(entries) = fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pending.push(entry.path());
            }
        }
    }
}
