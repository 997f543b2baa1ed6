// Status store

//! Transactional access to the persisted [`GatewayStatus`] document.
//!
//! The runner, every PPP hook process and the CLI share one JSON file. A
//! transaction takes an exclusive `flock` on a sibling lock file, loads the
//! document, runs the caller's closure and commits by writing a temp file
//! and renaming it over the original. An `Err` from the closure discards the
//! changes. Long waits (subprocesses, sleeps) must happen outside
//! `transact`; [`StatusStore::snapshot`] is the untransacted read.

use crate::status::GatewayStatus;
use anyhow::{Context, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Handle to the status document; cheap to clone
#[derive(Clone)]
pub struct StatusStore {
    backend: Arc<Backend>,
}

enum Backend {
    File { path: PathBuf, lock_path: PathBuf },
    Memory(Mutex<GatewayStatus>),
}

impl StatusStore {
    /// File-backed store at `path` (created on first commit)
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            backend: Arc::new(Backend::File {
                path,
                lock_path: PathBuf::from(lock_path),
            }),
        }
    }

    /// Process-local store, used by tests and dry runs
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(Backend::Memory(Mutex::new(GatewayStatus::default()))),
        }
    }

    /// Run `f` with exclusive access; changes are committed only on `Ok`
    pub fn transact<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut GatewayStatus) -> Result<R>,
    {
        match self.backend.as_ref() {
            Backend::File { path, lock_path } => {
                let _lock = lock_exclusive(lock_path)?;
                let mut status = read_status(path)?;
                let result = f(&mut status)?;
                write_status(path, &status)?;
                Ok(result)
            }
            Backend::Memory(cell) => {
                let mut guard = cell
                    .lock()
                    .map_err(|_| anyhow::anyhow!("status store mutex poisoned"))?;
                let mut status = guard.clone();
                let result = f(&mut status)?;
                *guard = status;
                Ok(result)
            }
        }
    }

    /// Untransacted read of the current document
    pub fn snapshot(&self) -> Result<GatewayStatus> {
        match self.backend.as_ref() {
            Backend::File { path, .. } => read_status(path),
            Backend::Memory(cell) => cell
                .lock()
                .map(|s| s.clone())
                .map_err(|_| anyhow::anyhow!("status store mutex poisoned")),
        }
    }

    /// Replace the whole document with an empty one
    pub fn reset(&self) -> Result<()> {
        self.transact(|status| {
            *status = GatewayStatus::default();
            Ok(())
        })
    }
}

fn lock_exclusive(lock_path: &Path) -> Result<Flock<fs::File>> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).context("Failed to create status directory")?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| errno)
        .with_context(|| format!("Failed to lock {}", lock_path.display()))
}

fn read_status(path: &Path) -> Result<GatewayStatus> {
    match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(GatewayStatus::default()),
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse status file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GatewayStatus::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read status file {}", path.display())),
    }
}

fn write_status(path: &Path, status: &GatewayStatus) -> Result<()> {
    let json = serde_json::to_string_pretty(status).context("Failed to serialize status")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    file.write_all(json.as_bytes())
        .context("Failed to write status")?;
    file.sync_all().context("Failed to sync status")?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
