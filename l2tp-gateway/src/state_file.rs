// State file writer for shell tooling
//!
//! Mirrors every runner state announcement into a small KEY=VALUE file so
//! init scripts and cron jobs can check the gateway without parsing the
//! status store.

use crate::status::{RunnerState, StartingSubstate};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Write the current runner state to `path`
pub fn write_state(path: &Path, state: RunnerState, substate: Option<StartingSubstate>) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir).context("Failed to create state directory")?;
        }
    }

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let content = format!(
        "STATE={}\nSUBSTATE={}\nPID={}\nTIMESTAMP={}\n",
        state.as_str(),
        substate.map(StartingSubstate::as_str).unwrap_or(""),
        std::process::id(),
        timestamp
    );

    fs::write(path, content).context("Failed to write state file")?;

    Ok(())
}

/// Remove the state file on exit
pub fn cleanup(path: &Path) {
    let _ = fs::remove_file(path);
}
