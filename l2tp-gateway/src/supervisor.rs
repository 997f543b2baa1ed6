// Runner supervisor

//! Parent side of the runner protocol.
//!
//! The runner is started as a child process and reports each state change
//! as a `*** STATE:` line on its stdout. The supervisor follows those lines
//! on a background task and publishes a coarse lifecycle state through a
//! watch channel that callers can await.
//!
//! A SIGTERM that reaches the runner while it is still starting may be
//! lost, so a stop requested before RUNNING is signalled again once the
//! runner reports RUNNING.

use crate::exec::{Executor, SystemExecutor};
use crate::status::{parse_state_line, RunnerState, StartingSubstate};
use crate::types::RunMode;
use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;

/// Coarse lifecycle of the supervised runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Child spawned, RUNNING not yet seen
    Starting,
    /// Child reported RUNNING
    Running,
    /// Stop requested
    Stopping,
    /// Child exited
    Stopped,
}

/// Everything published about the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// Supervisor side state
    pub state: SupervisorState,
    /// Last state line the runner printed
    pub runner: Option<(RunnerState, Option<StartingSubstate>)>,
    /// Exit code once stopped; `None` if killed by a signal
    pub exit_code: Option<i32>,
}

/// How to launch the runner
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Executable to run, normally our own
    pub program: PathBuf,
    /// Passed as `--config`
    pub config: Option<PathBuf>,
    /// Passed as `--mode`
    pub mode: RunMode,
    /// Passed as `--rdf-file`
    pub rdf_file: Option<PathBuf>,
    /// When false, `--no-distro-restart` is passed
    pub distro_restart: bool,
}

impl SupervisorOptions {
    /// Arguments of the `run` invocation
    pub fn runner_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        args.push("run".to_string());
        args.push("--mode".to_string());
        args.push(self.mode.as_str().to_string());
        if let Some(rdf) = &self.rdf_file {
            args.push("--rdf-file".to_string());
            args.push(rdf.display().to_string());
        }
        if !self.distro_restart {
            args.push("--no-distro-restart".to_string());
        }
        args
    }
}

struct Shared {
    pid: i32,
    stop_requested: AtomicBool,
}

impl Shared {
    fn terminate(&self) {
        if let Err(e) = SystemExecutor.signal(self.pid, Signal::SIGTERM) {
            log::warn!("cannot signal runner: {:#}", e);
        }
    }
}

/// Handle on a running child
pub struct Supervisor {
    shared: Arc<Shared>,
    status: watch::Receiver<SupervisorStatus>,
    tx: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    /// Spawn the runner and start following its output
    pub fn start(opts: &SupervisorOptions) -> Result<Self> {
        let args = opts.runner_args();
        log::info!("starting runner: {} {}", opts.program.display(), args.join(" "));
        let mut child = Command::new(&opts.program)
            .args(&args)
            .stdin(Stdio::null())
            // A pipe is enough: the runner flushes after every state line
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", opts.program.display()))?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .context("Runner exited before it could be tracked")?;
        let stdout = child.stdout.take().context("Runner stdout not captured")?;

        let shared = Arc::new(Shared {
            pid,
            stop_requested: AtomicBool::new(false),
        });
        let (tx, status) = watch::channel(SupervisorStatus {
            state: SupervisorState::Starting,
            runner: None,
            exit_code: None,
        });
        tokio::spawn(follow(child, stdout, tx.clone(), shared.clone()));

        Ok(Self { shared, status, tx })
    }

    /// Latest published status
    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// Process id of the child
    pub fn pid(&self) -> i32 {
        self.shared.pid
    }

    /// Resolves once the runner is RUNNING; false if it stopped instead
    pub async fn wait_running(&mut self) -> Result<bool> {
        let status = self
            .status
            .wait_for(|s| matches!(s.state, SupervisorState::Running | SupervisorState::Stopped))
            .await
            .context("Supervisor task ended")?;
        Ok(status.state == SupervisorState::Running)
    }

    /// Resolves with the exit code once the runner process is gone
    pub async fn wait_stopped(&mut self) -> Result<Option<i32>> {
        let status = self
            .status
            .wait_for(|s| s.state == SupervisorState::Stopped)
            .await
            .context("Supervisor task ended")?;
        Ok(status.exit_code)
    }

    /// Ask the runner to stop; use [`Supervisor::wait_stopped`] for the result
    pub fn stop(&self) {
        if self.status.borrow().state == SupervisorState::Stopped {
            log::debug!("runner already stopped");
            return;
        }
        log::info!("stopping runner {}", self.shared.pid);
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.tx.send_modify(|s| s.state = SupervisorState::Stopping);
        self.shared.terminate();
    }
}

async fn follow(
    mut child: Child,
    stdout: ChildStdout,
    tx: watch::Sender<SupervisorStatus>,
    shared: Arc<Shared>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("reading runner output failed: {}", e);
                break;
            }
        };
        let Some((state, substate)) = parse_state_line(&line) else {
            log::debug!("runner: {}", line);
            continue;
        };
        log::info!("runner state: {}", line.trim());

        let stopping = shared.stop_requested.load(Ordering::SeqCst);
        tx.send_modify(|s| {
            s.runner = Some((state, substate));
            s.state = match state {
                _ if stopping => SupervisorState::Stopping,
                RunnerState::Starting => SupervisorState::Starting,
                RunnerState::Running => SupervisorState::Running,
                RunnerState::Stopping | RunnerState::Stopped => SupervisorState::Stopping,
            };
        });

        if state == RunnerState::Running && stopping {
            log::info!("runner reached RUNNING after stop request, signalling again");
            shared.terminate();
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("waiting for runner failed: {}", e);
            None
        }
    };
    log::info!("runner exited: {:?}", exit_code);
    tx.send_modify(|s| {
        s.state = SupervisorState::Stopped;
        s.exit_code = exit_code;
    });
}
