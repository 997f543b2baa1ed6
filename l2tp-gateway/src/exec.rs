// External command execution

//! Every external program (`ip`, `iptables-restore`, `start-stop-daemon`,
//! `arping`, ...) and every signal sent to another process goes through the
//! [`Executor`] trait, so the orchestration logic can run against a
//! recording mock in tests.

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// iproute2 front end
pub const IP: &str = "/sbin/ip";
/// Kernel parameter tool
pub const SYSCTL: &str = "/sbin/sysctl";

/// Program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program path
    pub program: String,
    /// Arguments, not shell quoted
    pub args: Vec<String>,
    /// Fed to the child's stdin, then closed
    pub stdin: Option<String>,
}

impl CommandSpec {
    /// Invocation of `program` without arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` to stdin
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Space separated rendering for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Exited with code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Successful result with the given output
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed result with the given code and error text
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Side effects on the host: commands, signals, process probes, DNS
pub trait Executor: Send + Sync {
    /// Run to completion; `Err` only when the program could not be spawned
    fn run(&self, cmd: CommandSpec) -> BoxFuture<'_, Result<CommandOutput>>;

    fn signal(&self, pid: i32, signal: Signal) -> Result<()>;

    /// Signal-0 probe
    fn is_alive(&self, pid: i32) -> bool;

    /// IPv4 addresses of `host`, empty when resolution fails
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Vec<Ipv4Addr>>;
}

/// Run a command and fail unless it exits with status 0
pub async fn run_checked(exec: &dyn Executor, cmd: CommandSpec) -> Result<CommandOutput> {
    let line = cmd.command_line();
    let output = exec
        .run(cmd)
        .await
        .with_context(|| format!("Failed to execute {}", line))?;
    if !output.success() {
        anyhow::bail!(
            "{} failed (exit {:?}): {}",
            line,
            output.code,
            output.stderr.trim()
        );
    }
    Ok(output)
}

/// Run a cleanup command, logging failures instead of returning them
pub async fn run_logged(exec: &dyn Executor, cmd: CommandSpec, silent: bool) -> bool {
    let line = cmd.command_line();
    match run_checked(exec, cmd).await {
        Ok(_) => true,
        Err(e) if silent => {
            log::debug!("ignored failure: {:#}", e);
            false
        }
        Err(e) => {
            log::warn!("command failed: {}: {:#}", line, e);
            false
        }
    }
}

/// Executor backed by the real host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn run(&self, cmd: CommandSpec) -> BoxFuture<'_, Result<CommandOutput>> {
        Box::pin(async move {
            log::debug!("exec: {}", cmd.command_line());
            let mut command = Command::new(&cmd.program);
            command
                .args(&cmd.args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let output = match cmd.stdin {
                Some(input) => {
                    command.stdin(Stdio::piped());
                    let mut child = command
                        .spawn()
                        .with_context(|| format!("Failed to spawn {}", cmd.program))?;
                    if let Some(mut stdin) = child.stdin.take() {
                        stdin
                            .write_all(input.as_bytes())
                            .await
                            .context("Failed to write child stdin")?;
                    }
                    child
                        .wait_with_output()
                        .await
                        .context("Failed to wait for child")?
                }
                None => command
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .with_context(|| format!("Failed to spawn {}", cmd.program))?,
            };

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        anyhow::ensure!(pid > 0, "refusing to signal pid {}", pid);
        kill(Pid::from_raw(pid), signal)
            .with_context(|| format!("Failed to send {} to {}", signal, pid))
    }

    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
    }

    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Vec<Ipv4Addr>> {
        Box::pin(async move {
            match tokio::net::lookup_host((host, 0)).await {
                Ok(addrs) => addrs
                    .filter_map(|a| match a.ip() {
                        IpAddr::V4(v4) => Some(v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect(),
                Err(e) => {
                    log::warn!("failed to resolve {}: {}", host, e);
                    Vec::new()
                }
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockExecutor, ProcBehavior};
    use super::*;

    #[test]
    fn test_command_line_rendering() {
        let cmd = CommandSpec::new("ip")
            .args(["link", "set"])
            .arg("eth0")
            .arg("up");
        assert_eq!(cmd.command_line(), "ip link set eth0 up");
        assert!(cmd.stdin.is_none());
    }

    #[tokio::test]
    async fn test_run_checked_reports_stderr() {
        let exec = MockExecutor::new();
        exec.respond("ip route del", CommandOutput::failed(2, "No such process"));

        let err = run_checked(exec.as_ref(), CommandSpec::new("ip").args(["route", "del", "x"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No such process"));

        assert!(run_checked(exec.as_ref(), CommandSpec::new("ip").arg("link"))
            .await
            .is_ok());
        assert!(!run_logged(exec.as_ref(), CommandSpec::new("ip").args(["route", "del"]), true).await);
    }

    #[test]
    fn test_mock_process_behaviors() {
        let exec = MockExecutor::new();
        exec.spawn(10, ProcBehavior::Normal);
        exec.spawn(11, ProcBehavior::IgnoresTerm);
        exec.spawn(12, ProcBehavior::Immortal);

        for pid in [10, 11, 12] {
            exec.signal(pid, Signal::SIGTERM).unwrap();
        }
        assert!(!exec.is_alive(10));
        assert!(exec.is_alive(11));
        assert!(exec.is_alive(12));

        exec.signal(11, Signal::SIGKILL).unwrap();
        exec.signal(12, Signal::SIGKILL).unwrap();
        assert!(!exec.is_alive(11));
        assert!(exec.is_alive(12));
        assert!(exec.signal(10, Signal::SIGKILL).is_err());
    }

    #[test]
    fn test_system_executor_probes_self() {
        let exec = SystemExecutor;
        assert!(exec.is_alive(std::process::id() as i32));
        assert!(!exec.is_alive(0));
        assert!(exec.signal(-1, Signal::SIGTERM).is_err());
    }
}
