//! Child process supervision
//!
//! [`ProcessSupervisor`] owns the lifecycle of one spawned child: it builds
//! the process environment (working directory, credential drop, redirected
//! log file), watches for termination, and reports exactly one
//! [`ChildEvent`] to at most one subscriber. Termination requests send
//! SIGTERM, wait a bounded interval, then escalate to SIGKILL.
//!
//! Retry policy does not live here: a spawn failure is fatal to the caller
//! and owners decide whether to try again.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Supervisor error types
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Child process could not be spawned
    #[error("failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    /// Child log file could not be opened
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// start() called while a child is already running
    #[error("child already running (pid {0})")]
    AlreadyRunning(u32),
}

/// Terminal child event, emitted exactly once per started child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    /// Child exited normally with a status code
    Exited(i32),

    /// Child was killed by a signal
    Died(i32),
}

/// Credentials to drop to before exec
#[derive(Debug, Clone, Copy)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

/// Description of a child process to launch
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Binary to execute
    pub command: PathBuf,

    /// Arguments, not including argv[0]
    pub args: Vec<String>,

    /// Environment; when `clear_env` is set this is the whole environment
    pub env: Vec<(String, String)>,

    /// Start from an empty environment instead of inheriting
    pub clear_env: bool,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// File receiving the child's stdout and stderr
    pub log_file: Option<PathBuf>,

    /// Drop to these credentials before exec (requires running as root)
    pub run_as: Option<RunAs>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            clear_env: false,
            work_dir: None,
            log_file: None,
            run_as: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Supervises a single child process
///
/// One instance supervises at most one child at a time. The event receiver
/// can be taken once; subsequent calls return `None`.
pub struct ProcessSupervisor {
    name: String,
    pid: Option<u32>,
    events: Option<mpsc::UnboundedReceiver<ChildEvent>>,
    terminated: Option<watch::Receiver<bool>>,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    /// Default interval between SIGTERM and SIGKILL
    pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: None,
            events: None,
            terminated: None,
            stop_grace: Self::DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// PID of the running child, if any
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the supervised child is still running
    pub fn is_running(&self) -> bool {
        match &self.terminated {
            Some(rx) => !*rx.borrow(),
            None => false,
        }
    }

    /// Take the event receiver; yields exactly one event per started child
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChildEvent>> {
        self.events.take()
    }

    /// Spawn the child described by `spec`
    ///
    /// The watcher task owns the `Child` handle and reports the terminal
    /// event on the supervisor's event channel.
    pub fn start(&mut self, spec: &LaunchSpec) -> Result<u32> {
        if self.is_running() {
            return Err(SupervisorError::AlreadyRunning(self.pid.unwrap_or(0)));
        }

        let mut command = Command::new(&spec.command);
        command.args(&spec.args);

        if spec.clear_env {
            command.env_clear();
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(dir) = &spec.work_dir {
            command.current_dir(dir);
        }
        if let Some(run_as) = &spec.run_as {
            command.uid(run_as.uid).gid(run_as.gid);
        }

        match &spec.log_file {
            Some(path) => {
                let out = std::fs::File::create(path).map_err(|source| {
                    SupervisorError::LogFile {
                        path: path.clone(),
                        source,
                    }
                })?;
                let err = out.try_clone().map_err(|source| SupervisorError::LogFile {
                    path: path.clone(),
                    source,
                })?;
                command.stdout(Stdio::from(out)).stderr(Stdio::from(err));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        command.stdin(Stdio::null());
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SupervisorError::SpawnFailed {
            command: spec.command.display().to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        info!(name = %self.name, pid, command = %spec.command.display(), "child started");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (term_tx, term_rx) = watch::channel(false);
        let name = self.name.clone();

        tokio::spawn(async move {
            let event = match child.wait().await {
                Ok(status) => match status.code() {
                    Some(code) => {
                        debug!(name = %name, pid, code, "child exited");
                        ChildEvent::Exited(code)
                    }
                    None => {
                        let sig = status.signal().unwrap_or(0);
                        debug!(name = %name, pid, signal = sig, "child died on signal");
                        ChildEvent::Died(sig)
                    }
                },
                Err(e) => {
                    warn!(name = %name, pid, error = %e, "wait on child failed");
                    ChildEvent::Exited(-1)
                }
            };
            let _ = term_tx.send(true);
            let _ = event_tx.send(event);
        });

        self.pid = Some(pid);
        self.events = Some(event_rx);
        self.terminated = Some(term_rx);
        Ok(pid)
    }

    /// Request termination and wait (bounded) for the child to go away
    ///
    /// Idempotent: stopping an already-stopped supervisor is a no-op.
    pub async fn stop(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        if !self.is_running() {
            self.pid = None;
            return;
        }

        info!(name = %self.name, pid, "stopping child");
        self.signal(Signal::SIGTERM);

        if !self.wait_terminated(self.stop_grace).await {
            warn!(name = %self.name, pid, "child ignored SIGTERM, sending SIGKILL");
            self.signal(Signal::SIGKILL);
            self.wait_terminated(self.stop_grace).await;
        }
        self.pid = None;
    }

    /// Send a signal to the running child
    pub fn signal(&self, sig: Signal) {
        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
                debug!(name = %self.name, pid, signal = %sig, error = %e, "kill failed");
            }
        }
    }

    async fn wait_terminated(&mut self, timeout: Duration) -> bool {
        let Some(rx) = self.terminated.as_mut() else {
            return true;
        };
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}
