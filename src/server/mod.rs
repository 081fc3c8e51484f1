//! Display server supervision
//!
//! [`DisplayServer`] specializes process supervision for the X server: it
//! builds the launch arguments (display number, authority file, VT,
//! listener policy), tracks `Spawning -> Pending -> Running -> terminal`
//! state, and lets the owner wait for the server's ready signal with a
//! timeout. The real server raises SIGUSR1 at the daemon when it is ready
//! to accept connections; the daemon's signal relay (or the appearance of
//! the display socket) translates that into [`DisplayServer::notify_ready`].
//!
//! A server that reported `Exited` or `Died` must not be reused; the owner
//! creates a fresh instance for a retry.

use crate::config::XServerConfig;
use crate::seat::DeviceResolver;
use crate::supervisor::{ChildEvent, LaunchSpec, ProcessSupervisor, SupervisorError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Result type for display server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Display server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Underlying spawn failure
    #[error(transparent)]
    Spawn(#[from] SupervisorError),

    /// Server never signalled readiness within the timeout
    #[error("display server for {display} not ready after {waited:?}")]
    ReadyTimeout { display: String, waited: Duration },

    /// Device resolution failed
    #[error(transparent)]
    Device(#[from] crate::seat::SeatError),

    /// Operation requires a started server
    #[error("display server not started")]
    NotStarted,
}

/// Display server lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// start() not yet called
    Spawning,

    /// Child running, ready signal not yet observed
    Pending,

    /// Ready signal observed, accepting connections
    Running,

    /// Child exited with a status code
    Exited(i32),

    /// Child was killed by a signal
    Died(i32),
}

/// One X server child bound to one display
pub struct DisplayServer {
    display_name: String,
    display_number: u32,
    vt: u32,
    config: XServerConfig,
    authority_file: PathBuf,
    log_dir: PathBuf,
    supervisor: ProcessSupervisor,
    state: ServerState,
    ready_tx: std::sync::Arc<watch::Sender<bool>>,
    ready_rx: watch::Receiver<bool>,
    device: Option<PathBuf>,
}

impl DisplayServer {
    pub fn new(
        display_number: u32,
        vt: u32,
        config: XServerConfig,
        authority_file: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        let display_name = format!(":{display_number}");
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            supervisor: ProcessSupervisor::new(format!("xserver{display_name}")),
            display_name,
            display_number,
            vt,
            config,
            authority_file: authority_file.into(),
            log_dir: log_dir.into(),
            state: ServerState::Spawning,
            ready_tx: std::sync::Arc::new(ready_tx),
            ready_rx,
            device: None,
        }
    }

    /// Display name in `:N` form
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Launch description for the X server child
    fn launch_spec(&self) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.config.command)
            .arg(&self.display_name)
            .arg("-auth")
            .arg(self.authority_file.display().to_string());
        if self.config.disallow_tcp {
            spec = spec.arg("-nolisten").arg("tcp");
        }
        spec = spec.arg(format!("vt{}", self.vt));
        spec = spec.args(self.config.extra_args.iter().cloned());
        spec.log_file = Some(self.log_dir.join(format!("{}.log", sanitize(&self.display_name))));
        spec
    }

    /// Spawn the X server child
    pub fn start(&mut self) -> Result<u32> {
        let spec = self.launch_spec();
        info!(display = %self.display_name, vt = self.vt, "starting display server");
        let pid = self.supervisor.start(&spec)?;
        self.state = ServerState::Pending;
        Ok(pid)
    }

    /// Terminal child events; consumable once by the owner
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChildEvent>> {
        self.supervisor.take_events()
    }

    /// Record the terminal event observed by the owner
    pub fn mark_terminated(&mut self, event: ChildEvent) {
        self.state = match event {
            ChildEvent::Exited(code) => ServerState::Exited(code),
            ChildEvent::Died(sig) => ServerState::Died(sig),
        };
    }

    /// Deliver the server's ready signal
    pub fn notify_ready(&mut self) {
        if self.state == ServerState::Pending {
            debug!(display = %self.display_name, "display server ready");
            self.state = ServerState::Running;
        }
        let _ = self.ready_tx.send(true);
    }

    /// Handle for delivering the ready signal from outside the owner
    ///
    /// Used by the daemon's signal relay; sending `true` has the same
    /// effect on a pending [`wait_ready`](Self::wait_ready) as
    /// [`notify_ready`](Self::notify_ready).
    pub fn ready_notifier(&self) -> ReadyNotifier {
        ReadyNotifier(self.ready_tx.clone())
    }

    /// Wait for readiness: the ready signal or the display socket appearing
    ///
    /// On timeout the caller decides between retry and abort.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        if self.state == ServerState::Running {
            return Ok(());
        }
        if self.state == ServerState::Spawning {
            return Err(ServerError::NotStarted);
        }

        let socket = display_socket_path(self.display_number);
        let mut ready_rx = self.ready_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if *ready_rx.borrow_and_update() || socket.exists() {
                self.state = ServerState::Running;
                return Ok(());
            }
            let tick = tokio::time::sleep(Duration::from_millis(100));
            tokio::select! {
                changed = ready_rx.changed() => {
                    if changed.is_err() {
                        // watch sender lives as long as self; unreachable in practice
                        break;
                    }
                }
                _ = tick => {}
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        if *self.ready_rx.borrow() || socket.exists() {
            self.state = ServerState::Running;
            return Ok(());
        }
        Err(ServerError::ReadyTimeout {
            display: self.display_name.clone(),
            waited: timeout,
        })
    }

    /// Device backing this display, resolved lazily and cached
    pub async fn display_device(&mut self, resolver: &dyn DeviceResolver) -> Result<PathBuf> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }
        let device = resolver.device_for_display(&self.display_name).await?;
        debug!(display = %self.display_name, device = %device.display(), "resolved display device");
        self.device = Some(device.clone());
        Ok(device)
    }

    /// Stop the X server child; idempotent
    pub async fn stop(&mut self) {
        self.supervisor.stop().await;
    }
}

/// Cloneable handle that marks a display server ready
#[derive(Clone)]
pub struct ReadyNotifier(std::sync::Arc<watch::Sender<bool>>);

impl ReadyNotifier {
    pub fn notify(&self) {
        let _ = self.0.send(true);
    }
}

fn display_socket_path(display_number: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/.X11-unix/X{display_number}"))
}

fn sanitize(display_name: &str) -> String {
    display_name.replace(':', "display-")
}
