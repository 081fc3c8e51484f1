//! Display registry
//!
//! [`DisplayRegistry`] is the daemon's book of displays: it assigns
//! identity (wrapping serial plus a uuid id), walks each display through
//! `Unmanaged -> Prepared -> Managed -> {Finished, Failed}` and owns the
//! stop policy. A display whose slave goes away without being asked is
//! re-eligible for management only if it stayed up past the flap window;
//! a flapping display is marked `Failed` and the registry never restarts
//! it on its own.
//!
//! Each managed display gets a watcher task that holds the slave handle,
//! waits for either a stop request or the slave's own exit, and records
//! the terminal status back into the registry.

use crate::authority::AuthorityError;
use crate::config::{Config, SettingsStore};
use crate::seat::{DeviceResolver, SeatManager};
use crate::session::pipeline::UidResolver;
use crate::slave::{SlaveEvent, SlaveKind, SlaveParams, SlaveSupervisor};
use crate::verify::VerifierFactory;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub mod display;

pub use display::{DisplayInfo, DisplayLocation, DisplayStatus, MIN_MANAGED_LIFETIME};

use display::{stop_outcome, Display};

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry error types
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Referenced display is not registered
    #[error("no such display: {0}")]
    NoSuchDisplay(String),

    /// Display is not in the right status for the operation
    #[error("display {id} is {status:?}, expected {expected:?}")]
    InvalidStatus {
        id: String,
        status: DisplayStatus,
        expected: DisplayStatus,
    },

    /// Authority file handling failed
    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

/// Shared collaborators a display needs at manage time
#[derive(Clone)]
pub struct ManageDeps {
    pub config: Arc<Config>,
    pub settings: Arc<dyn SettingsStore>,
    pub verifier_factory: Arc<dyn VerifierFactory>,
    pub seat_manager: Arc<dyn SeatManager>,
    pub device_resolver: Arc<dyn DeviceResolver>,
    pub uid_resolver: UidResolver,
    /// Virtual terminal for the display server
    pub vt: u32,
}

/// The daemon's book of displays
pub struct DisplayRegistry {
    serial: AtomicU32,
    displays: Mutex<HashMap<String, Display>>,
}

impl Default for DisplayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self {
            serial: AtomicU32::new(0),
            displays: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new display; serials wrap around on overflow
    pub fn create_display(
        &self,
        number: u32,
        seat_id: &str,
        location: DisplayLocation,
    ) -> DisplayInfo {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let entry = Display::new(serial, number, seat_id, location);
        let snapshot = entry.info();
        info!(id = %snapshot.id, name = %snapshot.name, seat = %snapshot.seat_id, serial,
              "display registered");
        self.displays.lock().insert(snapshot.id.clone(), entry);
        snapshot
    }

    /// Snapshot of one display
    pub fn display(&self, id: &str) -> Option<DisplayInfo> {
        self.displays.lock().get(id).map(Display::info)
    }

    /// Snapshots of every registered display, ordered by serial
    pub fn list_displays(&self) -> Vec<DisplayInfo> {
        let mut infos: Vec<_> = self.displays.lock().values().map(Display::info).collect();
        infos.sort_by_key(|info| info.serial);
        infos
    }

    /// Create the display's authority file; requires `Unmanaged`
    pub fn prepare_display(&self, id: &str, auth_dir: &Path) -> Result<()> {
        let mut displays = self.displays.lock();
        let entry = displays
            .get_mut(id)
            .ok_or_else(|| RegistryError::NoSuchDisplay(id.to_string()))?;
        if entry.status != DisplayStatus::Unmanaged {
            return Err(RegistryError::InvalidStatus {
                id: id.to_string(),
                status: entry.status,
                expected: DisplayStatus::Unmanaged,
            });
        }
        entry.prepare(auth_dir)?;
        info!(id = %entry.id, name = %entry.name, "display prepared");
        Ok(())
    }

    /// Spawn and watch a slave for a prepared display
    pub fn manage_display(self: &Arc<Self>, id: &str, kind: SlaveKind, deps: ManageDeps) -> Result<()> {
        let (stop_tx, stop_rx) = oneshot::channel();

        let handle = {
            let mut displays = self.displays.lock();
            let display = displays
                .get_mut(id)
                .ok_or_else(|| RegistryError::NoSuchDisplay(id.to_string()))?;
            if display.status != DisplayStatus::Prepared {
                return Err(RegistryError::InvalidStatus {
                    id: id.to_string(),
                    status: display.status,
                    expected: DisplayStatus::Prepared,
                });
            }
            let authority = display
                .authority
                .clone()
                .ok_or_else(|| RegistryError::NoSuchDisplay(id.to_string()))?;

            let handle = SlaveSupervisor::spawn(SlaveParams {
                kind,
                display_id: display.id.clone(),
                display_name: display.name.clone(),
                display_number: display.number,
                seat_id: display.seat_id.clone(),
                is_local: display.is_local(),
                vt: deps.vt,
                config: deps.config,
                settings: deps.settings,
                authority,
                verifier_factory: deps.verifier_factory,
                seat_manager: deps.seat_manager,
                device_resolver: deps.device_resolver,
                uid_resolver: deps.uid_resolver,
            });

            display.ready = Some(handle.ready_signal());
            display.stop_tx = Some(stop_tx);
            display.status = DisplayStatus::Managed;
            display.managed_at = Some(tokio::time::Instant::now());
            handle
        };

        let registry = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            registry.watch_slave(id, handle, stop_rx).await;
        });
        Ok(())
    }

    /// Relay the display server's ready signal to a managed display
    pub fn notify_server_ready(&self, id: &str) {
        if let Some(display) = self.displays.lock().get(id) {
            if let Some(ready) = &display.ready {
                ready.notify();
            }
        }
    }

    /// Request an orderly shutdown of one display
    ///
    /// Managed displays finish asynchronously once their slave reports
    /// stopped; everything else finishes immediately.
    pub fn finish_display(&self, id: &str) -> Result<()> {
        let mut displays = self.displays.lock();
        let entry = displays
            .get_mut(id)
            .ok_or_else(|| RegistryError::NoSuchDisplay(id.to_string()))?;

        match entry.status {
            DisplayStatus::Managed => {
                if let Some(stop_tx) = entry.stop_tx.take() {
                    let _ = stop_tx.send(());
                }
            }
            DisplayStatus::Finished | DisplayStatus::Failed => {}
            _ => {
                entry.close_authority();
                entry.status = DisplayStatus::Finished;
                info!(id = %entry.id, "display finished");
            }
        }
        Ok(())
    }

    /// Finish every display; used on daemon shutdown
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.displays.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.finish_display(&id);
        }
    }

    async fn watch_slave(
        self: Arc<Self>,
        id: String,
        mut handle: crate::slave::SlaveHandle,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let requested = loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    handle.stop().await;
                    break true;
                }
                event = handle.events.recv() => match event {
                    Some(SlaveEvent::Started) => continue,
                    Some(SlaveEvent::Stopped) | None => break false,
                },
            }
        };
        self.record_stop(&id, requested);
    }

    /// Record a slave stop and apply the flap guard
    fn record_stop(&self, id: &str, requested: bool) {
        let mut displays = self.displays.lock();
        let Some(entry) = displays.get_mut(id) else {
            return;
        };

        let managed_for = entry
            .managed_at
            .take()
            .map(|at| at.elapsed())
            .unwrap_or_default();
        entry.ready = None;
        entry.stop_tx = None;
        entry.close_authority();

        entry.status = stop_outcome(managed_for, requested);
        match entry.status {
            DisplayStatus::Finished => info!(id = %entry.id, "display finished"),
            DisplayStatus::Failed => {
                warn!(id = %entry.id, ?managed_for, "display flapped, marking failed")
            }
            _ => info!(id = %entry.id, ?managed_for, "display unmanaged"),
        }
    }
}
