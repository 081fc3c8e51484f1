//! Display entity
//!
//! A [`Display`] is the registry's record of one display: identity (id,
//! serial, `:N` name), placement (seat, local or remote) and lifecycle
//! status. The registry owns all mutation; the slave only ever sees the
//! pieces handed to it at manage time.

use crate::authority::{AuthorityError, AuthoritySession};
use crate::slave::ReadySignal;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Managed lifetimes shorter than this mark the display as failed
/// instead of eligible for another management cycle.
pub const MIN_MANAGED_LIFETIME: Duration = Duration::from_secs(3);

/// Display lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    /// Created, nothing running
    Unmanaged,

    /// Authority file exists, ready for a slave
    Prepared,

    /// Slave running
    Managed,

    /// Shut down on request; terminal
    Finished,

    /// Slave flapped or died; terminal, never restarted automatically
    Failed,
}

/// Where a display's server lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayLocation {
    /// Server spawned on this machine
    Local,

    /// Server on a remote host (XDMCP)
    Remote { host: String },
}

/// One display record
pub struct Display {
    pub(crate) id: String,
    pub(crate) serial: u32,
    pub(crate) name: String,
    pub(crate) number: u32,
    pub(crate) seat_id: String,
    pub(crate) location: DisplayLocation,
    pub(crate) status: DisplayStatus,
    pub(crate) authority: Option<Arc<Mutex<AuthoritySession>>>,
    pub(crate) ready: Option<ReadySignal>,
    pub(crate) stop_tx: Option<oneshot::Sender<()>>,
    pub(crate) managed_at: Option<tokio::time::Instant>,
}

impl Display {
    pub(crate) fn new(
        serial: u32,
        number: u32,
        seat_id: &str,
        location: DisplayLocation,
    ) -> Self {
        Self {
            id: format!("display-{}", Uuid::new_v4()),
            serial,
            name: format!(":{number}"),
            number,
            seat_id: seat_id.to_string(),
            location,
            status: DisplayStatus::Unmanaged,
            authority: None,
            ready: None,
            stop_tx: None,
            managed_at: None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.location, DisplayLocation::Local)
    }

    /// Create the display-level authority file and mint the cookie
    pub(crate) fn prepare(
        &mut self,
        auth_dir: &Path,
    ) -> std::result::Result<Arc<Mutex<AuthoritySession>>, AuthorityError> {
        let mut session = AuthoritySession::create(auth_dir, &self.id)?;
        session.add_display(self.number)?;
        let session = Arc::new(Mutex::new(session));
        self.authority = Some(session.clone());
        self.status = DisplayStatus::Prepared;
        Ok(session)
    }

    /// Release the authority file on teardown
    pub(crate) fn close_authority(&mut self) {
        if let Some(authority) = self.authority.take() {
            authority.lock().close();
        }
    }

    /// Snapshot for callers outside the registry
    pub(crate) fn info(&self) -> DisplayInfo {
        DisplayInfo {
            id: self.id.clone(),
            serial: self.serial,
            name: self.name.clone(),
            number: self.number,
            seat_id: self.seat_id.clone(),
            location: self.location.clone(),
            status: self.status,
        }
    }
}

/// Immutable view of a display record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub id: String,
    pub serial: u32,
    pub name: String,
    pub number: u32,
    pub seat_id: String,
    pub location: DisplayLocation,
    pub status: DisplayStatus,
}

/// Terminal status after a slave stops
///
/// A requested stop always finishes the display. An unrequested stop is
/// judged by how long the display was managed: anything shorter than
/// [`MIN_MANAGED_LIFETIME`] is a flap and fails the display so it is not
/// immediately respawned into the same crash.
pub(crate) fn stop_outcome(managed_for: Duration, requested: bool) -> DisplayStatus {
    if requested {
        DisplayStatus::Finished
    } else if managed_for < MIN_MANAGED_LIFETIME {
        DisplayStatus::Failed
    } else {
        DisplayStatus::Unmanaged
    }
}
