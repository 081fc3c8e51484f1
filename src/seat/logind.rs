//! systemd-logind backed seat manager
//!
//! Implements [`SeatManager`](super::SeatManager) over the
//! `org.freedesktop.login1` D-Bus interfaces.

use super::{Result, SeatError, SeatManager};
use async_trait::async_trait;
use tracing::{debug, info};
use zbus::{proxy, Connection};

/// systemd-logind Manager interface
#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait LoginManager {
    /// List sessions: (session_id, uid, user_name, seat_id, object_path)
    #[zbus(name = "ListSessions")]
    fn list_sessions(
        &self,
    ) -> zbus::Result<Vec<(String, u32, String, String, zbus::zvariant::OwnedObjectPath)>>;

    /// Get the object path for a session id
    #[zbus(name = "GetSession")]
    fn get_session(&self, session_id: &str) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;

    /// Activate a session on a specific seat
    #[zbus(name = "ActivateSessionOnSeat")]
    fn activate_session_on_seat(&self, session_id: &str, seat_id: &str) -> zbus::Result<()>;

    /// Unlock a session
    #[zbus(name = "UnlockSession")]
    fn unlock_session(&self, session_id: &str) -> zbus::Result<()>;
}

/// systemd-logind seat manager
pub struct LogindSeatManager {
    manager_proxy: LoginManagerProxy<'static>,
}

impl LogindSeatManager {
    /// Connect to logind on the system bus
    pub async fn new() -> Result<Self> {
        info!("Connecting to systemd-logind via D-Bus");

        let connection = Connection::system().await?;
        let manager_proxy = LoginManagerProxy::new(&connection).await?;

        debug!("Connected to systemd-logind");
        Ok(Self { manager_proxy })
    }
}

#[async_trait]
impl SeatManager for LogindSeatManager {
    async fn sessions_for_user(&self, uid: u32) -> Result<Vec<String>> {
        let sessions = self.manager_proxy.list_sessions().await?;
        let ids = sessions
            .into_iter()
            .filter(|(_, session_uid, _, _, _)| *session_uid == uid)
            .map(|(id, _, _, _, _)| id)
            .collect::<Vec<_>>();
        debug!(uid, count = ids.len(), "listed sessions for user");
        Ok(ids)
    }

    async fn session_seat(&self, session_id: &str) -> Result<String> {
        let sessions = self.manager_proxy.list_sessions().await?;
        sessions
            .into_iter()
            .find(|(id, _, _, _, _)| id == session_id)
            .map(|(_, _, _, seat, _)| seat)
            .ok_or_else(|| SeatError::NoSuchSession(session_id.to_string()))
    }

    async fn activate_session(&self, seat_id: &str, session_id: &str) -> Result<()> {
        info!(seat = seat_id, session = session_id, "activating session");
        self.manager_proxy
            .activate_session_on_seat(session_id, seat_id)
            .await?;
        Ok(())
    }

    async fn unlock_session(&self, session_id: &str) -> Result<()> {
        info!(session = session_id, "unlocking session");
        self.manager_proxy.unlock_session(session_id).await?;
        Ok(())
    }
}
