//! Seat and session management collaborators
//!
//! The orchestrator core never talks to a transport directly; it consumes the
//! [`SeatManager`] and [`DeviceResolver`] traits. Production wires in the
//! logind-backed implementation from [`logind`]; tests substitute in-memory
//! fakes.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

pub mod logind;

pub use logind::LogindSeatManager;

/// Result type for seat operations
pub type Result<T> = std::result::Result<T, SeatError>;

/// Seat manager error types
#[derive(Error, Debug)]
pub enum SeatError {
    /// Bus-level failure talking to the session manager
    #[error("session manager call failed: {0}")]
    Bus(#[from] zbus::Error),

    /// Referenced session does not exist
    #[error("no such session: {0}")]
    NoSuchSession(String),

    /// Device resolution helper failed
    #[error("device helper failed for {display}: {reason}")]
    DeviceHelper { display: String, reason: String },
}

/// Seat/session manager contract (logind or ConsoleKit equivalent)
#[async_trait]
pub trait SeatManager: Send + Sync {
    /// Session ids belonging to `uid`, most recent first
    async fn sessions_for_user(&self, uid: u32) -> Result<Vec<String>>;

    /// Seat a session is attached to
    async fn session_seat(&self, session_id: &str) -> Result<String>;

    /// Make the session the foreground session on its seat
    async fn activate_session(&self, seat_id: &str, session_id: &str) -> Result<()>;

    /// Ask the session's lock screen to dismiss itself
    async fn unlock_session(&self, session_id: &str) -> Result<()>;
}

/// Resolves the kernel device backing a display
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn device_for_display(&self, display_name: &str) -> Result<PathBuf>;
}

/// [`DeviceResolver`] that shells out to an external helper
///
/// The helper receives the display name as its only argument and prints the
/// device path on stdout.
pub struct HelperDeviceResolver {
    helper: PathBuf,
}

impl HelperDeviceResolver {
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
        }
    }
}

#[async_trait]
impl DeviceResolver for HelperDeviceResolver {
    async fn device_for_display(&self, display_name: &str) -> Result<PathBuf> {
        debug!(helper = %self.helper.display(), display = display_name, "resolving display device");

        let output = tokio::process::Command::new(&self.helper)
            .arg(display_name)
            .output()
            .await
            .map_err(|e| SeatError::DeviceHelper {
                display: display_name.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SeatError::DeviceHelper {
                display: display_name.to_string(),
                reason: format!("helper exited with {}", output.status),
            });
        }

        let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if device.is_empty() {
            return Err(SeatError::DeviceHelper {
                display: display_name.to_string(),
                reason: "helper produced no output".to_string(),
            });
        }
        Ok(PathBuf::from(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn helper_resolver_parses_stdout() {
        let resolver = HelperDeviceResolver::new("/bin/echo");
        let device = resolver.device_for_display(":0").await.unwrap();
        // /bin/echo prints its argument back
        assert_eq!(device, PathBuf::from(":0"));
    }

    #[tokio::test]
    async fn helper_resolver_rejects_missing_helper() {
        let resolver = HelperDeviceResolver::new("/nonexistent/helper");
        assert!(matches!(
            resolver.device_for_display(":0").await,
            Err(SeatError::DeviceHelper { .. })
        ));
    }

    #[tokio::test]
    async fn helper_resolver_rejects_empty_output() {
        let resolver = HelperDeviceResolver::new("/bin/true");
        let err = resolver.device_for_display(":0").await.unwrap_err();
        assert!(err.to_string().contains("no output"));
    }
}
