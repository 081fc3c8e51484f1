//! Login session pipeline
//!
//! One [`SessionPipeline`] per login attempt, plus the auto/timed-login
//! policy helpers the slave consults when a conversation starts.

pub mod pipeline;

pub use pipeline::{
    LoginRequest, PipelineAction, PipelineStage, SessionPipeline, PipelineParams, UidResolver,
};

use crate::config::SettingsStore;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timed-login countdown when the configured delay is unusable
pub const DEFAULT_TIMED_DELAY: i64 = 10;

/// How a login attempt begins, derived from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginPolicy {
    /// Greeter collects the username interactively
    Interactive,

    /// Log the user in immediately without a greeter interaction
    Auto { username: String },

    /// Offer a countdown; the greeter begins the login when it expires
    Timed { username: String, delay: i64 },
}

/// Decide auto vs timed vs interactive login for a display
///
/// Auto login wins over timed login whenever both are enabled and the auto
/// username is non-empty. Timed login requires a usable username; a
/// configured delay <= 0 is coerced to [`DEFAULT_TIMED_DELAY`], never
/// treated as immediate or disabled.
pub async fn resolve_login_policy(settings: &dyn SettingsStore, display_name: &str) -> LoginPolicy {
    let (auto_enabled, _) = settings.get_bool("auto_login.enabled");
    if auto_enabled {
        let (configured, _) = settings.get_string("auto_login.user");
        if let Some(username) = effective_username(&configured, display_name).await {
            debug!(username, "auto login selected");
            return LoginPolicy::Auto { username };
        }
    }

    let (timed_enabled, _) = settings.get_bool("timed_login.enabled");
    if timed_enabled {
        let (configured, _) = settings.get_string("timed_login.user");
        if let Some(username) = effective_username(&configured, display_name).await {
            let (delay, ok) = settings.get_int("timed_login.delay");
            let delay = if !ok || delay <= 0 {
                DEFAULT_TIMED_DELAY
            } else {
                delay
            };
            debug!(username, delay, "timed login selected");
            return LoginPolicy::Timed { username, delay };
        }
    }

    LoginPolicy::Interactive
}

/// Resolve a configured auto/timed login name
///
/// A value ending in `|` names a helper command whose stdout becomes the
/// effective username; a helper that errors or prints nothing is the same
/// as no configured name.
async fn effective_username(configured: &str, display_name: &str) -> Option<String> {
    let configured = configured.trim();
    if configured.is_empty() {
        return None;
    }

    let Some(command) = configured.strip_suffix('|') else {
        return Some(configured.to_string());
    };

    debug!(command, "running helper to acquire auto/timed username");
    let output = tokio::time::timeout(
        Duration::from_secs(10),
        tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .env("DISPLAY", display_name)
            .output(),
    )
    .await;

    let output = match output {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(output)) => {
            warn!(command, status = %output.status, "username helper failed");
            return None;
        }
        Ok(Err(e)) => {
            warn!(command, error = %e, "username helper could not run");
            return None;
        }
        Err(_) => {
            warn!(command, "username helper timed out");
            return None;
        }
    };

    let username = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if username.is_empty() {
        warn!(command, "username helper produced no output");
        None
    } else {
        Some(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn settings(auto: (bool, &str), timed: (bool, &str, i64)) -> impl SettingsStore {
        let mut config = Config::default();
        config.auto_login.enabled = auto.0;
        config.auto_login.user = auto.1.to_string();
        config.timed_login.enabled = timed.0;
        config.timed_login.user = timed.1.to_string();
        config.timed_login.delay = timed.2;
        config.settings()
    }

    #[tokio::test]
    async fn auto_login_beats_timed_login() {
        let settings = settings((true, "alice"), (true, "guest", 30));
        let policy = resolve_login_policy(&settings, ":0").await;
        assert_eq!(
            policy,
            LoginPolicy::Auto {
                username: "alice".to_string()
            }
        );
    }

    #[tokio::test]
    async fn auto_login_with_empty_user_falls_through_to_timed() {
        let settings = settings((true, ""), (true, "guest", 30));
        let policy = resolve_login_policy(&settings, ":0").await;
        assert_eq!(
            policy,
            LoginPolicy::Timed {
                username: "guest".to_string(),
                delay: 30
            }
        );
    }

    #[tokio::test]
    async fn zero_delay_normalizes_to_default() {
        let settings = settings((false, ""), (true, "guest", 0));
        match resolve_login_policy(&settings, ":0").await {
            LoginPolicy::Timed { delay, .. } => assert_eq!(delay, DEFAULT_TIMED_DELAY),
            other => panic!("expected timed login, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn negative_delay_normalizes_to_default() {
        let settings = settings((false, ""), (true, "guest", -5));
        match resolve_login_policy(&settings, ":0").await {
            LoginPolicy::Timed { delay, .. } => assert_eq!(delay, DEFAULT_TIMED_DELAY),
            other => panic!("expected timed login, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn positive_delay_is_kept() {
        let settings = settings((false, ""), (true, "guest", 45));
        match resolve_login_policy(&settings, ":0").await {
            LoginPolicy::Timed { delay, .. } => assert_eq!(delay, 45),
            other => panic!("expected timed login, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_configured_means_interactive() {
        let settings = settings((false, ""), (false, "", 0));
        assert_eq!(
            resolve_login_policy(&settings, ":0").await,
            LoginPolicy::Interactive
        );
    }

    #[tokio::test]
    async fn enriched_username_comes_from_helper_stdout() {
        let settings = settings((true, "echo kiosk|"), (false, "", 0));
        assert_eq!(
            resolve_login_policy(&settings, ":0").await,
            LoginPolicy::Auto {
                username: "kiosk".to_string()
            }
        );
    }

    #[tokio::test]
    async fn failing_helper_disables_auto_login() {
        let settings = settings((true, "false|"), (false, "", 0));
        assert_eq!(
            resolve_login_policy(&settings, ":0").await,
            LoginPolicy::Interactive
        );
    }

    #[tokio::test]
    async fn empty_helper_output_disables_auto_login() {
        let settings = settings((true, "true|"), (false, "", 0));
        assert_eq!(
            resolve_login_policy(&settings, ":0").await,
            LoginPolicy::Interactive
        );
    }
}
