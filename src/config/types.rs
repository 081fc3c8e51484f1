//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Daemon identity and filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unprivileged user the greeter runs as
    pub user: String,

    /// Group for the greeter user
    pub group: String,

    /// Directory for per-display authority files
    pub auth_dir: PathBuf,

    /// Directory for child process log files
    pub log_dir: PathBuf,

    /// Working directory for spawned children
    pub work_dir: PathBuf,

    /// Directory holding PreSession/PostLogin/PostSession hook scripts
    pub hook_dir: PathBuf,

    /// Script exec'd as the user session (an Xsession wrapper)
    pub session_command: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            user: "ldm".to_string(),
            group: "ldm".to_string(),
            auth_dir: PathBuf::from("/var/run/ldm"),
            log_dir: PathBuf::from("/var/log/ldm"),
            work_dir: PathBuf::from("/var/lib/ldm"),
            hook_dir: PathBuf::from("/etc/ldm"),
            session_command: PathBuf::from("/etc/ldm/Xsession"),
        }
    }
}

/// X server launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XServerConfig {
    /// X server binary
    pub command: PathBuf,

    /// Extra arguments appended after the standard set
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// First virtual terminal to allocate for local displays
    pub first_vt: u32,

    /// Seconds to wait for the server's ready signal before retrying
    pub ready_timeout_secs: u64,

    /// Disable TCP listeners on the X server
    pub disallow_tcp: bool,
}

impl Default for XServerConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("/usr/bin/Xorg"),
            extra_args: Vec::new(),
            first_vt: 7,
            ready_timeout_secs: 10,
            disallow_tcp: true,
        }
    }
}

/// Greeter UI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeterConfig {
    /// Greeter binary
    pub command: PathBuf,

    /// Directory for the per-display greeter control sockets
    pub socket_dir: PathBuf,

    /// Session name reported for the greeter session
    pub session_name: String,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("/usr/libexec/ldm-greeter"),
            socket_dir: PathBuf::from("/var/run/ldm/greeter"),
            session_name: "LDM-Greeter".to_string(),
        }
    }
}

/// Automatic login configuration
///
/// A `user` value ending in `|` is treated as a helper command whose
/// stdout supplies the effective username.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoLoginConfig {
    pub enabled: bool,

    #[serde(default)]
    pub user: String,
}

/// Timed login configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimedLoginConfig {
    pub enabled: bool,

    #[serde(default)]
    pub user: String,

    /// Countdown in seconds; values <= 0 fall back to the default of 10
    #[serde(default)]
    pub delay: i64,
}

/// Seat and device resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatConfig {
    /// Seat the static local display is bound to
    pub default_seat: String,

    /// Helper executed to resolve the device backing a display
    pub device_helper: PathBuf,
}

impl Default for SeatConfig {
    fn default() -> Self {
        Self {
            default_seat: "seat0".to_string(),
            device_helper: PathBuf::from("/usr/libexec/ldm-device-for-display"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error")
    pub level: String,

    /// Log format ("json", "pretty", "compact")
    pub format: String,

    /// Optional log file (in addition to stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}
