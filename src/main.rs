//! ldmd - display manager daemon
//!
//! Entry point for the daemon binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ldm::config::{Config, SettingsStore};
use ldm::registry::{DisplayLocation, DisplayRegistry, DisplayStatus, ManageDeps};
use ldm::seat::{DeviceResolver, HelperDeviceResolver, LogindSeatManager, SeatManager};
use ldm::session::pipeline::system_uid_resolver;
use ldm::slave::SlaveKind;
use ldm::verify::{CredentialVerifier, VerifierEvent, VerifierFactory};

/// Command-line arguments for ldmd
#[derive(Parser, Debug)]
#[command(name = "ldmd")]
#[command(version, about = "Display manager daemon", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/ldm/ldm.toml")]
    pub config: String,

    /// Seat for the static local display
    #[arg(short, long, env = "LDM_SEAT")]
    pub seat: Option<String>,

    /// Do not manage the static local console display
    #[arg(long)]
    pub no_console: bool,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file (in addition to stdout)
    #[arg(long)]
    pub log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("════════════════════════════════════════════════════════");
    info!("  ldmd v{}", env!("CARGO_PKG_VERSION"));
    info!("  Built: {} {}", env!("BUILD_DATE"), env!("BUILD_TIME"));
    info!("  Commit: {}", env!("GIT_HASH"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("════════════════════════════════════════════════════════");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config: {e}, using defaults");
            Config::default()
        }
    };
    let config = config.with_overrides(args.seat.clone(), args.log_file.clone().map(PathBuf::from));
    config.validate()?;

    info!("Configuration loaded successfully");
    tracing::debug!("Config: {config:?}");

    run(config, args.no_console).await
}

/// Supervise the static local display until shutdown
async fn run(config: Config, no_console: bool) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let config = Arc::new(config);
    if nix::unistd::Uid::effective().is_root()
        && nix::unistd::User::from_name(&config.daemon.user)?.is_none()
    {
        anyhow::bail!("greeter user '{}' does not exist", config.daemon.user);
    }
    std::fs::create_dir_all(&config.daemon.auth_dir)?;
    std::fs::create_dir_all(&config.daemon.log_dir)?;

    let settings: Arc<dyn SettingsStore> = Arc::new(config.settings());
    let seat_manager: Arc<dyn SeatManager> = Arc::new(LogindSeatManager::new().await?);
    let device_resolver: Arc<dyn DeviceResolver> =
        Arc::new(HelperDeviceResolver::new(&config.seat.device_helper));
    let deps = ManageDeps {
        config: config.clone(),
        settings,
        verifier_factory: verifier_factory(&config),
        seat_manager,
        device_resolver,
        uid_resolver: system_uid_resolver(),
        vt: config.xserver.first_vt,
    };

    let registry = Arc::new(DisplayRegistry::new());
    let display = if no_console {
        info!("console display disabled, waiting for shutdown signal");
        None
    } else {
        let created =
            registry.create_display(0, &config.seat.default_seat, DisplayLocation::Local);
        registry.prepare_display(&created.id, &config.daemon.auth_dir)?;
        registry.manage_display(&created.id, SlaveKind::Simple, deps.clone())?;
        info!(display = %created.name, seat = %config.seat.default_seat, "static display managed");
        Some(created)
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    // The X server raises SIGUSR1 at its parent once it accepts connections
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    let mut stopping = false;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                registry.shutdown();
                stopping = true;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                registry.shutdown();
                stopping = true;
            }
            _ = sigusr1.recv() => {
                if let Some(console) = &display {
                    registry.notify_server_ready(&console.id);
                }
            }
            _ = tick.tick() => {
                let Some(console) = &display else {
                    if stopping {
                        break;
                    }
                    continue;
                };
                let Some(snapshot) = registry.display(&console.id) else {
                    break;
                };
                match snapshot.status {
                    DisplayStatus::Finished => break,
                    DisplayStatus::Failed => {
                        anyhow::bail!("display {} failed, not restarting", snapshot.name);
                    }
                    DisplayStatus::Unmanaged if !stopping => {
                        // Healthy cycle ended (user logged out); run another
                        info!(display = %snapshot.name, "starting a new display cycle");
                        registry.prepare_display(&console.id, &config.daemon.auth_dir)?;
                        registry.manage_display(&console.id, SlaveKind::Simple, deps.clone())?;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("ldmd shut down");
    Ok(())
}

#[cfg(feature = "pam-auth")]
fn verifier_factory(config: &Arc<Config>) -> Arc<dyn VerifierFactory> {
    use ldm::verify::pam::PamVerifier;

    let session_command = config.daemon.session_command.clone();
    Arc::new(
        move |events: tokio::sync::mpsc::UnboundedSender<VerifierEvent>| {
            Arc::new(PamVerifier::new(events, session_command.clone()))
                as Arc<dyn CredentialVerifier>
        },
    )
}

#[cfg(not(feature = "pam-auth"))]
fn verifier_factory(_config: &Arc<Config>) -> Arc<dyn VerifierFactory> {
    Arc::new(
        |events: tokio::sync::mpsc::UnboundedSender<VerifierEvent>| {
            Arc::new(UnavailableVerifier { events }) as Arc<dyn CredentialVerifier>
        },
    )
}

/// Placeholder verifier for builds without a credential backend
///
/// Every conversation fails at setup with a message the greeter can show.
#[cfg(not(feature = "pam-auth"))]
struct UnavailableVerifier {
    events: tokio::sync::mpsc::UnboundedSender<VerifierEvent>,
}

#[cfg(not(feature = "pam-auth"))]
#[async_trait::async_trait]
impl CredentialVerifier for UnavailableVerifier {
    async fn setup(&self, _service: &str) {
        let _ = self.events.send(VerifierEvent::SetupFailed(
            "no credential backend available".to_string(),
        ));
    }
    async fn setup_for_user(&self, service: &str, _username: &str) {
        self.setup(service).await;
    }
    async fn authenticate(&self) {}
    async fn authorize(&self) {}
    async fn accredit(&self, _flag: ldm::verify::AccreditFlag) {}
    async fn open_session(&self) {}
    async fn start_session(&self, _resources: &ldm::verify::SessionResources) {}
    async fn answer_query(&self, _text: &str) {}
    async fn select_session(&self, _name: &str) {}
    async fn select_language(&self, _name: &str) {}
    async fn select_layout(&self, _name: &str) {}
    async fn select_user(&self, _name: &str) {}
    async fn cancel(&self) {}
}

fn init_logging(args: &Args) -> Result<()> {
    use std::fs::File;

    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("ldm={log_level},zbus=info,warn"))
    });

    // If log file is specified, write to both stdout and file
    if let Some(log_file_path) = &args.log_file {
        let file = File::create(log_file_path)?;

        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stdout),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        info!("Logging to file: {log_file_path}");
    } else {
        match args.log_format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact())
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .init();
            }
        }
    }

    Ok(())
}
