//! Slave supervision
//!
//! One [`SlaveSupervisor`] per display. It owns the display server, the
//! greeter relay + greeter UI process, and the session pipeline, and it
//! applies the retry and reset policy:
//!
//! - display server readiness is retried up to [`MAX_CONNECT_ATTEMPTS`],
//!   then the whole slave aborts;
//! - a display server exit or death is always fatal to the slave;
//! - a greeter that disconnects or dies with no session in flight is
//!   relaunched through the reset path, at most [`MAX_GREETER_RESTARTS`]
//!   times before the slave gives up;
//! - a failed credential step discards the pipeline and queues a single
//!   debounced greeter reset (rapid repeated failures coalesce);
//! - a successful login stops the greeter, runs the hooks and holds the
//!   slave for the lifetime of the user session.
//!
//! All of a slave's state transitions run on its own task, so no two
//! transitions for the same display ever race. Pending debounced work
//! lives in a single slot that teardown always clears.

use crate::authority::AuthoritySession;
use crate::config::{Config, SettingsStore};
use crate::greeter::{GreeterChannel, GreeterInput};
use crate::seat::{DeviceResolver, SeatManager};
use crate::server::{DisplayServer, ServerError};
use crate::session::pipeline::{
    LoginRequest, PipelineAction, PipelineParams, PipelineStage, SessionPipeline, UidResolver,
};
use crate::session::{resolve_login_policy, LoginPolicy};
use crate::supervisor::{ChildEvent, LaunchSpec, ProcessSupervisor, RunAs};
use crate::verify::{VerifierEvent, VerifierFactory};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Ready-signal retries before the slave gives up on its display server
pub const MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Greeter launches per slave before a dying greeter stops the display
pub const MAX_GREETER_RESTARTS: u32 = 5;

/// Keepalive interval for remote displays
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Debounce window for queued resets and session starts
const PENDING_DEBOUNCE: Duration = Duration::from_millis(100);

/// Closed set of slave variants
///
/// Every variant answers the same start/stop surface; the flags below
/// select which collaborators it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveKind {
    /// Local display: server + greeter + pipeline
    Simple,

    /// Factory host for terminal sessions: server + greeter, logins are
    /// relayed to product slaves
    Factory,

    /// Product slave for one relayed login: pipeline against a
    /// pre-existing server
    Product,

    /// XDMCP host chooser: server + chooser UI, no login pipeline
    XdmcpChooser,
}

impl SlaveKind {
    fn spawns_server(self) -> bool {
        !matches!(self, SlaveKind::Product)
    }

    fn runs_pipeline(self) -> bool {
        matches!(self, SlaveKind::Simple | SlaveKind::Product)
    }

    fn runs_greeter(self) -> bool {
        !matches!(self, SlaveKind::Product)
    }
}

/// Commands from the owning display
#[derive(Debug)]
pub enum SlaveCommand {
    /// The daemon observed the display server's ready signal
    ServerReady,

    /// Stop everything owned by this slave
    Stop,
}

/// Events to the owning display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveEvent {
    /// Startup finished; the display is being served
    Started,

    /// The slave is gone (fatal error, session over, or stop request)
    Stopped,
}

/// Everything a slave needs at construction
pub struct SlaveParams {
    pub kind: SlaveKind,
    pub display_id: String,
    pub display_name: String,
    pub display_number: u32,
    pub seat_id: String,
    pub is_local: bool,
    pub vt: u32,
    pub config: Arc<Config>,
    pub settings: Arc<dyn SettingsStore>,
    pub authority: Arc<Mutex<AuthoritySession>>,
    pub verifier_factory: Arc<dyn VerifierFactory>,
    pub seat_manager: Arc<dyn SeatManager>,
    pub device_resolver: Arc<dyn DeviceResolver>,
    pub uid_resolver: UidResolver,
}

/// Handle held by the owning display
pub struct SlaveHandle {
    commands: mpsc::UnboundedSender<SlaveCommand>,
    pub events: mpsc::UnboundedReceiver<SlaveEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl SlaveHandle {
    /// Relay the display server's ready signal
    pub fn notify_server_ready(&self) {
        let _ = self.commands.send(SlaveCommand::ServerReady);
    }

    /// Cloneable relay for the ready signal, usable after the handle
    /// itself moves into a watcher task
    pub fn ready_signal(&self) -> ReadySignal {
        ReadySignal(self.commands.clone())
    }

    /// Request a stop; idempotent, resolves once the slave reports stopped
    pub async fn stop(&mut self) {
        let _ = self.commands.send(SlaveCommand::Stop);
        let wait = tokio::time::timeout(Duration::from_secs(15), async {
            while let Some(event) = self.events.recv().await {
                if event == SlaveEvent::Stopped {
                    break;
                }
            }
        });
        if wait.await.is_err() {
            warn!("slave did not stop in time, aborting its task");
            self.task.abort();
        }
    }
}

/// Delivers the display server's ready signal to a running slave
#[derive(Clone)]
pub struct ReadySignal(mpsc::UnboundedSender<SlaveCommand>);

impl ReadySignal {
    pub fn notify(&self) {
        let _ = self.0.send(SlaveCommand::ServerReady);
    }
}

/// Single-slot debounced work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    GreeterReset,
    StartSession,
}

/// What woke the slave loop up
enum Wake {
    Command(Option<SlaveCommand>),
    Server(Option<ChildEvent>),
    GreeterProc(Option<ChildEvent>),
    Greeter(Option<GreeterInput>),
    Verifier(Option<VerifierEvent>),
    Pending,
    Ping,
}

/// Supervises one display's worker set
pub struct SlaveSupervisor {
    kind: SlaveKind,
    display_id: String,
    display_name: String,
    display_number: u32,
    seat_id: String,
    is_local: bool,
    vt: u32,
    config: Arc<Config>,
    settings: Arc<dyn SettingsStore>,
    authority: Arc<Mutex<AuthoritySession>>,
    verifier_factory: Arc<dyn VerifierFactory>,
    seat_manager: Arc<dyn SeatManager>,
    device_resolver: Arc<dyn DeviceResolver>,
    uid_resolver: UidResolver,

    commands: mpsc::UnboundedReceiver<SlaveCommand>,
    events: mpsc::UnboundedSender<SlaveEvent>,

    server: Option<DisplayServer>,
    server_events: Option<mpsc::UnboundedReceiver<ChildEvent>>,
    greeter: Arc<GreeterChannel>,
    greeter_inputs: mpsc::UnboundedReceiver<GreeterInput>,
    greeter_proc: Option<ProcessSupervisor>,
    greeter_proc_events: Option<mpsc::UnboundedReceiver<ChildEvent>>,
    greeter_serve: Option<tokio::task::JoinHandle<()>>,
    pipeline: Option<SessionPipeline>,
    verifier_rx: Option<mpsc::UnboundedReceiver<VerifierEvent>>,
    user_authority: Option<AuthoritySession>,

    policy: LoginPolicy,
    pending: Option<PendingAction>,
    pending_at: Option<tokio::time::Instant>,
    busy_cursor_set: bool,
    greeter_restarts: u32,
    session_active: bool,
    stopped: bool,
}

impl SlaveSupervisor {
    /// Spawn the slave task and return the owner's handle
    pub fn spawn(params: SlaveParams) -> SlaveHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (greeter, greeter_inputs) = GreeterChannel::new();

        let slave = SlaveSupervisor {
            kind: params.kind,
            display_id: params.display_id,
            display_name: params.display_name,
            display_number: params.display_number,
            seat_id: params.seat_id,
            is_local: params.is_local,
            vt: params.vt,
            config: params.config,
            settings: params.settings,
            authority: params.authority,
            verifier_factory: params.verifier_factory,
            seat_manager: params.seat_manager,
            device_resolver: params.device_resolver,
            uid_resolver: params.uid_resolver,
            commands: commands_rx,
            events: events_tx,
            server: None,
            server_events: None,
            greeter,
            greeter_inputs,
            greeter_proc: None,
            greeter_proc_events: None,
            greeter_serve: None,
            pipeline: None,
            verifier_rx: None,
            user_authority: None,
            policy: LoginPolicy::Interactive,
            pending: None,
            pending_at: None,
            busy_cursor_set: false,
            greeter_restarts: 0,
            session_active: false,
            stopped: false,
        };

        let task = tokio::spawn(slave.run());
        SlaveHandle {
            commands: commands_tx,
            events: events_rx,
            task,
        }
    }

    async fn run(mut self) {
        info!(display = %self.display_name, kind = ?self.kind, "slave starting");

        if let Err(e) = self.startup().await {
            error!(display = %self.display_name, error = %e, "slave startup failed");
            self.shutdown().await;
            return;
        }
        let _ = self.events.send(SlaveEvent::Started);

        let remote = !self.is_local;
        let mut ping = tokio::time::interval(DEFAULT_PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.stopped {
            let pending_at = self.pending_at;
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                event = recv_opt(&mut self.server_events) => Wake::Server(event),
                event = recv_opt(&mut self.greeter_proc_events) => Wake::GreeterProc(event),
                input = self.greeter_inputs.recv() => Wake::Greeter(input),
                event = recv_opt(&mut self.verifier_rx) => Wake::Verifier(event),
                _ = sleep_until_opt(pending_at), if pending_at.is_some() => Wake::Pending,
                _ = ping.tick(), if remote => Wake::Ping,
            };

            match wake {
                Wake::Command(Some(SlaveCommand::ServerReady)) => self.relay_server_ready(),
                Wake::Command(Some(SlaveCommand::Stop)) | Wake::Command(None) => {
                    self.shutdown().await;
                }
                Wake::Server(Some(event)) => self.on_server_terminated(event).await,
                Wake::Server(None) => self.server_events = None,
                Wake::GreeterProc(Some(event)) => self.on_greeter_proc_terminated(event).await,
                Wake::GreeterProc(None) => self.greeter_proc_events = None,
                Wake::Greeter(Some(input)) => self.on_greeter_input(input).await,
                Wake::Greeter(None) => self.shutdown().await,
                Wake::Verifier(Some(event)) => self.on_verifier_event(event).await,
                Wake::Verifier(None) => self.verifier_rx = None,
                Wake::Pending => self.run_pending().await,
                Wake::Ping => {
                    debug!(display = %self.display_name, "remote display keepalive");
                }
            }
        }
    }

    /// Bring up the display server (with retries), the greeter, and the
    /// initial pipeline
    async fn startup(&mut self) -> anyhow::Result<()> {
        use anyhow::Context;

        self.policy = resolve_login_policy(self.settings.as_ref(), &self.display_name).await;

        if self.kind.spawns_server() && self.is_local {
            self.start_display_server().await?;
        }
        self.set_busy_cursor();

        if let Some(server) = &mut self.server {
            // Best effort; a missing device helper is not fatal
            if let Err(e) = server.display_device(self.device_resolver.as_ref()).await {
                debug!(display = %self.display_name, error = %e, "display device not resolved");
            }
        }

        let auto = matches!(self.policy, LoginPolicy::Auto { .. });
        if self.kind.runs_greeter() && !auto {
            self.launch_greeter().context("launching greeter")?;
        }

        if self.kind.runs_pipeline() {
            if let LoginPolicy::Auto { username } = self.policy.clone() {
                self.build_pipeline(None, None);
                if let Some(pipeline) = &mut self.pipeline {
                    pipeline.begin(LoginRequest::Auto { username }).await;
                }
            }
        }
        Ok(())
    }

    async fn start_display_server(&mut self) -> anyhow::Result<()> {
        let mut server = DisplayServer::new(
            self.display_number,
            self.vt,
            self.config.xserver.clone(),
            self.authority.lock().path(),
            self.config.daemon.log_dir.clone(),
        );
        server.start()?;
        let notifier = server.ready_notifier();
        let mut server_events = server
            .take_events()
            .ok_or_else(|| anyhow::anyhow!("server event stream already taken"))?;
        let timeout = Duration::from_secs(self.config.xserver.ready_timeout_secs);

        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                result = server.wait_ready(timeout) => match result {
                    Ok(()) => break,
                    Err(ServerError::ReadyTimeout { .. }) => {
                        attempts += 1;
                        if attempts >= MAX_CONNECT_ATTEMPTS {
                            anyhow::bail!(
                                "display server for {} not ready after {attempts} attempts",
                                self.display_name
                            );
                        }
                        warn!(display = %self.display_name, attempts,
                              "display server not ready, retrying");
                    }
                    Err(e) => return Err(e.into()),
                },
                event = server_events.recv() => {
                    anyhow::bail!("display server terminated during startup: {event:?}");
                }
                command = self.commands.recv() => match command {
                    Some(SlaveCommand::ServerReady) => notifier.notify(),
                    // Dropping the server kills the child
                    Some(SlaveCommand::Stop) | None => {
                        anyhow::bail!("stop requested during startup");
                    }
                },
            }
        }

        info!(display = %self.display_name, "display server ready");
        self.server = Some(server);
        self.server_events = Some(server_events);
        Ok(())
    }

    /// Cosmetic busy indicator, applied exactly once after connect
    fn set_busy_cursor(&mut self) {
        if self.busy_cursor_set {
            return;
        }
        self.busy_cursor_set = true;
        debug!(display = %self.display_name, "busy cursor set");
    }

    fn relay_server_ready(&mut self) {
        if let Some(server) = &mut self.server {
            server.notify_ready();
        }
    }

    fn greeter_socket_path(&self) -> PathBuf {
        self.config
            .greeter
            .socket_dir
            .join(format!("display-{}.sock", self.display_number))
    }

    fn launch_greeter(&mut self) -> anyhow::Result<()> {
        let socket_path = self.greeter_socket_path();
        std::fs::create_dir_all(&self.config.greeter.socket_dir)?;
        let listener = crate::greeter::bind_socket(&socket_path)?;
        let channel = self.greeter.clone();
        self.greeter_serve = Some(tokio::spawn(async move {
            if let Err(e) = crate::greeter::serve_unix(channel, listener).await {
                debug!(error = %e, "greeter socket server ended");
            }
        }));

        let mut spec = LaunchSpec::new(&self.config.greeter.command)
            .env("DISPLAY", &self.display_name)
            .env(
                "XAUTHORITY",
                self.authority.lock().path().display().to_string(),
            )
            .env("LDM_GREETER_SOCKET", socket_path.display().to_string())
            .env("XDG_SEAT", &self.seat_id)
            .env("XDG_SESSION_DESKTOP", &self.config.greeter.session_name);
        if self.config.daemon.work_dir.is_dir() {
            spec.work_dir = Some(self.config.daemon.work_dir.clone());
        }
        spec.log_file = Some(
            self.config
                .daemon
                .log_dir
                .join(format!("greeter-{}.log", self.display_number)),
        );
        spec.run_as = greeter_run_as(&self.config);

        let mut proc = ProcessSupervisor::new(format!("greeter{}", self.display_name));
        proc.start(&spec)?;
        self.greeter_proc_events = proc.take_events();
        self.greeter_proc = Some(proc);
        info!(display = %self.display_name, "greeter launched");
        Ok(())
    }

    /// Discard any current pipeline and build a fresh one
    ///
    /// Only the last selected language/layout survive the swap.
    fn build_pipeline(&mut self, language: Option<String>, layout: Option<String>) {
        let (pipeline, verifier_rx) = SessionPipeline::new(PipelineParams {
            verifier_factory: self.verifier_factory.clone(),
            seat_manager: self.seat_manager.clone(),
            uid_resolver: self.uid_resolver.clone(),
            seat_id: self.seat_id.clone(),
            display_name: self.display_name.clone(),
            service: "ldm".to_string(),
            auto_service: "ldm-autologin".to_string(),
            language,
            layout,
        });
        self.pipeline = Some(pipeline);
        self.verifier_rx = Some(verifier_rx);
    }

    async fn restart_pipeline(&mut self, request: LoginRequest) {
        let (language, layout) = self.carryover();
        if let Some(pipeline) = &mut self.pipeline {
            pipeline.cancel().await;
        }
        self.build_pipeline(language, layout);
        if let Some(pipeline) = &mut self.pipeline {
            pipeline.begin(request).await;
        }
    }

    fn carryover(&self) -> (Option<String>, Option<String>) {
        match &self.pipeline {
            Some(pipeline) => (
                pipeline.language().map(String::from),
                pipeline.layout().map(String::from),
            ),
            None => (None, None),
        }
    }

    async fn on_greeter_input(&mut self, input: GreeterInput) {
        match input {
            GreeterInput::Connected => {
                debug!(display = %self.display_name, "greeter attached");
            }
            GreeterInput::Disconnected => {
                if self.session_active {
                    debug!(display = %self.display_name, "greeter gone after login");
                } else {
                    warn!(display = %self.display_name, "greeter disconnected");
                    self.stop_greeter_proc().await;
                    self.queue_reset();
                }
            }
            GreeterInput::BeginVerification => {
                self.restart_pipeline(LoginRequest::Interactive).await;
            }
            GreeterInput::BeginVerificationForUser(username) => {
                self.restart_pipeline(LoginRequest::ForUser { username }).await;
            }
            GreeterInput::BeginAutoLogin(username) => {
                self.restart_pipeline(LoginRequest::Auto { username }).await;
            }
            GreeterInput::AnswerQuery(text) => {
                if let Some(pipeline) = &mut self.pipeline {
                    pipeline.answer_query(&text).await;
                }
            }
            GreeterInput::SelectSession(name) => {
                if let Some(pipeline) = &mut self.pipeline {
                    pipeline.select_session(&name).await;
                }
            }
            GreeterInput::SelectLanguage(name) => {
                if let Some(pipeline) = &mut self.pipeline {
                    pipeline.select_language(&name).await;
                }
            }
            GreeterInput::SelectLayout(name) => {
                if let Some(pipeline) = &mut self.pipeline {
                    pipeline.select_layout(&name).await;
                }
            }
            GreeterInput::SelectUser(name) => {
                if let Some(pipeline) = &mut self.pipeline {
                    pipeline.select_user(&name).await;
                }
                self.greeter.selected_user_changed(&name);
            }
            GreeterInput::Cancel => {
                if let Some(pipeline) = &mut self.pipeline {
                    pipeline.cancel().await;
                }
                self.queue_reset();
            }
            GreeterInput::StartSessionWhenReady(ready) => {
                let actions = match &mut self.pipeline {
                    Some(pipeline) => pipeline.set_start_when_ready(ready).await,
                    None => vec![],
                };
                self.apply_actions(actions).await;
            }
        }
    }

    async fn on_verifier_event(&mut self, event: VerifierEvent) {
        let actions = match &mut self.pipeline {
            Some(pipeline) => pipeline.handle_verifier_event(event).await,
            None => vec![],
        };
        self.apply_actions(actions).await;
    }

    async fn apply_actions(&mut self, actions: Vec<PipelineAction>) {
        for action in actions {
            match action {
                PipelineAction::ConversationStarted => {
                    self.greeter.ready();
                    if let LoginPolicy::Timed { username, delay } = self.policy.clone() {
                        self.greeter.request_timed_login(&username, delay);
                    }
                }
                PipelineAction::GreeterInfo(text) => self.greeter.info(&text),
                PipelineAction::GreeterProblem(text) => self.greeter.problem(&text),
                PipelineAction::GreeterInfoQuery(text) => self.greeter.info_query(&text),
                PipelineAction::GreeterSecretQuery(text) => self.greeter.secret_info_query(&text),
                PipelineAction::UsernameChanged(username) => {
                    self.greeter.selected_user_changed(&username);
                }
                PipelineAction::UserAuthorized => self.greeter.user_authorized(),
                PipelineAction::Failed { stage, message } => {
                    self.greeter.problem(&message);
                    if stage == PipelineStage::Authenticate {
                        self.greeter.authentication_failed();
                    }
                    self.queue_reset();
                }
                PipelineAction::Migrated => {
                    // The display server survives: killing it would switch
                    // the seat's VT and defeat fast user switching
                    info!(display = %self.display_name, "migrated to existing session");
                    self.close_user_authority();
                    self.queue_reset();
                }
                PipelineAction::QueuedStart => self.queue_start(),
                PipelineAction::Started(pid) => {
                    info!(display = %self.display_name, pid, "session in progress");
                    self.session_active = true;
                }
                PipelineAction::SessionExited(code) => {
                    info!(display = %self.display_name, code, "user session exited");
                    self.shutdown().await;
                }
                PipelineAction::SessionDied(signal) => {
                    warn!(display = %self.display_name, signal, "user session died");
                    self.shutdown().await;
                }
            }
        }
    }

    /// Queue the debounced greeter reset; repeated failures coalesce
    fn queue_reset(&mut self) {
        if self.pending == Some(PendingAction::GreeterReset) {
            return;
        }
        self.pending = Some(PendingAction::GreeterReset);
        self.pending_at = Some(tokio::time::Instant::now() + PENDING_DEBOUNCE);
    }

    fn queue_start(&mut self) {
        if self.pending.is_some() {
            // A queued reset outranks a start; a queued start stays queued
            return;
        }
        self.pending = Some(PendingAction::StartSession);
        self.pending_at = Some(tokio::time::Instant::now());
    }

    async fn run_pending(&mut self) {
        self.pending_at = None;
        match self.pending.take() {
            Some(PendingAction::GreeterReset) => self.reset_greeter().await,
            Some(PendingAction::StartSession) => self.execute_queued_start().await,
            None => {}
        }
    }

    /// Put a greeter back on screen and replace the pipeline with a
    /// fresh one
    ///
    /// With a greeter process running this is a reset command over the
    /// channel; with none (failed automatic login, dead greeter) a new
    /// greeter is launched, bounded by [`MAX_GREETER_RESTARTS`].
    async fn reset_greeter(&mut self) {
        debug!(display = %self.display_name, "resetting greeter");
        self.session_active = false;
        self.close_user_authority();
        if self.greeter_proc.is_some() {
            self.greeter.reset();
        } else if self.kind.runs_greeter() {
            self.greeter_restarts += 1;
            if self.greeter_restarts > MAX_GREETER_RESTARTS {
                error!(display = %self.display_name, restarts = self.greeter_restarts - 1,
                       "greeter keeps dying, stopping the display");
                self.shutdown().await;
                return;
            }
            if let Err(e) = self.launch_greeter() {
                error!(display = %self.display_name, error = %e, "greeter launch failed");
                self.shutdown().await;
                return;
            }
        }
        self.restart_pipeline(LoginRequest::Interactive).await;
    }

    /// Run the deferred session start: hooks, user authority, launch
    async fn execute_queued_start(&mut self) {
        let queued = self
            .pipeline
            .as_mut()
            .map(SessionPipeline::take_queued_start)
            .unwrap_or(false);
        if !queued {
            return;
        }

        let username = self
            .pipeline
            .as_ref()
            .and_then(|p| p.username().map(String::from));

        if let Some(username) = &username {
            self.run_hook("PostLogin", username).await;
        }
        // The login is committed from here: the greeter teardown below
        // must not read as a crash and respawn a UI over the session.
        self.session_active = true;
        self.stop_greeter_proc().await;

        let authority_file = match username
            .as_deref()
            .map(|username| self.create_user_authority(username))
        {
            Some(Ok(path)) => Some(path),
            Some(Err(e)) => {
                error!(display = %self.display_name, error = %e, "user authority failed");
                self.greeter.problem("Unable to authorize user for display");
                self.queue_reset();
                return;
            }
            None => None,
        };

        if let Some(username) = &username {
            self.run_hook("PreSession", username).await;
        }
        if let Some(pipeline) = &mut self.pipeline {
            pipeline.start(authority_file).await;
        }
    }

    /// Create the user-level authority file sharing the display's cookie
    fn create_user_authority(&mut self, username: &str) -> anyhow::Result<PathBuf> {
        let mut display_authority = self.authority.lock();
        let cookie = display_authority.cookie().to_vec();
        display_authority.add_user(username, self.display_number)?;
        drop(display_authority);

        let mut user_authority = AuthoritySession::create(
            &self.config.daemon.auth_dir,
            &format!("{}-user", self.display_id),
        )?;
        user_authority.add_display_with_cookie(self.display_number, &cookie)?;
        user_authority.add_user(username, self.display_number)?;
        let path = user_authority.path().to_path_buf();
        self.user_authority = Some(user_authority);
        Ok(path)
    }

    fn close_user_authority(&mut self) {
        if let Some(mut authority) = self.user_authority.take() {
            authority.close();
        }
    }

    async fn run_hook(&self, name: &str, username: &str) {
        let path = self.config.daemon.hook_dir.join(name);
        if !path.exists() {
            return;
        }
        debug!(hook = name, username, "running hook");
        let result = tokio::process::Command::new(&path)
            .env("DISPLAY", &self.display_name)
            .env("USER", username)
            .env("LOGNAME", username)
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(hook = name, status = %output.status, "hook failed"),
            Err(e) => warn!(hook = name, error = %e, "hook could not run"),
        }
    }

    async fn on_server_terminated(&mut self, event: ChildEvent) {
        error!(display = %self.display_name, ?event, "display server terminated");
        if let Some(server) = &mut self.server {
            server.mark_terminated(event);
        }
        self.shutdown().await;
    }

    async fn on_greeter_proc_terminated(&mut self, event: ChildEvent) {
        if self.session_active {
            debug!(display = %self.display_name, ?event, "greeter exited after login");
            return;
        }
        warn!(display = %self.display_name, ?event, "greeter process ended");
        // A greeter that died before its socket ever connected produces
        // no Disconnected input; recovery has to start here.
        self.greeter.mark_disconnected();
        self.stop_greeter_proc().await;
        self.queue_reset();
    }

    async fn stop_greeter_proc(&mut self) {
        if let Some(task) = self.greeter_serve.take() {
            task.abort();
        }
        self.greeter_proc_events = None;
        if let Some(mut proc) = self.greeter_proc.take() {
            proc.stop().await;
        }
        let _ = std::fs::remove_file(self.greeter_socket_path());
    }

    /// Stop everything owned by this slave; idempotent
    async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!(display = %self.display_name, "slave stopping");

        // Cancel pending debounced work before releasing anything
        self.pending = None;
        self.pending_at = None;

        if let Some(pipeline) = &mut self.pipeline {
            pipeline.cancel().await;
        }
        self.pipeline = None;
        self.verifier_rx = None;

        self.close_user_authority();
        self.stop_greeter_proc().await;

        if let Some(server) = &mut self.server {
            server.stop().await;
        }
        self.server = None;
        self.server_events = None;

        let _ = self.events.send(SlaveEvent::Stopped);
    }
}

fn greeter_run_as(config: &Config) -> Option<RunAs> {
    // Only meaningful when the daemon runs as root; otherwise inherit
    if !nix::unistd::Uid::effective().is_root() {
        return None;
    }
    let user = nix::unistd::User::from_name(&config.daemon.user)
        .ok()
        .flatten()?;
    Some(RunAs {
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
    })
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
