//! Session pipeline state machine
//!
//! Drives one login attempt through setup, authentication, authorization,
//! accreditation, session open and session start. The pipeline consumes
//! [`VerifierEvent`]s and answers with [`PipelineAction`]s for the owning
//! slave to apply; it never talks to the greeter or the display directly.
//!
//! A pipeline is single-use. Any failed step makes the owner discard the
//! object and build a fresh one, so partially-initialized conversation
//! state can never leak into a retry. The only state that survives a
//! rebuild is the most recently selected language and layout, which the
//! owner passes back in through [`PipelineParams`].
//!
//! Fast user switching: before accrediting, the pipeline asks the seat
//! manager whether the target user already has a session on this seat and
//! migrates to it (activate + unlock) instead of opening a second one.
//! Migration counts as successful only when both calls succeed; anything
//! else falls through to normal accreditation.

use crate::seat::SeatManager;
use crate::verify::{
    AccreditFlag, CredentialVerifier, SessionResources, VerifierEvent, VerifierFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Pipeline stages in ritual order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStage {
    Idle,
    Setup,
    Authenticate,
    Authorize,
    Accredit,
    Open,
    Start,
    Done,
}

impl PipelineStage {
    /// Fallback user-visible message for a failure at this stage
    pub fn failure_message(self) -> &'static str {
        match self {
            PipelineStage::Setup => "Unable to initialize login system",
            PipelineStage::Authenticate => "Unable to authenticate user",
            PipelineStage::Authorize => "Unable to authorize user",
            PipelineStage::Accredit => "Unable to establish credentials",
            PipelineStage::Open | PipelineStage::Start => "Unable to open session",
            PipelineStage::Idle | PipelineStage::Done => "Login failed",
        }
    }
}

/// How this attempt begins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginRequest {
    /// Greeter-driven: username collected through queries
    Interactive,

    /// Verify a specific user chosen in the greeter
    ForUser { username: String },

    /// Automatic login without user interaction
    Auto { username: String },
}

/// Instructions handed back to the owning slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineAction {
    /// Setup completed; greeter should be told `ready`
    ConversationStarted,

    /// Forward informational text to the greeter
    GreeterInfo(String),

    /// Forward failure text to the greeter
    GreeterProblem(String),

    /// Forward a visible prompt to the greeter
    GreeterInfoQuery(String),

    /// Forward a hidden prompt to the greeter
    GreeterSecretQuery(String),

    /// Effective username is known
    UsernameChanged(String),

    /// Authorization succeeded; greeter should be told
    UserAuthorized,

    /// A credential step failed; discard this pipeline and reset
    Failed {
        stage: PipelineStage,
        message: String,
    },

    /// Switched to the user's existing session; discard this pipeline,
    /// reset the greeter, keep the display server alive
    Migrated,

    /// Session open completed; owner should run the queued start
    QueuedStart,

    /// User session process is running
    Started(u32),

    /// User session ended normally
    SessionExited(i32),

    /// User session was killed by a signal
    SessionDied(i32),
}

/// Resolves a username to a uid; injectable for tests
pub type UidResolver = Arc<dyn Fn(&str) -> Option<u32> + Send + Sync>;

/// System uid resolver backed by the passwd database
pub fn system_uid_resolver() -> UidResolver {
    Arc::new(|username| {
        nix::unistd::User::from_name(username)
            .ok()
            .flatten()
            .map(|user| user.uid.as_raw())
    })
}

/// Construction parameters for one pipeline
pub struct PipelineParams {
    pub verifier_factory: Arc<dyn VerifierFactory>,
    pub seat_manager: Arc<dyn SeatManager>,
    pub uid_resolver: UidResolver,
    pub seat_id: String,
    pub display_name: String,
    /// PAM-equivalent service name for interactive logins
    pub service: String,
    /// Service name for automatic logins
    pub auto_service: String,
    /// Carried forward from the previous attempt, if any
    pub language: Option<String>,
    /// Carried forward from the previous attempt, if any
    pub layout: Option<String>,
}

/// One login attempt
pub struct SessionPipeline {
    stage: PipelineStage,
    verifier: Arc<dyn CredentialVerifier>,
    seat_manager: Arc<dyn SeatManager>,
    uid_resolver: UidResolver,
    seat_id: String,
    display_name: String,
    service: String,
    auto_service: String,

    username: Option<String>,
    selected_session: Option<String>,
    language: Option<String>,
    layout: Option<String>,

    /// False in greeter-driven mode until the greeter says "start now"
    start_when_ready: bool,
    /// Authorization finished while start_when_ready was false
    waiting_to_start: bool,
    /// Single-slot debounce for the queued session start
    pending_start: bool,
    accredit_flag: AccreditFlag,
}

impl SessionPipeline {
    /// Build a fresh pipeline and its verifier event stream
    pub fn new(params: PipelineParams) -> (Self, mpsc::UnboundedReceiver<VerifierEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let verifier = params.verifier_factory.create(events_tx);
        (
            Self {
                stage: PipelineStage::Idle,
                verifier,
                seat_manager: params.seat_manager,
                uid_resolver: params.uid_resolver,
                seat_id: params.seat_id,
                display_name: params.display_name,
                service: params.service,
                auto_service: params.auto_service,
                username: None,
                selected_session: None,
                language: params.language,
                layout: params.layout,
                start_when_ready: false,
                waiting_to_start: false,
                pending_start: false,
                accredit_flag: AccreditFlag::Establish,
            },
            events_rx,
        )
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn selected_session(&self) -> Option<&str> {
        self.selected_session.as_deref()
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn layout(&self) -> Option<&str> {
        self.layout.as_deref()
    }

    /// Begin the credential conversation
    pub async fn begin(&mut self, request: LoginRequest) {
        self.stage = PipelineStage::Setup;
        match request {
            LoginRequest::Interactive => {
                debug!(display = %self.display_name, "setup (greeter-driven)");
                self.verifier.setup(&self.service).await;
            }
            LoginRequest::ForUser { username } => {
                debug!(display = %self.display_name, username, "setup for user");
                self.username = Some(username.clone());
                self.verifier.setup_for_user(&self.service, &username).await;
            }
            LoginRequest::Auto { username } => {
                info!(display = %self.display_name, username, "automatic login setup");
                self.username = Some(username.clone());
                self.start_when_ready = true;
                self.verifier
                    .setup_for_user(&self.auto_service.clone(), &username)
                    .await;
            }
        }
    }

    /// Apply one verifier event, returning actions for the owner
    pub async fn handle_verifier_event(&mut self, event: VerifierEvent) -> Vec<PipelineAction> {
        match event {
            VerifierEvent::SetupComplete => {
                self.stage = PipelineStage::Authenticate;
                self.verifier.authenticate().await;
                vec![PipelineAction::ConversationStarted]
            }
            VerifierEvent::SetupFailed(message) => self.fail(PipelineStage::Setup, message),

            VerifierEvent::Authenticated => {
                self.stage = PipelineStage::Authorize;
                self.verifier.authorize().await;
                vec![]
            }
            VerifierEvent::AuthenticationFailed(message) => {
                self.fail(PipelineStage::Authenticate, message)
            }

            VerifierEvent::Authorized => {
                let mut actions = vec![PipelineAction::UserAuthorized];
                actions.extend(self.accredit_when_ready().await);
                actions
            }
            VerifierEvent::AuthorizationFailed(message) => {
                self.fail(PipelineStage::Authorize, message)
            }

            VerifierEvent::Accredited => {
                self.stage = PipelineStage::Open;
                self.verifier.open_session().await;
                vec![]
            }
            VerifierEvent::AccreditationFailed(message) => {
                // Switching to an existing session makes the failure moot
                if self.try_migrate().await {
                    info!(display = %self.display_name, "migrated after accreditation failure");
                    vec![PipelineAction::Migrated]
                } else {
                    self.fail(PipelineStage::Accredit, message)
                }
            }

            VerifierEvent::SessionOpened => {
                if self.start_when_ready {
                    self.queue_start()
                } else {
                    self.waiting_to_start = true;
                    vec![]
                }
            }
            VerifierEvent::SessionOpenFailed(message) => self.fail(PipelineStage::Open, message),

            VerifierEvent::SessionStarted(pid) => {
                self.stage = PipelineStage::Done;
                info!(display = %self.display_name, pid, "user session started");
                vec![PipelineAction::Started(pid)]
            }
            VerifierEvent::SessionExited(code) => vec![PipelineAction::SessionExited(code)],
            VerifierEvent::SessionDied(signal) => vec![PipelineAction::SessionDied(signal)],

            VerifierEvent::UsernameChanged(username) => {
                self.username = Some(username.clone());
                vec![PipelineAction::UsernameChanged(username)]
            }
            VerifierEvent::Info(text) => vec![PipelineAction::GreeterInfo(text)],
            VerifierEvent::Problem(text) => vec![PipelineAction::GreeterProblem(text)],
            VerifierEvent::InfoQuery(text) => vec![PipelineAction::GreeterInfoQuery(text)],
            VerifierEvent::SecretInfoQuery(text) => vec![PipelineAction::GreeterSecretQuery(text)],
        }
    }

    /// Greeter answered an outstanding query
    pub async fn answer_query(&mut self, text: &str) {
        self.verifier.answer_query(text).await;
    }

    pub async fn select_session(&mut self, name: &str) {
        self.selected_session = Some(name.to_string());
        self.verifier.select_session(name).await;
    }

    pub async fn select_language(&mut self, name: &str) {
        self.language = Some(name.to_string());
        self.verifier.select_language(name).await;
    }

    pub async fn select_layout(&mut self, name: &str) {
        self.layout = Some(name.to_string());
        self.verifier.select_layout(name).await;
    }

    pub async fn select_user(&mut self, name: &str) {
        self.username = Some(name.to_string());
        self.verifier.select_user(name).await;
    }

    /// Greeter signalled whether the session may start as soon as it is ready
    pub async fn set_start_when_ready(&mut self, ready: bool) -> Vec<PipelineAction> {
        self.start_when_ready = ready;
        if ready && self.waiting_to_start {
            self.waiting_to_start = false;
            self.accredit_when_ready().await
        } else {
            vec![]
        }
    }

    /// Consume the queued-start slot; true at most once per open
    pub fn take_queued_start(&mut self) -> bool {
        std::mem::take(&mut self.pending_start)
    }

    /// Launch the user session with its finalized authority file
    pub async fn start(&mut self, authority_file: Option<PathBuf>) {
        self.stage = PipelineStage::Start;
        let resources = SessionResources {
            authority_file,
            session_type: self.selected_session.clone(),
            language: self.language.clone(),
            layout: self.layout.clone(),
            display_name: self.display_name.clone(),
        };
        self.verifier.start_session(&resources).await;
    }

    /// Unwind in-flight verification; the owner discards this pipeline next
    pub async fn cancel(&mut self) {
        debug!(display = %self.display_name, stage = ?self.stage, "cancelling pipeline");
        self.verifier.cancel().await;
    }

    fn fail(&mut self, stage: PipelineStage, message: String) -> Vec<PipelineAction> {
        let message = if message.is_empty() {
            stage.failure_message().to_string()
        } else {
            message
        };
        warn!(display = %self.display_name, ?stage, message, "credential step failed");
        vec![PipelineAction::Failed { stage, message }]
    }

    /// Accredit now, or latch until the greeter says "start now"
    async fn accredit_when_ready(&mut self) -> Vec<PipelineAction> {
        if !self.start_when_ready {
            self.waiting_to_start = true;
            return vec![];
        }
        if self.try_migrate().await {
            info!(display = %self.display_name, "migrated to existing session");
            return vec![PipelineAction::Migrated];
        }
        self.stage = PipelineStage::Accredit;
        self.verifier.accredit(self.accredit_flag).await;
        vec![]
    }

    /// Try to switch to an existing session for this user on our seat
    ///
    /// Successful only when activate and unlock both succeed.
    async fn try_migrate(&self) -> bool {
        let Some(username) = &self.username else {
            return false;
        };
        let Some(uid) = (self.uid_resolver)(username) else {
            debug!(username, "no uid, skipping migration probe");
            return false;
        };

        let sessions = match self.seat_manager.sessions_for_user(uid).await {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!(error = %e, "session lookup failed, not migrating");
                return false;
            }
        };

        for session_id in sessions {
            match self.seat_manager.session_seat(&session_id).await {
                Ok(seat) if seat == self.seat_id => {
                    info!(username, session = %session_id, seat = %self.seat_id,
                          "existing session found, migrating");
                    let activated = self
                        .seat_manager
                        .activate_session(&self.seat_id, &session_id)
                        .await;
                    if let Err(e) = activated {
                        warn!(error = %e, "session activation failed");
                        return false;
                    }
                    if let Err(e) = self.seat_manager.unlock_session(&session_id).await {
                        warn!(error = %e, "session unlock failed");
                        return false;
                    }
                    return true;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, session = %session_id, "seat lookup failed");
                    continue;
                }
            }
        }
        false
    }

    fn queue_start(&mut self) -> Vec<PipelineAction> {
        if self.pending_start {
            // Coalesce: one queued start regardless of how often open fires
            return vec![];
        }
        self.pending_start = true;
        vec![PipelineAction::QueuedStart]
    }
}
