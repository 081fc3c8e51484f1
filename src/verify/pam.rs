//! PAM-backed credential verifier
//!
//! Runs the blocking PAM conversation on a dedicated thread per login
//! attempt; the async trait methods only post commands to that thread and
//! results come back as [`VerifierEvent`]s. The thread owns the PAM handle
//! for the whole conversation, so the session stays open for as long as the
//! user session runs.

use super::{AccreditFlag, CredentialVerifier, SessionResources, VerifierEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum PamRequest {
    Authenticate,
    Authorize,
    Accredit,
    OpenSession,
    StartSession(SessionResources),
    Cancel,
}

struct Conversation {
    username: Option<String>,
    password: Option<String>,
    requests: Option<std_mpsc::Sender<PamRequest>>,
    awaiting_password: bool,
}

/// Credential verifier backed by libpam
pub struct PamVerifier {
    events: mpsc::UnboundedSender<VerifierEvent>,
    session_command: PathBuf,
    state: Mutex<Conversation>,
}

impl PamVerifier {
    /// `session_command` is the script exec'd as the user session
    /// (an Xsession wrapper in a stock install).
    pub fn new(
        events: mpsc::UnboundedSender<VerifierEvent>,
        session_command: impl Into<PathBuf>,
    ) -> Self {
        Self {
            events,
            session_command: session_command.into(),
            state: Mutex::new(Conversation {
                username: None,
                password: None,
                requests: None,
                awaiting_password: false,
            }),
        }
    }

    fn send(&self, event: VerifierEvent) {
        let _ = self.events.send(event);
    }

    fn post(&self, request: PamRequest) {
        let state = self.state.lock();
        if let Some(tx) = &state.requests {
            let _ = tx.send(request);
        }
    }

    fn spawn_conversation(&self, service: &str) {
        let (req_tx, req_rx) = std_mpsc::channel();
        self.state.lock().requests = Some(req_tx);

        let service = service.to_string();
        let events = self.events.clone();
        let session_command = self.session_command.clone();
        let credentials = self.credentials_snapshot();

        std::thread::Builder::new()
            .name("pam-conversation".to_string())
            .spawn(move || {
                conversation_thread(service, credentials, req_rx, events, session_command);
            })
            .map(|_| ())
            .unwrap_or_else(|e| warn!(error = %e, "could not spawn PAM thread"));
    }

    fn credentials_snapshot(&self) -> (Option<String>, Option<String>) {
        let state = self.state.lock();
        (state.username.clone(), state.password.clone())
    }
}

#[async_trait]
impl CredentialVerifier for PamVerifier {
    async fn setup(&self, service: &str) {
        debug!(service, "PAM setup (generic)");
        self.spawn_conversation(service);
        self.send(VerifierEvent::SetupComplete);
    }

    async fn setup_for_user(&self, service: &str, username: &str) {
        debug!(service, username, "PAM setup for user");
        self.state.lock().username = Some(username.to_string());
        self.spawn_conversation(service);
        self.send(VerifierEvent::SetupComplete);
    }

    async fn authenticate(&self) {
        let (username, password) = self.credentials_snapshot();
        if username.is_none() {
            self.send(VerifierEvent::InfoQuery("Username:".to_string()));
            return;
        }
        if password.is_none() {
            self.state.lock().awaiting_password = true;
            self.send(VerifierEvent::SecretInfoQuery("Password:".to_string()));
            return;
        }
        self.post(PamRequest::Authenticate);
    }

    async fn authorize(&self) {
        self.post(PamRequest::Authorize);
    }

    async fn accredit(&self, _flag: AccreditFlag) {
        // pam(3) setcred runs inside session open with the pam crate;
        // the accredit step only validates that the handle is still alive.
        self.post(PamRequest::Accredit);
    }

    async fn open_session(&self) {
        self.post(PamRequest::OpenSession);
    }

    async fn start_session(&self, resources: &SessionResources) {
        self.post(PamRequest::StartSession(resources.clone()));
    }

    async fn answer_query(&self, text: &str) {
        let mut state = self.state.lock();
        if state.username.is_none() && !state.awaiting_password {
            state.username = Some(text.to_string());
            drop(state);
            self.send(VerifierEvent::UsernameChanged(text.to_string()));
            self.send(VerifierEvent::SecretInfoQuery("Password:".to_string()));
            self.state.lock().awaiting_password = true;
            return;
        }
        state.password = Some(text.to_string());
        state.awaiting_password = false;
        drop(state);
        self.post(PamRequest::Authenticate);
    }

    async fn select_session(&self, _name: &str) {}

    async fn select_language(&self, _name: &str) {}

    async fn select_layout(&self, _name: &str) {}

    async fn select_user(&self, name: &str) {
        self.state.lock().username = Some(name.to_string());
        self.send(VerifierEvent::UsernameChanged(name.to_string()));
    }

    async fn cancel(&self) {
        self.post(PamRequest::Cancel);
        let mut state = self.state.lock();
        state.username = None;
        state.password = None;
        state.requests = None;
        state.awaiting_password = false;
    }
}

/// Owns the PAM handle for one conversation, start to finish
fn conversation_thread(
    service: String,
    mut credentials: (Option<String>, Option<String>),
    requests: std_mpsc::Receiver<PamRequest>,
    events: mpsc::UnboundedSender<VerifierEvent>,
    session_command: PathBuf,
) {
    let mut authenticator = match pam::Authenticator::with_password(&service) {
        Ok(a) => a,
        Err(e) => {
            let _ = events.send(VerifierEvent::SetupFailed(e.to_string()));
            return;
        }
    };
    let mut authenticated = false;

    while let Ok(request) = requests.recv() {
        match request {
            PamRequest::Authenticate => {
                let (Some(user), Some(pass)) = (credentials.0.clone(), credentials.1.clone())
                else {
                    let _ = events.send(VerifierEvent::AuthenticationFailed(
                        "credentials incomplete".to_string(),
                    ));
                    continue;
                };
                authenticator.get_handler().set_credentials(&user, &pass);
                // Discard the password as soon as PAM has it
                credentials.1 = None;
                match authenticator.authenticate() {
                    Ok(()) => {
                        authenticated = true;
                        let _ = events.send(VerifierEvent::Authenticated);
                    }
                    Err(e) => {
                        let _ = events.send(VerifierEvent::AuthenticationFailed(e.to_string()));
                        return;
                    }
                }
            }
            PamRequest::Authorize => {
                // Account validity is checked by pam_acct_mgmt during
                // authenticate() in this PAM binding.
                if authenticated {
                    let _ = events.send(VerifierEvent::Authorized);
                } else {
                    let _ = events.send(VerifierEvent::AuthorizationFailed(
                        "not authenticated".to_string(),
                    ));
                }
            }
            PamRequest::Accredit => {
                if authenticated {
                    let _ = events.send(VerifierEvent::Accredited);
                } else {
                    let _ = events.send(VerifierEvent::AccreditationFailed(
                        "not authenticated".to_string(),
                    ));
                }
            }
            PamRequest::OpenSession => match authenticator.open_session() {
                Ok(()) => {
                    let _ = events.send(VerifierEvent::SessionOpened);
                }
                Err(e) => {
                    let _ = events.send(VerifierEvent::SessionOpenFailed(e.to_string()));
                    return;
                }
            },
            PamRequest::StartSession(resources) => {
                run_user_session(
                    credentials.0.as_deref().unwrap_or_default(),
                    &session_command,
                    &resources,
                    &events,
                );
                return;
            }
            PamRequest::Cancel => {
                info!(service, "PAM conversation cancelled");
                return;
            }
        }
    }
}

/// Launch the user session process and block until it terminates
fn run_user_session(
    username: &str,
    session_command: &PathBuf,
    resources: &SessionResources,
    events: &mpsc::UnboundedSender<VerifierEvent>,
) {
    use std::os::unix::process::{CommandExt, ExitStatusExt};

    let user = match nix::unistd::User::from_name(username) {
        Ok(Some(user)) => user,
        _ => {
            let _ = events.send(VerifierEvent::SessionOpenFailed(format!(
                "unknown user {username}"
            )));
            return;
        }
    };

    let mut command = std::process::Command::new(session_command);
    command
        .env_clear()
        .env("USER", &user.name)
        .env("LOGNAME", &user.name)
        .env("HOME", &user.dir)
        .env("SHELL", &user.shell)
        .env("DISPLAY", &resources.display_name)
        .current_dir(&user.dir)
        .uid(user.uid.as_raw())
        .gid(user.gid.as_raw());
    if let Some(authority) = &resources.authority_file {
        command.env("XAUTHORITY", authority);
    }
    if let Some(language) = &resources.language {
        command.env("LANG", language);
    }
    if let Some(session_type) = &resources.session_type {
        command.env("LDM_SESSION", session_type);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = events.send(VerifierEvent::SessionOpenFailed(e.to_string()));
            return;
        }
    };

    let _ = events.send(VerifierEvent::SessionStarted(child.id()));

    match child.wait() {
        Ok(status) => match status.code() {
            Some(code) => {
                let _ = events.send(VerifierEvent::SessionExited(code));
            }
            None => {
                let _ = events.send(VerifierEvent::SessionDied(status.signal().unwrap_or(0)));
            }
        },
        Err(e) => {
            warn!(error = %e, "wait on user session failed");
            let _ = events.send(VerifierEvent::SessionExited(-1));
        }
    }
}
