//! Credential verification contract
//!
//! The session pipeline drives a PAM-equivalent verifier through the
//! [`CredentialVerifier`] trait and consumes its progress as
//! [`VerifierEvent`]s on a channel. Calls never block on the conversation;
//! outcomes (success, failure, queries for the user) always arrive as
//! events, so the pipeline stays a pure event-driven state machine.
//!
//! Each login attempt gets a fresh verifier from a [`VerifierFactory`]; a
//! discarded pipeline never leaks conversation state into its replacement.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[cfg(feature = "pam-auth")]
pub mod pam;

/// Credential establishment mode for the accredit step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccreditFlag {
    /// Establish fresh credentials for a new session
    #[default]
    Establish,

    /// Refresh credentials of an existing session
    Refresh,
}

/// Progress events emitted by a credential verifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierEvent {
    SetupComplete,
    SetupFailed(String),
    Authenticated,
    AuthenticationFailed(String),
    Authorized,
    AuthorizationFailed(String),
    Accredited,
    AccreditationFailed(String),
    SessionOpened,
    SessionOpenFailed(String),
    SessionStarted(u32),
    SessionExited(i32),
    SessionDied(i32),
    /// Effective username became known or changed (e.g. after PAM mapping)
    UsernameChanged(String),
    /// Informational text for the user
    Info(String),
    /// Failure text for the user
    Problem(String),
    /// Prompt for visible input (e.g. login name)
    InfoQuery(String),
    /// Prompt for hidden input (e.g. password)
    SecretInfoQuery(String),
}

/// Resources handed to the verifier when the user session starts
#[derive(Debug, Clone, Default)]
pub struct SessionResources {
    /// Per-user authority file granting access to the display
    pub authority_file: Option<PathBuf>,

    /// Selected session type (desktop file name)
    pub session_type: Option<String>,

    /// Selected language
    pub language: Option<String>,

    /// Selected keyboard layout
    pub layout: Option<String>,

    /// Display the session runs on
    pub display_name: String,
}

/// PAM-equivalent credential verification capability
///
/// All methods are fire-and-forget from the pipeline's point of view;
/// results surface as [`VerifierEvent`]s.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Begin a generic conversation (greeter chooses the user later)
    async fn setup(&self, service: &str);

    /// Begin a conversation for a known user (auto/timed login)
    async fn setup_for_user(&self, service: &str, username: &str);

    async fn authenticate(&self);

    async fn authorize(&self);

    async fn accredit(&self, flag: AccreditFlag);

    async fn open_session(&self);

    async fn start_session(&self, resources: &SessionResources);

    /// Answer an outstanding info/secret query
    async fn answer_query(&self, text: &str);

    async fn select_session(&self, name: &str);

    async fn select_language(&self, name: &str);

    async fn select_layout(&self, name: &str);

    async fn select_user(&self, name: &str);

    /// Abandon the conversation and release any in-flight verification state
    async fn cancel(&self);
}

/// Creates one verifier per login attempt
pub trait VerifierFactory: Send + Sync {
    fn create(&self, events: mpsc::UnboundedSender<VerifierEvent>) -> Arc<dyn CredentialVerifier>;
}

impl<F> VerifierFactory for F
where
    F: Fn(mpsc::UnboundedSender<VerifierEvent>) -> Arc<dyn CredentialVerifier> + Send + Sync,
{
    fn create(&self, events: mpsc::UnboundedSender<VerifierEvent>) -> Arc<dyn CredentialVerifier> {
        self(events)
    }
}
