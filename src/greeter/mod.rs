//! Greeter relay
//!
//! [`GreeterChannel`] is the bidirectional message relay between the slave
//! and the greeter UI process: commands out ([`GreeterCommand`]), user input
//! back in ([`GreeterInput`]). Exactly one greeter may hold the channel at a
//! time; a late or duplicate connection attempt is ignored (first writer
//! wins) so one display never has two UIs fighting over it.
//!
//! Disconnection is not a failure at this layer. It is surfaced to the
//! owning slave as [`GreeterInput::Disconnected`] and the slave decides
//! policy based on pipeline state.
//!
//! The wire transport is length-delimited JSON frames on a Unix socket
//! ([`serve_unix`]); tests attach directly with [`GreeterChannel::connect`].

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Result type for greeter channel operations
pub type Result<T> = std::result::Result<T, GreeterError>;

/// Greeter channel error types
#[derive(Error, Debug)]
pub enum GreeterError {
    /// Control socket could not be bound
    #[error("failed to bind greeter socket {path}: {source}")]
    Bind {
        path: String,
        source: std::io::Error,
    },

    /// Frame could not be encoded or decoded
    #[error("greeter wire protocol error: {0}")]
    Wire(#[from] serde_json::Error),

    /// Socket I/O failed
    #[error("greeter socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Commands sent from the orchestrator to the greeter UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum GreeterCommand {
    Info(String),
    Problem(String),
    InfoQuery(String),
    SecretInfoQuery(String),
    Ready,
    Reset,
    AuthenticationFailed,
    SelectedUserChanged(String),
    TimedLoginRequested { username: String, delay: i64 },
    UserAuthorized,
    DefaultLanguageChanged(String),
    DefaultLayoutChanged(String),
    DefaultSessionChanged(String),
}

/// Input events sent from the greeter UI to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum GreeterInput {
    Connected,
    Disconnected,
    BeginVerification,
    BeginVerificationForUser(String),
    BeginAutoLogin(String),
    AnswerQuery(String),
    SelectSession(String),
    SelectLanguage(String),
    SelectLayout(String),
    SelectUser(String),
    Cancel,
    StartSessionWhenReady(bool),
}

/// Greeter-side endpoints handed out by a successful connect
pub struct GreeterConnection {
    /// Commands for the greeter to render
    pub commands: mpsc::UnboundedReceiver<GreeterCommand>,

    /// Input events back to the orchestrator
    pub inputs: mpsc::UnboundedSender<GreeterInput>,
}

struct Inner {
    outbound: Option<mpsc::UnboundedSender<GreeterCommand>>,
}

/// Orchestrator side of the greeter relay
pub struct GreeterChannel {
    inner: Mutex<Inner>,
    inputs_tx: mpsc::UnboundedSender<GreeterInput>,
}

impl GreeterChannel {
    /// Create a channel plus the input stream consumed by the owning slave
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<GreeterInput>) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inner: Mutex::new(Inner { outbound: None }),
                inputs_tx,
            }),
            inputs_rx,
        )
    }

    /// Attach a greeter; returns `None` if one is already connected
    pub fn connect(&self) -> Option<GreeterConnection> {
        let mut inner = self.inner.lock();
        if inner.outbound.is_some() {
            warn!("duplicate greeter connection ignored");
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.outbound = Some(tx);
        drop(inner);

        debug!("greeter connected");
        let _ = self.inputs_tx.send(GreeterInput::Connected);
        Some(GreeterConnection {
            commands: rx,
            inputs: self.inputs_tx.clone(),
        })
    }

    /// Whether a greeter currently holds the channel
    pub fn is_connected(&self) -> bool {
        self.inner.lock().outbound.is_some()
    }

    /// Drop the connection and surface `Disconnected` to the slave
    pub fn mark_disconnected(&self) {
        let mut inner = self.inner.lock();
        if inner.outbound.take().is_some() {
            drop(inner);
            debug!("greeter disconnected");
            let _ = self.inputs_tx.send(GreeterInput::Disconnected);
        }
    }

    fn send(&self, command: GreeterCommand) {
        let tx = self.inner.lock().outbound.clone();
        match tx {
            Some(tx) => {
                if tx.send(command).is_err() {
                    self.mark_disconnected();
                }
            }
            None => debug!(?command, "no greeter connected, command dropped"),
        }
    }

    pub fn info(&self, text: &str) {
        self.send(GreeterCommand::Info(text.to_string()));
    }

    pub fn problem(&self, text: &str) {
        self.send(GreeterCommand::Problem(text.to_string()));
    }

    pub fn info_query(&self, text: &str) {
        self.send(GreeterCommand::InfoQuery(text.to_string()));
    }

    pub fn secret_info_query(&self, text: &str) {
        self.send(GreeterCommand::SecretInfoQuery(text.to_string()));
    }

    pub fn ready(&self) {
        self.send(GreeterCommand::Ready);
    }

    pub fn reset(&self) {
        self.send(GreeterCommand::Reset);
    }

    pub fn authentication_failed(&self) {
        self.send(GreeterCommand::AuthenticationFailed);
    }

    pub fn selected_user_changed(&self, username: &str) {
        self.send(GreeterCommand::SelectedUserChanged(username.to_string()));
    }

    pub fn request_timed_login(&self, username: &str, delay: i64) {
        self.send(GreeterCommand::TimedLoginRequested {
            username: username.to_string(),
            delay,
        });
    }

    pub fn user_authorized(&self) {
        self.send(GreeterCommand::UserAuthorized);
    }

    pub fn default_language_changed(&self, name: &str) {
        self.send(GreeterCommand::DefaultLanguageChanged(name.to_string()));
    }

    pub fn default_layout_changed(&self, name: &str) {
        self.send(GreeterCommand::DefaultLayoutChanged(name.to_string()));
    }

    pub fn default_session_changed(&self, name: &str) {
        self.send(GreeterCommand::DefaultSessionChanged(name.to_string()));
    }
}

/// Bind the per-display greeter control socket
pub fn bind_socket(path: &std::path::Path) -> Result<UnixListener> {
    // Stale socket from a previous run
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).map_err(|source| GreeterError::Bind {
        path: path.display().to_string(),
        source,
    })
}

/// Accept greeter connections and bridge them onto `channel`
///
/// Runs until the listener errors. Duplicate connections are accepted at
/// the socket level but never get the channel; their frames are discarded
/// when the connection closes.
pub async fn serve_unix(channel: Arc<GreeterChannel>, listener: UnixListener) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        match channel.connect() {
            Some(connection) => {
                let channel = channel.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_connection(stream, connection).await {
                        debug!(error = %e, "greeter connection ended with error");
                    }
                    channel.mark_disconnected();
                });
            }
            None => {
                info!("rejecting duplicate greeter connection");
                drop(stream);
            }
        }
    }
}

async fn run_connection(stream: UnixStream, mut connection: GreeterConnection) -> Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    loop {
        tokio::select! {
            command = connection.commands.recv() => {
                let Some(command) = command else {
                    // Orchestrator side dropped; close the socket
                    return Ok(());
                };
                let frame = serde_json::to_vec(&command)?;
                framed.send(Bytes::from(frame)).await?;
            }
            frame = framed.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let input: GreeterInput = serde_json::from_slice(&frame?)?;
                if connection.inputs.send(input).is_err() {
                    return Ok(());
                }
            }
        }
    }
}
