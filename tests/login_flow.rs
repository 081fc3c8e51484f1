//! End-to-end login flow tests
//!
//! Each test runs a real display registry and slave with stub server and
//! greeter binaries, then attaches to the greeter control socket and
//! drives the login conversation over the wire the way the greeter UI
//! would.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ldm::config::Config;
use ldm::greeter::{GreeterCommand, GreeterInput};
use ldm::registry::{DisplayInfo, DisplayLocation, DisplayRegistry, DisplayStatus, ManageDeps};
use ldm::seat::{DeviceResolver, SeatError, SeatManager};
use ldm::session::pipeline::PipelineStage;
use ldm::slave::SlaveKind;
use ldm::verify::{
    AccreditFlag, CredentialVerifier, SessionResources, VerifierEvent, VerifierFactory,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Verifier that walks the happy path on its own, failing at one
/// scripted stage if configured.
struct ScriptedVerifier {
    events: mpsc::UnboundedSender<VerifierEvent>,
    fail_at: Option<(PipelineStage, String)>,
}

impl ScriptedVerifier {
    fn emit(&self, event: VerifierEvent) {
        let _ = self.events.send(event);
    }

    fn fails_at(&self, stage: PipelineStage) -> Option<String> {
        self.fail_at
            .as_ref()
            .filter(|(s, _)| *s == stage)
            .map(|(_, m)| m.clone())
    }
}

#[async_trait]
impl CredentialVerifier for ScriptedVerifier {
    async fn setup(&self, _service: &str) {
        match self.fails_at(PipelineStage::Setup) {
            Some(m) => self.emit(VerifierEvent::SetupFailed(m)),
            None => self.emit(VerifierEvent::SetupComplete),
        }
    }
    async fn setup_for_user(&self, service: &str, _username: &str) {
        self.setup(service).await;
    }
    async fn authenticate(&self) {
        match self.fails_at(PipelineStage::Authenticate) {
            Some(m) => self.emit(VerifierEvent::AuthenticationFailed(m)),
            None => self.emit(VerifierEvent::Authenticated),
        }
    }
    async fn authorize(&self) {
        match self.fails_at(PipelineStage::Authorize) {
            Some(m) => self.emit(VerifierEvent::AuthorizationFailed(m)),
            None => self.emit(VerifierEvent::Authorized),
        }
    }
    async fn accredit(&self, _flag: AccreditFlag) {
        match self.fails_at(PipelineStage::Accredit) {
            Some(m) => self.emit(VerifierEvent::AccreditationFailed(m)),
            None => self.emit(VerifierEvent::Accredited),
        }
    }
    async fn open_session(&self) {
        match self.fails_at(PipelineStage::Open) {
            Some(m) => self.emit(VerifierEvent::SessionOpenFailed(m)),
            None => self.emit(VerifierEvent::SessionOpened),
        }
    }
    async fn start_session(&self, _resources: &SessionResources) {
        self.emit(VerifierEvent::SessionStarted(4242));
    }
    async fn answer_query(&self, _text: &str) {}
    async fn select_session(&self, _name: &str) {}
    async fn select_language(&self, _name: &str) {}
    async fn select_layout(&self, _name: &str) {}
    async fn select_user(&self, _name: &str) {}
    async fn cancel(&self) {}
}

struct ScriptedFactory {
    fail_at: Option<(PipelineStage, String)>,
}

impl VerifierFactory for ScriptedFactory {
    fn create(&self, events: mpsc::UnboundedSender<VerifierEvent>) -> Arc<dyn CredentialVerifier> {
        Arc::new(ScriptedVerifier {
            events,
            fail_at: self.fail_at.clone(),
        })
    }
}

/// Seat manager with a single scripted session for alice on seat0
struct AliceOnSeat0;

#[async_trait]
impl SeatManager for AliceOnSeat0 {
    async fn sessions_for_user(&self, uid: u32) -> ldm::seat::Result<Vec<String>> {
        if uid == 1000 {
            Ok(vec!["session-9".to_string()])
        } else {
            Ok(vec![])
        }
    }
    async fn session_seat(&self, _id: &str) -> ldm::seat::Result<String> {
        Ok("seat0".to_string())
    }
    async fn activate_session(&self, _seat: &str, _id: &str) -> ldm::seat::Result<()> {
        Ok(())
    }
    async fn unlock_session(&self, _id: &str) -> ldm::seat::Result<()> {
        Ok(())
    }
}

struct NoSessions;

#[async_trait]
impl SeatManager for NoSessions {
    async fn sessions_for_user(&self, _uid: u32) -> ldm::seat::Result<Vec<String>> {
        Ok(vec![])
    }
    async fn session_seat(&self, id: &str) -> ldm::seat::Result<String> {
        Err(SeatError::NoSuchSession(id.to_string()))
    }
    async fn activate_session(&self, _seat: &str, _id: &str) -> ldm::seat::Result<()> {
        Ok(())
    }
    async fn unlock_session(&self, _id: &str) -> ldm::seat::Result<()> {
        Ok(())
    }
}

struct NoDevice;

#[async_trait]
impl DeviceResolver for NoDevice {
    async fn device_for_display(&self, display: &str) -> ldm::seat::Result<PathBuf> {
        Err(SeatError::DeviceHelper {
            display: display.to_string(),
            reason: "test".to_string(),
        })
    }
}

/// Long-running stand-in for the X server and greeter binaries
fn stub_binary(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Stack {
    registry: Arc<DisplayRegistry>,
    display: DisplayInfo,
    config: Arc<Config>,
    _dir: tempfile::TempDir,
}

struct StackOptions {
    display_number: u32,
    fail_at: Option<(PipelineStage, String)>,
    seat_manager: Arc<dyn SeatManager>,
    timed_user: Option<(&'static str, i64)>,
    server_script: &'static str,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            display_number: 70,
            fail_at: None,
            seat_manager: Arc::new(NoSessions),
            timed_user: None,
            server_script: "#!/bin/sh\nexec sleep 600\n",
        }
    }
}

/// Bring up registry + slave with stub binaries and feed the ready
/// signal the way the daemon's SIGUSR1 relay would.
fn stack(options: StackOptions) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let server = stub_binary(dir.path(), "xserver", options.server_script);
    let greeter = stub_binary(dir.path(), "greeter-stub", "#!/bin/sh\nexec sleep 600\n");

    let mut config = Config::default();
    config.daemon.auth_dir = dir.path().to_path_buf();
    config.daemon.log_dir = dir.path().to_path_buf();
    config.daemon.hook_dir = dir.path().join("hooks");
    config.greeter.command = greeter;
    config.greeter.socket_dir = dir.path().join("greeter");
    config.xserver.command = server;
    config.xserver.ready_timeout_secs = 5;
    if let Some((user, delay)) = options.timed_user {
        config.timed_login.enabled = true;
        config.timed_login.user = user.to_string();
        config.timed_login.delay = delay;
    }
    let config = Arc::new(config);
    let settings = Arc::new(config.settings());

    let deps = ManageDeps {
        config: config.clone(),
        settings,
        verifier_factory: Arc::new(ScriptedFactory {
            fail_at: options.fail_at,
        }),
        seat_manager: options.seat_manager,
        device_resolver: Arc::new(NoDevice),
        uid_resolver: Arc::new(|name| match name {
            "alice" => Some(1000),
            _ => Some(1001),
        }),
        vt: 7,
    };

    let registry = Arc::new(DisplayRegistry::new());
    let display = registry.create_display(
        options.display_number,
        "seat0",
        DisplayLocation::Local,
    );
    registry.prepare_display(&display.id, dir.path()).unwrap();
    registry
        .manage_display(&display.id, SlaveKind::Simple, deps)
        .unwrap();
    registry.notify_server_ready(&display.id);

    Stack {
        registry,
        display,
        config,
        _dir: dir,
    }
}

/// Greeter-side wire client on the slave's control socket
struct GreeterClient {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl GreeterClient {
    /// Wait for the socket to appear, then connect
    async fn attach(stack: &Stack) -> Self {
        let path = stack
            .config
            .greeter
            .socket_dir
            .join(format!("display-{}.sock", stack.display.number));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if path.exists() {
                if let Ok(stream) = UnixStream::connect(&path).await {
                    return Self {
                        framed: Framed::new(stream, LengthDelimitedCodec::new()),
                    };
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "greeter socket never appeared at {}",
                path.display()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn send(&mut self, input: GreeterInput) {
        let frame = serde_json::to_vec(&input).unwrap();
        self.framed.send(Bytes::from(frame)).await.unwrap();
    }

    async fn recv(&mut self) -> GreeterCommand {
        let frame = tokio::time::timeout(Duration::from_secs(10), self.framed.next())
            .await
            .expect("timed out waiting for greeter command")
            .expect("socket closed")
            .expect("frame error");
        serde_json::from_slice(&frame).unwrap()
    }
}

async fn wait_status(stack: &Stack, wanted: DisplayStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = stack.registry.display(&stack.display.id).unwrap().status;
        if status == wanted {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "display stuck in {status:?}, wanted {wanted:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn greeter_conversation_comes_ready_in_order() {
    let stack = stack(StackOptions::default());
    let mut client = GreeterClient::attach(&stack).await;

    client.send(GreeterInput::BeginVerification).await;
    assert_eq!(client.recv().await, GreeterCommand::Ready);
    assert_eq!(
        stack.registry.display(&stack.display.id).unwrap().status,
        DisplayStatus::Managed
    );
}

#[tokio::test]
async fn interactive_login_runs_through_to_a_session() {
    let stack = stack(StackOptions {
        display_number: 71,
        ..Default::default()
    });
    let mut client = GreeterClient::attach(&stack).await;

    client
        .send(GreeterInput::BeginVerificationForUser("bob".to_string()))
        .await;
    assert_eq!(client.recv().await, GreeterCommand::Ready);
    assert_eq!(client.recv().await, GreeterCommand::UserAuthorized);

    // Credentials are held until the greeter allows the start
    client.send(GreeterInput::StartSessionWhenReady(true)).await;

    // The user-scoped authority file appears once the start executes
    let user_auth = stack
        .config
        .daemon
        .auth_dir
        .join(format!("auth-{}-user", stack.display.id));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !user_auth.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "user authority file never created"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let mode = std::fs::metadata(&user_auth).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    // The slave holds for the session; the display stays managed
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        stack.registry.display(&stack.display.id).unwrap().status,
        DisplayStatus::Managed
    );

    stack.registry.finish_display(&stack.display.id).unwrap();
    wait_status(&stack, DisplayStatus::Finished).await;
}

#[tokio::test]
async fn greeter_teardown_at_login_does_not_respawn_a_greeter() {
    let stack = stack(StackOptions {
        display_number: 76,
        ..Default::default()
    });
    let mut client = GreeterClient::attach(&stack).await;

    client
        .send(GreeterInput::BeginVerificationForUser("bob".to_string()))
        .await;
    assert_eq!(client.recv().await, GreeterCommand::Ready);
    assert_eq!(client.recv().await, GreeterCommand::UserAuthorized);
    client.send(GreeterInput::StartSessionWhenReady(true)).await;

    let user_auth = stack
        .config
        .daemon
        .auth_dir
        .join(format!("auth-{}-user", stack.display.id));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !user_auth.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "user authority file never created"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The greeter goes away as part of the login; its disconnect must
    // not bring a new greeter up over the running session.
    drop(client);
    tokio::time::sleep(Duration::from_millis(700)).await;

    let socket = stack
        .config
        .greeter
        .socket_dir
        .join(format!("display-{}.sock", stack.display.number));
    assert!(
        !socket.exists(),
        "a greeter was relaunched over the running session"
    );
    assert_eq!(
        stack.registry.display(&stack.display.id).unwrap().status,
        DisplayStatus::Managed
    );

    stack.registry.finish_display(&stack.display.id).unwrap();
    wait_status(&stack, DisplayStatus::Finished).await;
}

#[tokio::test]
async fn failed_authentication_resets_and_allows_retry() {
    let stack = stack(StackOptions {
        display_number: 72,
        fail_at: Some((PipelineStage::Authenticate, "bad password".to_string())),
        ..Default::default()
    });
    let mut client = GreeterClient::attach(&stack).await;

    client
        .send(GreeterInput::BeginVerificationForUser("bob".to_string()))
        .await;
    assert_eq!(client.recv().await, GreeterCommand::Ready);
    assert_eq!(
        client.recv().await,
        GreeterCommand::Problem("bad password".to_string())
    );
    assert_eq!(client.recv().await, GreeterCommand::AuthenticationFailed);

    // After the debounced reset a fresh conversation comes up on its own
    assert_eq!(client.recv().await, GreeterCommand::Reset);
    assert_eq!(client.recv().await, GreeterCommand::Ready);

    // A credential failure never takes the display down
    assert_eq!(
        stack.registry.display(&stack.display.id).unwrap().status,
        DisplayStatus::Managed
    );
}

#[tokio::test]
async fn fast_user_switch_migrates_instead_of_starting() {
    let stack = stack(StackOptions {
        display_number: 73,
        seat_manager: Arc::new(AliceOnSeat0),
        ..Default::default()
    });
    let mut client = GreeterClient::attach(&stack).await;

    client
        .send(GreeterInput::BeginVerificationForUser("alice".to_string()))
        .await;
    assert_eq!(client.recv().await, GreeterCommand::Ready);
    assert_eq!(client.recv().await, GreeterCommand::UserAuthorized);

    client.send(GreeterInput::StartSessionWhenReady(true)).await;

    // Migration resets the greeter instead of opening a second session
    assert_eq!(client.recv().await, GreeterCommand::Reset);
    assert_eq!(client.recv().await, GreeterCommand::Ready);

    // No user authority file: nothing was started for alice here
    let user_auth = stack
        .config
        .daemon
        .auth_dir
        .join(format!("auth-{}-user", stack.display.id));
    assert!(!user_auth.exists());

    // The display server survives the switch
    assert_eq!(
        stack.registry.display(&stack.display.id).unwrap().status,
        DisplayStatus::Managed
    );
}

#[tokio::test]
async fn timed_login_is_offered_with_the_default_delay() {
    let stack = stack(StackOptions {
        display_number: 74,
        // A non-positive delay falls back to the 10 second default
        timed_user: Some(("guest", 0)),
        ..Default::default()
    });
    let mut client = GreeterClient::attach(&stack).await;

    client.send(GreeterInput::BeginVerification).await;
    assert_eq!(client.recv().await, GreeterCommand::Ready);
    assert_eq!(
        client.recv().await,
        GreeterCommand::TimedLoginRequested {
            username: "guest".to_string(),
            delay: 10
        }
    );
}

#[tokio::test]
async fn crashing_display_server_marks_the_display_failed() {
    let stack = stack(StackOptions {
        display_number: 75,
        server_script: "#!/bin/sh\nexit 1\n",
        ..Default::default()
    });

    // Startup dies almost immediately; the flap guard records a failure
    wait_status(&stack, DisplayStatus::Failed).await;
}
