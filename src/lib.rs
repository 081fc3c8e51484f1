//! # ldm
//!
//! Display manager session orchestrator: supervises login displays,
//! greeters and user session startup on Linux seats.
//!
//! # Architecture
//!
//! ```text
//! ldmd
//!   └─> DisplayRegistry (identity, status, flap guard)
//!         └─> SlaveSupervisor (one task per display)
//!               ├─> DisplayServer   (X server child + ready signal)
//!               ├─> GreeterChannel  (framed JSON over a Unix socket)
//!               ├─> SessionPipeline (setup → auth → authz → accredit
//!               │                    → open → start, discard on failure)
//!               │     ├─> CredentialVerifier (PAM conversation)
//!               │     └─> SeatManager        (logind: migrate/activate/unlock)
//!               └─> AuthoritySession (MIT-MAGIC-COOKIE-1 access control)
//! ```
//!
//! # Login flow
//!
//! The slave brings up the display server, authorizes it through an
//! exclusive 0600 authority file, launches the greeter and runs one
//! [`session::pipeline::SessionPipeline`] per login attempt. Failed
//! attempts are discarded wholesale and the greeter is reset; successful
//! attempts either migrate to the user's existing session on the seat or
//! start a fresh one under the established credentials.

#![warn(clippy::all)]

/// Display access control (xauth cookie files)
pub mod authority;

/// Configuration loading, validation and the flat settings facade
pub mod config;

/// Greeter relay and wire protocol
pub mod greeter;

/// Display registry and lifecycle policy
pub mod registry;

/// Seat and session management (logind)
pub mod seat;

/// Display server supervision
pub mod server;

/// Login session pipeline and login policy
pub mod session;

/// Per-display slave supervision
pub mod slave;

/// Child process supervision primitives
pub mod supervisor;

/// Credential verification contract and PAM backend
pub mod verify;

pub use config::Config;
pub use registry::{DisplayInfo, DisplayLocation, DisplayRegistry, DisplayStatus};
pub use slave::{SlaveEvent, SlaveKind};
