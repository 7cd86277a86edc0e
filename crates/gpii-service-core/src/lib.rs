//! # gpii-service-core
//!
//! Core library for the GPII Windows service: a privileged supervisor that
//! launches, monitors, restarts, and communicates with the per-user GPII
//! helper process inside the interactive console session.
//!
//! Services run in a non-interactive session, so every interesting problem
//! here is about crossing the service-to-user boundary safely:
//!
//! - **Session/token management**: resolve the active console session and
//!   acquire a duplicatable primary token for its user ([`token`]).
//! - **Cross-session launch**: spawn a child under that token with an
//!   inherited handle for a private IPC endpoint ([`launcher`]).
//! - **Authenticated local IPC**: a private named pipe (or loopback TCP
//!   fallback) carrying length-prefixed JSON frames ([`transport`],
//!   [`protocol`]).
//! - **Supervision**: a state machine reacting to service lifecycle events
//!   and child termination with a throttled restart policy ([`supervisor`]).
//!
//! Components are wired through the in-process event bus ([`bus`]); none of
//! them reach into each other through globals.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gpii_service_core::bus::EventBus;
//! use gpii_service_core::supervisor::{RestartPolicy, Supervisor};
//! use gpii_service_core::HostRole;
//!
//! # fn launcher() -> Arc<dyn gpii_service_core::launcher::ChildLauncher> { unimplemented!() }
//! let bus = EventBus::new();
//! let supervisor = Supervisor::new(
//!     bus.clone(),
//!     launcher(),
//!     HostRole::ForegroundUser,
//!     String::new(),
//!     RestartPolicy::default(),
//! );
//! # drop(supervisor);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod env;
pub mod launcher;
pub mod os;
pub mod pidfile;
pub mod protocol;
pub mod supervisor;
#[cfg(windows)]
pub mod token;
pub mod transport;

/// Product folder name used under `%ProgramData%` and `%APPDATA%`.
pub const PRODUCT: &str = "gpii";

/// How the host process was started.
///
/// Replaces any "is a service" global: the role is decided once in `main`
/// and handed to the components that need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    /// Running in the foreground as the logged-on user (development mode).
    ForegroundUser,
    /// Running as a Windows service under LocalSystem.
    WindowsService,
}

impl HostRole {
    /// Returns `true` when the host is a Windows service.
    #[must_use]
    pub const fn is_service(self) -> bool {
        matches!(self, Self::WindowsService)
    }
}

pub use bus::{Event, EventBus};
pub use launcher::{ChildHandle, ChildLauncher, SpawnError, SpawnOptions, Transport};
pub use os::Win32Error;
pub use protocol::Message;
pub use supervisor::{RestartPolicy, Supervisor, SupervisorStatus};
