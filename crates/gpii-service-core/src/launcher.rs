//! Cross-session child launch.
//!
//! The launcher owns the whole spawn transaction: acquire a token, build
//! the environment, open a private endpoint, create the process with the
//! endpoint's client handle inherited, and hand back a [`ChildHandle`] the
//! supervisor can wait on. Handles move: the client end is the child's the
//! moment create-process returns, and the parent's copies are closed on
//! every exit path, success or failure.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::os::Win32Error;
use crate::transport::{ServerEndpoint, TransportError};

/// Entry script appended when the caller passes an empty command.
pub const DEFAULT_CHILD_ENTRY: &str = "gpii.js";

/// Placeholder in the command line that is replaced with the endpoint name
/// (pipe path, or port for the TCP fallback) so the child can also connect
/// by name.
pub const PIPE_PLACEHOLDER: &str = "<pipe>";

/// Which transport the endpoint uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Private named pipe with an inherited client handle (canonical).
    #[default]
    Pipe,
    /// Loopback TCP with accept-time peer authentication (fallback).
    Tcp,
}

/// Options for [`ChildLauncher::spawn_child`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Spawn under the current process's own token when no interactive user
    /// token is available. Only safe when the host is not a service; a
    /// service falling back this way would run the child as LocalSystem.
    pub always_run: bool,

    /// Extra variables merged into the user's environment.
    pub env: Vec<(String, String)>,

    /// Working directory for the child.
    pub current_dir: Option<PathBuf>,

    /// Endpoint transport.
    pub transport: Transport,
}

/// A successfully spawned child.
///
/// Owns the server side of the endpoint and a receiver that fires when the
/// process handle signals. Dropping a `ChildHandle` does not terminate the
/// child.
#[derive(Debug)]
pub struct ChildHandle {
    /// OS process id.
    pub pid: u32,

    /// Wall-clock spawn time.
    pub started_at: DateTime<Utc>,

    /// Server side of the private endpoint.
    pub endpoint: ServerEndpoint,

    /// Fires with the exit code when the process terminates. The underlying
    /// waiter cannot be cancelled; after a stop it is simply ignored.
    pub exited: oneshot::Receiver<u32>,
}

/// Errors from a spawn attempt.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// Nobody is logged on and the caller did not ask for the fallback.
    /// Expected at the lock screen; logged as info, not an error.
    #[error("no interactive user")]
    NoInteractiveUser,

    /// Create-process-as-user itself failed.
    #[error("child process could not be started: {0}")]
    ChildStartFailed(Win32Error),

    /// Some other native call in the spawn transaction failed.
    #[error(transparent)]
    System(#[from] Win32Error),

    /// The endpoint could not be created.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The spawn worker was torn down mid-flight.
    #[error("spawn task failed: {0}")]
    Worker(String),
}

/// The seam between the supervisor and the platform.
///
/// The production implementation is [`WindowsLauncher`]; tests inject fakes
/// driving in-memory streams.
#[async_trait]
pub trait ChildLauncher: Send + Sync {
    /// Whether an interactive user is currently logged on.
    fn is_user_logged_on(&self) -> bool;

    /// Spawn the user process and open a private endpoint to it.
    async fn spawn_child(
        &self,
        command: &str,
        opts: SpawnOptions,
    ) -> Result<ChildHandle, SpawnError>;

    /// Best-effort kill by pid.
    fn kill(&self, pid: u32);

    /// Liveness probe for an arbitrary pid.
    fn process_alive(&self, pid: u32) -> bool;

    /// The console user's data directory, when one can be resolved.
    fn user_data_dir(&self) -> Option<PathBuf>;
}

/// Resolve the effective command line: an empty command becomes the host
/// executable plus the default entry.
#[cfg_attr(not(windows), allow(dead_code))]
fn effective_command(command: &str, host_exe: &std::path::Path) -> String {
    if command.trim().is_empty() {
        format!("\"{}\" {DEFAULT_CHILD_ENTRY}", host_exe.display())
    } else {
        command.to_string()
    }
}

#[cfg(windows)]
pub use windows::WindowsLauncher;

#[cfg(windows)]
mod windows {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::oneshot;
    use tracing::{debug, info, warn};

    use super::{
        effective_command, ChildHandle, ChildLauncher, SpawnError, SpawnOptions, Transport,
        PIPE_PLACEHOLDER,
    };
    use crate::os::process;
    use crate::token::SessionTokens;
    use crate::transport::name::generate_pipe_name;
    use crate::transport::pipe::PipeEndpoint;
    use crate::transport::tcp::TcpEndpoint;
    use crate::transport::ServerEndpoint;
    use crate::PRODUCT;

    /// Launcher backed by the real session, token, and process APIs.
    #[derive(Debug, Clone, Copy)]
    pub struct WindowsLauncher {
        tokens: SessionTokens,
    }

    impl WindowsLauncher {
        /// Create a launcher resolving tokens through `tokens`.
        #[must_use]
        pub const fn new(tokens: SessionTokens) -> Self {
            Self { tokens }
        }
    }

    #[async_trait]
    impl ChildLauncher for WindowsLauncher {
        fn is_user_logged_on(&self) -> bool {
            self.tokens.is_user_logged_on()
        }

        async fn spawn_child(
            &self,
            command: &str,
            opts: SpawnOptions,
        ) -> Result<ChildHandle, SpawnError> {
            // 1. Token. The sentinel is only acceptable with always_run, in
            //    which case the null token spawns as the current user.
            let token = self.tokens.current_user_token()?;
            if token.is_none() {
                if !opts.always_run {
                    return Err(SpawnError::NoInteractiveUser);
                }
                debug!("no interactive user; spawning under the current token");
            }

            // 2. Environment block, caller overrides merged in.
            let env = self.tokens.environment_for(&token)?;
            let overrides: Vec<(&str, &str)> = opts
                .env
                .iter()
                .map(|(n, v)| (n.as_str(), v.as_str()))
                .collect();
            let env_block = env.merged(overrides).to_wide_block();

            // 3. Command line, endpoint name substituted in.
            let host_exe = std::env::current_exe()
                .map_err(|e| SpawnError::Worker(e.to_string()))?;
            let command = effective_command(command, &host_exe);

            // 4. Endpoint. The pipe client handle is the one handle the
            //    child inherits; the TCP fallback hands over a port instead.
            let (endpoint, command, client) = match opts.transport {
                Transport::Pipe => {
                    let name = generate_pipe_name(PRODUCT);
                    let pipe = PipeEndpoint::create(&name).await?;
                    let command = command.replace(PIPE_PLACEHOLDER, &name);
                    (
                        ServerEndpoint::Ready(Box::new(pipe.server)),
                        command,
                        Some(pipe.client),
                    )
                }
                Transport::Tcp => {
                    let tcp = TcpEndpoint::bind().await?;
                    let command = command.replace(PIPE_PLACEHOLDER, &tcp.port().to_string());
                    (ServerEndpoint::Tcp(tcp), command, None)
                }
            };

            // 5-7. Create the process on a worker thread. The token and the
            //    inheritable client handle move into the closure and are
            //    closed there on every exit path; the child owns its copies.
            let current_dir = opts
                .current_dir
                .as_ref()
                .map(|dir| dir.display().to_string());
            let spawned = tokio::task::spawn_blocking(move || {
                let inherit: Vec<&crate::os::handle::OwnedHandle> =
                    client.as_ref().into_iter().collect();
                process::spawn_as_user(
                    token.raw(),
                    &command,
                    &env_block,
                    current_dir.as_deref(),
                    &inherit,
                )
            })
            .await
            .map_err(|e| SpawnError::Worker(e.to_string()))?
            .map_err(SpawnError::ChildStartFailed)?;

            let pid = spawned.pid;
            info!(pid, "user process started");

            // Termination waiter: the process handle moves in here and is
            // closed when the wait resolves.
            let (exit_tx, exited) = oneshot::channel();
            tokio::task::spawn_blocking(move || {
                let code = match process::wait_for_exit(&spawned.process) {
                    Ok(code) => code,
                    Err(err) => {
                        warn!(pid, %err, "termination wait failed");
                        u32::MAX
                    }
                };
                let _ = exit_tx.send(code);
            });

            Ok(ChildHandle {
                pid,
                started_at: Utc::now(),
                endpoint,
                exited,
            })
        }

        fn kill(&self, pid: u32) {
            if let Err(err) = process::kill(pid) {
                debug!(pid, %err, "kill failed");
            }
        }

        fn process_alive(&self, pid: u32) -> bool {
            process::process_alive(pid)
        }

        fn user_data_dir(&self) -> Option<PathBuf> {
            let token = self.tokens.current_user_token().ok()?;
            if token.is_none() {
                return None;
            }
            self.tokens.user_data_dir(&token).ok()
        }
    }
}
