//! Private IPC endpoints between the service and the user process.
//!
//! The canonical transport is a named pipe whose *client* end the service
//! opens itself before the child ever exists, so the server never has to
//! authenticate an anonymous peer: the proof of identity is that we opened
//! the handle and handed it to exactly one child. The fallback transport is
//! loopback TCP, where the child connects by port and the accept path must
//! prove endpoint ownership through the system TCP table instead.

pub mod name;
#[cfg(windows)]
pub mod pipe;
pub mod tcp;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::os::Win32Error;

/// A duplex byte stream usable with the frame codec.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// An established connection to the user process.
pub type Connection = Box<dyn Duplex>;

/// Errors from endpoint creation and peer authentication.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Endpoint I/O failed underneath tokio.
    #[error("endpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A native call failed while creating or authenticating an endpoint.
    #[error(transparent)]
    System(#[from] Win32Error),

    /// The TCP-table ownership check refused a connection.
    #[error("peer authentication failed (remote pid {remote_pid:?})")]
    PeerAuthenticationFailed {
        /// Owning pid of the remote endpoint, when the table had one.
        remote_pid: Option<u32>,
    },

    /// The child died before its connection was established.
    #[error("child exited before connecting")]
    ChildGone,
}

/// The server side of an endpoint, waiting to become a [`Connection`].
pub enum ServerEndpoint {
    /// Already connected: the pipe path (we opened the client ourselves) or
    /// an in-memory stream in tests.
    Ready(Connection),

    /// Loopback listener that authenticates each accepted peer against the
    /// TCP table before yielding it.
    #[cfg(windows)]
    Tcp(tcp::TcpEndpoint),
}

impl ServerEndpoint {
    /// Resolve to a connected, authenticated stream for `child_pid`.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint breaks before a legitimate peer shows up;
    /// rejected peers are closed and logged, not surfaced as errors.
    pub async fn establish(self, child_pid: u32) -> Result<Connection, TransportError> {
        match self {
            Self::Ready(conn) => {
                let _ = child_pid;
                Ok(conn)
            }
            #[cfg(windows)]
            Self::Tcp(endpoint) => endpoint.accept_authenticated(child_pid).await,
        }
    }
}

impl std::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("ServerEndpoint::Ready"),
            #[cfg(windows)]
            Self::Tcp(endpoint) => write!(f, "ServerEndpoint::Tcp(port {})", endpoint.port()),
        }
    }
}
