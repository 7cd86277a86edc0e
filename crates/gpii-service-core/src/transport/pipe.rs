//! Named-pipe endpoint: server and client halves created as a pair.

use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tracing::debug;

use super::TransportError;
use crate::os::handle::OwnedHandle;
use crate::os::pipe::open_pipe_client;

/// A paired pipe endpoint.
///
/// The server half stays in this process; the client half is an inheritable
/// handle destined for exactly one child. Once the child has been spawned
/// the parent must drop its copy of `client`, otherwise EOF stops being a
/// reliable peer-exit signal.
#[derive(Debug)]
pub struct PipeEndpoint {
    /// Full pipe path.
    pub name: String,
    /// Server half, ready for framed I/O.
    pub server: NamedPipeServer,
    /// Inheritable client half.
    pub client: OwnedHandle,
}

impl PipeEndpoint {
    /// Create the pipe `name` and acquire both halves.
    ///
    /// The server is bound first (as the first and only instance, local
    /// clients only), then the client side is opened by this process itself
    /// and marked inheritable. If either half cannot be acquired the other
    /// is closed on the way out.
    ///
    /// # Errors
    ///
    /// Fails if the pipe cannot be created, the client open fails, or the
    /// connect handshake errors.
    pub async fn create(name: &str) -> Result<Self, TransportError> {
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .reject_remote_clients(true)
            .create(name)?;

        let client_name = name.to_string();
        let client = tokio::task::spawn_blocking(move || open_pipe_client(&client_name))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;

        // Our own client open above is the connection; tokio resolves the
        // already-connected case immediately.
        server.connect().await?;
        client.set_inheritable(true)?;

        debug!(pipe = %name, "endpoint ready");
        Ok(Self {
            name: name.to_string(),
            server,
            client,
        })
    }
}
