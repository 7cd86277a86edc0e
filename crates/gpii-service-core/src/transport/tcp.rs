//! Loopback-TCP fallback endpoint with accept-time peer authentication.
//!
//! A pipe client handle proves itself by construction; a TCP peer proves
//! nothing, so the accept path walks the system TCP table and requires that
//! the connection's local endpoint belongs to this process and its remote
//! endpoint belongs to the spawned child or a process related to it within
//! a bounded ancestry depth.

use std::collections::HashMap;

use super::TransportError;

/// One row of the IPv4 owner-pid TCP table, ports already masked and
/// byte-swapped to host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTableRow {
    /// Local port of the connection.
    pub local_port: u16,
    /// Remote port of the connection.
    pub remote_port: u16,
    /// Pid owning the local endpoint.
    pub owning_pid: u32,
}

/// How far apart in the process tree the child and the connecting process
/// may be and still count as the same application.
pub const MAX_ANCESTRY_DEPTH: usize = 5;

fn owner_of(rows: &[TcpTableRow], local_port: u16, remote_port: u16) -> Option<u32> {
    rows.iter()
        .find(|row| row.local_port == local_port && row.remote_port == remote_port)
        .map(|row| row.owning_pid)
}

fn ancestor_within(parents: &HashMap<u32, u32>, start: u32, target: u32, depth: usize) -> bool {
    let mut current = start;
    for _ in 0..depth {
        match parents.get(&current) {
            Some(&parent) if parent == target => return true,
            Some(&parent) => current = parent,
            None => return false,
        }
    }
    false
}

/// Whether `a` and `b` are the same pid or ancestor/descendant of each
/// other within `depth` steps of the parent chain.
#[must_use]
pub fn related_within(parents: &HashMap<u32, u32>, a: u32, b: u32, depth: usize) -> bool {
    a == b || ancestor_within(parents, a, b, depth) || ancestor_within(parents, b, a, depth)
}

/// Authenticate an accepted loopback connection against the TCP table.
///
/// `our_port`/`peer_port` are the accepted socket's local and remote ports.
/// Two facts must hold: the local endpoint is owned by `our_pid`, and the
/// remote endpoint is owned by `child_pid` or a relative of it within
/// [`MAX_ANCESTRY_DEPTH`].
///
/// # Errors
///
/// Returns [`TransportError::PeerAuthenticationFailed`] when either fact
/// cannot be established.
pub fn authenticate_peer(
    rows: &[TcpTableRow],
    parents: &HashMap<u32, u32>,
    our_pid: u32,
    our_port: u16,
    peer_port: u16,
    child_pid: u32,
) -> Result<(), TransportError> {
    match owner_of(rows, our_port, peer_port) {
        Some(pid) if pid == our_pid => {}
        _ => return Err(TransportError::PeerAuthenticationFailed { remote_pid: None }),
    }

    let Some(remote_pid) = owner_of(rows, peer_port, our_port) else {
        return Err(TransportError::PeerAuthenticationFailed { remote_pid: None });
    };
    if related_within(parents, remote_pid, child_pid, MAX_ANCESTRY_DEPTH) {
        Ok(())
    } else {
        Err(TransportError::PeerAuthenticationFailed {
            remote_pid: Some(remote_pid),
        })
    }
}

#[cfg(windows)]
pub use endpoint::TcpEndpoint;

#[cfg(windows)]
mod endpoint {
    use tokio::net::TcpListener;
    use tracing::{debug, warn};

    use super::{authenticate_peer, TransportError};
    use crate::os::{process, tcp};
    use crate::transport::Connection;

    /// Loopback listener half of a TCP endpoint.
    #[derive(Debug)]
    pub struct TcpEndpoint {
        listener: TcpListener,
        port: u16,
    }

    impl TcpEndpoint {
        /// Bind an ephemeral loopback port.
        ///
        /// # Errors
        ///
        /// Fails if no loopback port can be bound.
        pub async fn bind() -> Result<Self, TransportError> {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let port = listener.local_addr()?.port();
            Ok(Self { listener, port })
        }

        /// The bound port, for handing to the child.
        #[must_use]
        pub const fn port(&self) -> u16 {
            self.port
        }

        /// Accept connections until one authenticates as `child_pid`.
        ///
        /// Unproven peers are closed before anything else observes them and
        /// logged as warnings.
        ///
        /// # Errors
        ///
        /// Fails only if accepting or reading the TCP table breaks.
        pub async fn accept_authenticated(
            self,
            child_pid: u32,
        ) -> Result<Connection, TransportError> {
            loop {
                let (stream, peer) = self.listener.accept().await?;
                let rows = tcp::tcp_table()?;
                let parents = process::parent_map()?;
                match authenticate_peer(
                    &rows,
                    &parents,
                    std::process::id(),
                    self.port,
                    peer.port(),
                    child_pid,
                ) {
                    Ok(()) => {
                        debug!(peer = %peer, child_pid, "peer authenticated");
                        return Ok(Box::new(stream));
                    }
                    Err(err) => {
                        // Close before anyone is notified; no events fire
                        // for this connection.
                        drop(stream);
                        warn!(peer = %peer, child_pid, %err, "rejected unproven peer");
                    }
                }
            }
        }
    }
}
