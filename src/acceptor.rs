//! Unix socket acceptor for secondary clients.
//!
//! The multiplexer binds a stream socket at startup and announces it on
//! stderr as `listening on socket <path>` — observer tooling finds the
//! session by scanning for the `socket ` token, so the format is part of the
//! contract. Each accepted connection becomes a numbered client and is
//! immediately handed to the broker for replay.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tokio::sync::mpsc;

use crate::broker::BrokerEvent;
use crate::registry::{self, ClientId};

/// Where the session socket lives: the user runtime dir when the platform
/// has one, `/tmp` otherwise, named per-process so concurrent sessions never
/// collide.
pub fn default_socket_path() -> PathBuf {
    let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
    dir.join(format!("acp-multiplex-{}.sock", std::process::id()))
}

/// A bound, listening session socket.
pub struct SocketAcceptor {
    path: PathBuf,
    listener: UnixListener,
}

impl SocketAcceptor {
    /// Bind the socket and restrict it to the owning user. Anyone who can
    /// connect can drive the session, so 0600 is load-bearing.
    pub fn bind(path: PathBuf) -> io::Result<Self> {
        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections forever, registering each as a new client. Peers
    /// are numbered in accept order; numbers are never reused.
    pub async fn run(self, events: mpsc::UnboundedSender<BrokerEvent>) {
        let mut next_peer: u64 = 1;
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let client = ClientId::Peer(next_peer);
                    next_peer += 1;
                    log::info!("accepted {client} on the session socket");

                    let (read_half, write_half) = stream.into_split();
                    let queue =
                        registry::spawn_client_io(client, read_half, write_half, events.clone());
                    if events
                        .send(BrokerEvent::ClientAttached { client, queue })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("accept failed: {e}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
