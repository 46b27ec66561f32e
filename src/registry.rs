//! Attached-client bookkeeping and per-client I/O tasks.
//!
//! Each client — the primary peer on our own stdio, or a socket peer — gets a
//! bounded outbound queue drained by its own writer task, and a reader task
//! that feeds framed lines into the broker's event stream. The registry is
//! plain data owned by the broker task; nothing here locks.
//!
//! Backpressure: a client whose queue fills is a slow reader and is detached
//! rather than ever stalling the agent stream or its peers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::broker::BrokerEvent;
use crate::framing::{self, LineReader};
use crate::jsonrpc::id_key;

/// Outbound frames buffered per client before it counts as a slow reader.
pub const CLIENT_QUEUE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Which peer a client is. Ordering matters: the primary ranks first for
/// responder promotion, then socket peers in attach order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientId {
    /// The peer on the multiplexer's own stdin/stdout.
    Primary,
    /// A Unix-socket peer, numbered in accept order starting at 1.
    Peer(u64),
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientId::Primary => write!(f, "primary"),
            ClientId::Peer(n) => write!(f, "peer-{n}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Client {
    queue: mpsc::Sender<String>,
    /// Outstanding requests this client forwarded to the agent:
    /// original id (canonical form) → (agent-side id, method).
    requests: HashMap<String, (u64, String)>,
}

/// The set of currently attached clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: BTreeMap<ClientId, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, id: ClientId, queue: mpsc::Sender<String>) {
        if self
            .clients
            .insert(
                id,
                Client {
                    queue,
                    requests: HashMap::new(),
                },
            )
            .is_some()
        {
            log::warn!("client {id} attached twice, replacing the old record");
        }
    }

    /// Remove a client. Returns false if it was already gone. Its writer task
    /// drains whatever is still queued and exits when the sender drops here.
    pub fn detach(&mut self, id: ClientId) -> bool {
        self.clients.remove(&id).is_some()
    }

    pub fn is_live(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// The lowest-ranked live client, used for responder promotion.
    pub fn first_client(&self) -> Option<ClientId> {
        self.clients.keys().next().copied()
    }

    /// Queue one frame for a client. Returns false when the client's queue
    /// overflowed or its writer is gone — the caller must detach it.
    #[must_use]
    pub fn send(&mut self, id: ClientId, line: String) -> bool {
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        match client.queue.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("client {id} is a slow reader (queue full), detaching");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("client {id} queue closed");
                false
            }
        }
    }

    /// Queue one frame for every live client. Returns the clients whose
    /// queues rejected it, for the caller to detach; the rest are unaffected.
    pub fn broadcast(&mut self, line: &str) -> Vec<ClientId> {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        let mut failed = Vec::new();
        for id in ids {
            if !self.send(id, line.to_string()) {
                failed.push(id);
            }
        }
        failed
    }

    /// Note a request forwarded to the agent on behalf of `id`.
    pub fn record_request(&mut self, id: ClientId, orig: &Value, agent_id: u64, method: &str) {
        if let Some(client) = self.clients.get_mut(&id)
            && client
                .requests
                .insert(id_key(orig), (agent_id, method.to_string()))
                .is_some()
        {
            log::warn!("client {id} reused in-flight request id {orig}");
        }
    }

    /// Clear the in-flight entry once the agent has replied.
    pub fn complete_request(&mut self, id: ClientId, orig: &Value) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.requests.remove(&id_key(orig));
        }
    }
}

// ---------------------------------------------------------------------------
// Per-client I/O tasks
// ---------------------------------------------------------------------------

/// Spawn the reader/writer task pair for one client and return its outbound
/// queue.
///
/// The reader feeds [`BrokerEvent::ClientLine`] until EOF or a read error,
/// then announces [`BrokerEvent::ClientClosed`]. The writer drains the queue
/// until a write fails (also announced) or the registry detaches the client
/// (sender dropped, so the queue closes after a best-effort drain).
pub fn spawn_client_io<R, W>(
    id: ClientId,
    reader: R,
    writer: W,
    events: mpsc::UnboundedSender<BrokerEvent>,
) -> mpsc::Sender<String>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (queue_tx, mut queue_rx) = mpsc::channel::<String>(CLIENT_QUEUE_CAPACITY);

    let writer_events = events.clone();
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = queue_rx.recv().await {
            if let Err(e) = framing::write_line(&mut writer, &line).await {
                log::warn!("write to {id} failed: {e}");
                let _ = writer_events.send(BrokerEvent::ClientClosed { client: id });
                return;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = LineReader::new(reader);
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if events
                        .send(BrokerEvent::ClientLine { client: id, line })
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("read from {id} failed: {e}");
                    break;
                }
            }
        }
        let _ = events.send(BrokerEvent::ClientClosed { client: id });
    });

    queue_tx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
