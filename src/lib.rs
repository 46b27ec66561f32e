//! acp-multiplex: one ACP agent, many live clients.
//!
//! ACP (Agent Client Protocol) agents speak line-delimited JSON-RPC 2.0 over
//! stdio and expect exactly one client on the other end. This crate sits in
//! between: it spawns the agent, presents itself as that single client, and
//! re-exposes the session to the process's own stdin/stdout **and** to any
//! number of peers joining over a Unix socket mid-session. Late joiners are
//! replayed the cached handshake replies and the full `session/update`
//! history, then ride the live fan-out; any client can prompt, and request
//! ids are rewritten so each client keeps its own id space.
//!
//! # Architecture
//!
//! - [`framing`] — newline-delimited JSON framing with a line-size cap
//! - [`jsonrpc`] — raw-object message envelope and JSON-RPC error types
//! - [`protocol`] — the three ACP methods the broker inspects by name
//! - [`agent`] — agent subprocess ownership (stdio tasks, exit watching)
//! - [`registry`] — attached-client table and per-client I/O tasks
//! - [`replay`] — the cached session prelude for late joiners
//! - [`broker`] — the routing core: a single owner task over all state
//! - [`acceptor`] — Unix socket binding and accept loop
//!
//! # Example
//!
//! ```ignore
//! use acp_multiplex::{AgentChannel, Broker, BrokerEvent, ClientId, registry};
//! use tokio::sync::mpsc;
//!
//! let (events_tx, events_rx) = mpsc::unbounded_channel();
//! let agent = AgentChannel::spawn("claude-code-acp", &[], events_tx.clone())?;
//!
//! let queue = registry::spawn_client_io(
//!     ClientId::Primary,
//!     tokio::io::stdin(),
//!     tokio::io::stdout(),
//!     events_tx.clone(),
//! );
//! events_tx.send(BrokerEvent::ClientAttached { client: ClientId::Primary, queue })?;
//!
//! let exit = Broker::new(events_rx, agent.sender()).run().await;
//! ```

pub mod acceptor;
pub mod agent;
pub mod broker;
pub mod framing;
pub mod jsonrpc;
pub mod protocol;
pub mod registry;
pub mod replay;

// Re-export the main public types at the crate root for convenience
pub use acceptor::SocketAcceptor;
pub use agent::AgentChannel;
pub use broker::{Broker, BrokerEvent, BrokerExit};
pub use jsonrpc::{DecodeError, Envelope, RpcError};
pub use registry::{ClientId, ClientRegistry};
pub use replay::ReplayLog;
