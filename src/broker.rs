//! Message broker: the bidirectional routing core.
//!
//! One task owns every piece of shared state — the client registry, the
//! pending-request table, the replay log, the agent-id counter, the responder
//! binding — and consumes a single [`BrokerEvent`] stream fed by the I/O
//! tasks. No locks, no partially-updated views: the broker is a pure event
//! loop, which also makes it drivable end-to-end from tests with plain
//! channels.
//!
//! # Routing
//!
//! Client → agent: requests get a fresh monotonic agent-side id (the client's
//! own id is restored on the way back), notifications pass through verbatim,
//! and replies to agent-initiated requests flow back id-unchanged. The
//! `initialize` / `session/new` handshake is special-cased: the agent is
//! driven once, the replies are cached, and every later caller — including a
//! duplicate arriving while the first exchange is still in flight — is served
//! from the cache rebound to its own request id.
//!
//! Agent → client: replies are matched against the pending table and returned
//! to their originator only; `session/update` notifications are appended to
//! the replay log and fanned out to every live client in receive order;
//! reverse requests go to the designated responder (the primary until it
//! disconnects, then the oldest surviving client), or are answered with a
//! synthesized error when nobody is attached to ask.
//!
//! Replay on attach is eager: a new client is pushed the cached handshake
//! replies (ids as originally exchanged) and the full update tail before it
//! says anything, matching what the session-observer tooling expects.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::jsonrpc::{DecodeError, Envelope, RpcError, id_key};
use crate::protocol;
use crate::registry::{ClientId, ClientRegistry};
use crate::replay::ReplayLog;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything the broker reacts to, delivered over one unbounded channel.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A client's I/O tasks are running and its outbound queue is ready.
    ClientAttached {
        client: ClientId,
        queue: mpsc::Sender<String>,
    },
    /// One framed line arrived from a client.
    ClientLine { client: ClientId, line: String },
    /// A client's reader or writer ended.
    ClientClosed { client: ClientId },
    /// One parsed message arrived from the agent.
    AgentMessage(Envelope),
    /// The agent process exited with the given code (128+signal when killed
    /// by a signal).
    AgentExited { code: i32 },
    /// SIGINT/SIGTERM reached the process.
    Shutdown { signal: i32 },
}

/// Why the broker stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum BrokerExit {
    AgentExited { code: i32 },
    Signalled { signal: i32 },
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// A request forwarded to the agent, awaiting its reply.
struct Pending {
    client: ClientId,
    id: Value,
    method: String,
}

/// An agent-initiated request dispatched to a client, awaiting its reply.
struct ReverseCall {
    id: Value,
    target: ClientId,
    method: String,
}

/// Coalescing state for one of the two cached handshake methods: at most one
/// exchange ever reaches the agent; callers racing it wait.
#[derive(Default)]
struct HandshakeGate {
    inflight: bool,
    waiters: Vec<(ClientId, Value)>,
}

/// Which handshake slot a gate belongs to.
#[derive(Clone, Copy)]
enum Handshake {
    Init,
    Session,
}

pub struct Broker {
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    /// Frames bound for the agent's stdin. Unbounded: the agent is local and
    /// trusted, and the writer serializes.
    agent_tx: mpsc::UnboundedSender<String>,
    registry: ClientRegistry,
    replay: ReplayLog,
    pending: HashMap<u64, Pending>,
    next_agent_id: u64,
    init_gate: HandshakeGate,
    session_gate: HandshakeGate,
    responder: Option<ClientId>,
    /// Outstanding reverse requests keyed by canonical id.
    reverse: HashMap<String, ReverseCall>,
}

impl Broker {
    pub fn new(
        events: mpsc::UnboundedReceiver<BrokerEvent>,
        agent_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            events,
            agent_tx,
            registry: ClientRegistry::new(),
            replay: ReplayLog::new(),
            pending: HashMap::new(),
            next_agent_id: 1,
            init_gate: HandshakeGate::default(),
            session_gate: HandshakeGate::default(),
            responder: None,
            reverse: HashMap::new(),
        }
    }

    /// Run until the agent dies or a shutdown signal arrives.
    pub async fn run(mut self) -> BrokerExit {
        while let Some(event) = self.events.recv().await {
            match event {
                BrokerEvent::ClientAttached { client, queue } => self.on_attach(client, queue),
                BrokerEvent::ClientLine { client, line } => self.on_client_line(client, &line),
                BrokerEvent::ClientClosed { client } => self.drop_client(client),
                BrokerEvent::AgentMessage(msg) => self.on_agent_message(msg),
                BrokerEvent::AgentExited { code } => {
                    log::error!("agent exited with code {code}, shutting down");
                    return BrokerExit::AgentExited { code };
                }
                BrokerEvent::Shutdown { signal } => {
                    log::info!("received signal {signal}, shutting down");
                    return BrokerExit::Signalled { signal };
                }
            }
        }
        // Every event sender dropped without a shutdown — treat as failure.
        log::error!("event stream ended unexpectedly");
        BrokerExit::AgentExited { code: 1 }
    }

    // -----------------------------------------------------------------------
    // Client lifecycle
    // -----------------------------------------------------------------------

    fn on_attach(&mut self, client: ClientId, queue: mpsc::Sender<String>) {
        self.registry.attach(client, queue);
        if self.responder.is_none() {
            self.responder = Some(client);
        }
        log::info!(
            "client {client} attached ({} cached updates to replay)",
            self.replay.update_count()
        );

        for line in self.replay.snapshot_lines() {
            if !self.registry.send(client, line) {
                self.drop_client(client);
                return;
            }
        }
    }

    fn drop_client(&mut self, client: ClientId) {
        if !self.registry.detach(client) {
            return;
        }
        log::info!("client {client} detached");

        // Pending entries stay: the agent will still reply, and the reply is
        // dropped when it finds no live originator.

        if self.responder == Some(client) {
            self.responder = self.registry.first_client();
            match self.responder {
                Some(next) => log::info!("client {next} is now the reverse-request responder"),
                None => log::warn!("no clients attached; agent requests will be refused"),
            }

            // Answer the dead responder's outstanding reverse requests so the
            // agent is not left hanging.
            let owed: Vec<String> = self
                .reverse
                .iter()
                .filter(|(_, call)| call.target == client)
                .map(|(key, _)| key.clone())
                .collect();
            for key in owed {
                if let Some(call) = self.reverse.remove(&key) {
                    log::warn!(
                        "responder {client} left {} unanswered, refusing it for the agent",
                        call.method
                    );
                    self.send_to_agent(
                        Envelope::error_reply(call.id, RpcError::no_responder(&call.method))
                            .to_line(),
                    );
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Client → agent
    // -----------------------------------------------------------------------

    fn on_client_line(&mut self, client: ClientId, line: &str) {
        if !self.registry.is_live(client) {
            // Reader still draining a detached client.
            return;
        }

        let msg = match Envelope::from_line(line) {
            Ok(msg) => msg,
            Err(DecodeError::Parse(e)) => {
                log::warn!("unparsable line from {client}: {e}");
                self.send_to_client(
                    client,
                    Envelope::error_reply(Value::Null, RpcError::parse_error()).to_line(),
                );
                return;
            }
            Err(DecodeError::NotAnObject) => {
                log::warn!("non-object message from {client}");
                self.send_to_client(
                    client,
                    Envelope::error_reply(Value::Null, RpcError::invalid_request()).to_line(),
                );
                return;
            }
        };

        if msg.is_request() {
            self.on_client_request(client, msg);
        } else if msg.is_notification() {
            log::debug!(
                "{client} -> agent: notification {}",
                msg.method().unwrap_or_default()
            );
            self.send_to_agent(msg.to_line());
        } else if msg.is_reply() {
            self.on_client_reply(client, msg);
        } else {
            log::warn!("structurally invalid message from {client}");
            let id = msg.id().cloned().unwrap_or(Value::Null);
            self.send_to_client(
                client,
                Envelope::error_reply(id, RpcError::invalid_request()).to_line(),
            );
        }
    }

    fn on_client_request(&mut self, client: ClientId, msg: Envelope) {
        match msg.method() {
            Some(protocol::INITIALIZE) => self.handshake_request(client, msg, Handshake::Init),
            Some(protocol::SESSION_NEW) => self.handshake_request(client, msg, Handshake::Session),
            _ => {
                self.forward_request(client, msg);
            }
        }
    }

    /// `initialize` / `session/new`: drive the agent at most once, serve
    /// everyone else from the cache (or queue them behind the in-flight
    /// exchange).
    fn handshake_request(&mut self, client: ClientId, msg: Envelope, which: Handshake) {
        let Some(id) = msg.id().cloned() else { return };
        let method = msg.method().unwrap_or_default().to_string();

        let cached = match which {
            Handshake::Init => self.replay.init_reply(),
            Handshake::Session => self.replay.session_reply(),
        };
        if let Some(cached) = cached {
            log::debug!("serving cached {method} reply to {client}");
            let line = Envelope::reply(id, cached.result.clone()).to_line();
            self.send_to_client(client, line);
            return;
        }

        let gate = match which {
            Handshake::Init => &mut self.init_gate,
            Handshake::Session => &mut self.session_gate,
        };
        if gate.inflight {
            log::debug!("{method} already in flight, queueing {client}");
            gate.waiters.push((client, id));
            return;
        }

        self.forward_request(client, msg);
        let gate = match which {
            Handshake::Init => &mut self.init_gate,
            Handshake::Session => &mut self.session_gate,
        };
        gate.inflight = true;
    }

    /// Rewrite a client request onto the agent's id space and forward it.
    fn forward_request(&mut self, client: ClientId, mut msg: Envelope) {
        let Some(orig) = msg.id().cloned() else { return };
        let method = msg.method().unwrap_or_default().to_string();

        let agent_id = self.next_agent_id;
        self.next_agent_id += 1;

        self.pending.insert(
            agent_id,
            Pending {
                client,
                id: orig.clone(),
                method: method.clone(),
            },
        );
        self.registry.record_request(client, &orig, agent_id, &method);

        msg.set_id(Value::from(agent_id));
        log::debug!("{client} -> agent: {method} (id {orig} rewritten to {agent_id})");
        self.send_to_agent(msg.to_line());
    }

    /// A reply from a client answers an agent-initiated request and crosses
    /// with its id untouched. Only the responder the request was dispatched
    /// to may answer.
    fn on_client_reply(&mut self, client: ClientId, msg: Envelope) {
        let Some(id) = msg.id().cloned() else {
            log::warn!("reply without id from {client}, dropping");
            return;
        };
        let key = id_key(&id);

        let dispatched_here = self
            .reverse
            .get(&key)
            .map(|call| call.target == client)
            .unwrap_or(false);
        if dispatched_here || self.responder == Some(client) {
            self.reverse.remove(&key);
            log::debug!("{client} -> agent: reply to agent request {id}");
            self.send_to_agent(msg.to_line());
        } else {
            log::warn!("{client} answered agent request {id} it was not asked, dropping");
        }
    }

    // -----------------------------------------------------------------------
    // Agent → client
    // -----------------------------------------------------------------------

    fn on_agent_message(&mut self, msg: Envelope) {
        if msg.is_reply() {
            self.on_agent_reply(msg);
        } else if msg.is_notification() {
            self.on_agent_notification(msg);
        } else if msg.is_request() {
            self.on_agent_request(msg);
        } else {
            log::warn!("structurally invalid message from agent, dropping");
        }
    }

    fn on_agent_reply(&mut self, mut msg: Envelope) {
        let Some(agent_id) = msg.id().and_then(Value::as_u64) else {
            log::warn!("agent reply with unrecognized id {:?}, dropping", msg.id());
            return;
        };
        let Some(pending) = self.pending.remove(&agent_id) else {
            log::warn!("agent reply for unknown id {agent_id}, dropping");
            return;
        };
        self.registry.complete_request(pending.client, &pending.id);

        match pending.method.as_str() {
            protocol::INITIALIZE => self.finish_handshake(Handshake::Init, &msg, &pending),
            protocol::SESSION_NEW => self.finish_handshake(Handshake::Session, &msg, &pending),
            _ => {}
        }

        msg.set_id(pending.id.clone());
        if self.registry.is_live(pending.client) {
            log::debug!(
                "agent -> {}: reply to {} (id {})",
                pending.client,
                pending.method,
                pending.id
            );
            self.send_to_client(pending.client, msg.to_line());
        } else {
            log::debug!(
                "dropping agent reply to {}: client {} is gone",
                pending.method,
                pending.client
            );
        }
    }

    /// Cache a completed handshake exchange and settle any callers that were
    /// queued behind it. Errors propagate but are never cached, so a later
    /// attempt can drive the agent again.
    fn finish_handshake(&mut self, which: Handshake, msg: &Envelope, pending: &Pending) {
        let gate = match which {
            Handshake::Init => &mut self.init_gate,
            Handshake::Session => &mut self.session_gate,
        };
        gate.inflight = false;
        let waiters = std::mem::take(&mut gate.waiters);

        if let Some(result) = msg.result() {
            let result = result.clone();
            match which {
                Handshake::Init => {
                    self.replay.record_init(pending.id.clone(), result.clone());
                    log::info!("initialize reply cached for replay");
                }
                Handshake::Session => {
                    self.replay.record_session(pending.id.clone(), result.clone());
                    log::info!(
                        "session established: {}",
                        protocol::session_id(&result).unwrap_or("<no sessionId>")
                    );
                }
            }
            for (waiter, waiter_id) in waiters {
                self.send_to_client(waiter, Envelope::reply(waiter_id, result.clone()).to_line());
            }
        } else {
            let error = msg.error().cloned().unwrap_or(Value::Null);
            log::warn!("{} failed: {error}", pending.method);
            for (waiter, waiter_id) in waiters {
                self.send_to_client(
                    waiter,
                    Envelope::error_reply_raw(waiter_id, error.clone()).to_line(),
                );
            }
        }
    }

    fn on_agent_notification(&mut self, msg: Envelope) {
        let line = msg.to_line();
        if msg.method() == Some(protocol::SESSION_UPDATE) {
            log::debug!(
                "agent notification: session/update {}",
                protocol::update_kind(&msg).unwrap_or("?")
            );
            self.replay.push_update(line.clone());
        } else {
            log::debug!(
                "agent notification: {}",
                msg.method().unwrap_or_default()
            );
        }

        for slow in self.registry.broadcast(&line) {
            self.drop_client(slow);
        }
    }

    /// A reverse request: the agent is asking a question (permission prompt,
    /// file access). Exactly one client answers.
    fn on_agent_request(&mut self, msg: Envelope) {
        let Some(id) = msg.id().cloned() else { return };
        let method = msg.method().unwrap_or_default().to_string();

        match self.responder {
            Some(responder) => {
                log::debug!("agent -> {responder}: {method} (id {id})");
                self.reverse.insert(
                    id_key(&id),
                    ReverseCall {
                        id,
                        target: responder,
                        method,
                    },
                );
                let line = msg.to_line();
                self.send_to_client(responder, line);
            }
            None => {
                log::warn!("agent asked {method} with no clients attached, refusing");
                self.send_to_agent(
                    Envelope::error_reply(id, RpcError::no_responder(&method)).to_line(),
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn send_to_client(&mut self, client: ClientId, line: String) {
        if !self.registry.send(client, line) {
            self.drop_client(client);
        }
    }

    fn send_to_agent(&self, line: String) {
        if self.agent_tx.send(line).is_err() {
            // The agent writer is gone; its exit event is already in flight.
            log::debug!("agent channel closed, dropping outbound frame");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::task::JoinHandle;

    struct TestBroker {
        events: mpsc::UnboundedSender<BrokerEvent>,
        agent_rx: mpsc::UnboundedReceiver<String>,
        handle: JoinHandle<BrokerExit>,
    }

    fn start_broker() -> TestBroker {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Broker::new(events_rx, agent_tx).run());
        TestBroker {
            events: events_tx,
            agent_rx,
            handle,
        }
    }

    impl TestBroker {
        fn attach(&self, client: ClientId) -> mpsc::Receiver<String> {
            self.attach_with_capacity(client, 64)
        }

        fn attach_with_capacity(&self, client: ClientId, cap: usize) -> mpsc::Receiver<String> {
            let (queue, rx) = mpsc::channel(cap);
            self.events
                .send(BrokerEvent::ClientAttached { client, queue })
                .unwrap();
            rx
        }

        fn client_line(&self, client: ClientId, line: impl Into<String>) {
            self.events
                .send(BrokerEvent::ClientLine {
                    client,
                    line: line.into(),
                })
                .unwrap();
        }

        fn agent_msg(&self, line: &str) {
            self.events
                .send(BrokerEvent::AgentMessage(Envelope::from_line(line).unwrap()))
                .unwrap();
        }

        async fn agent_recv(&mut self) -> Value {
            serde_json::from_str(&self.agent_rx.recv().await.unwrap()).unwrap()
        }
    }

    async fn recv_json(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    fn init_request(id: u64) -> String {
        format!(
            r#"{{"jsonrpc":"2.0","id":{id},"method":"initialize","params":{{"protocolVersion":1,"clientInfo":{{"name":"test","version":"0.1"}}}}}}"#
        )
    }

    fn session_new_request(id: u64) -> String {
        format!(
            r#"{{"jsonrpc":"2.0","id":{id},"method":"session/new","params":{{"cwd":"/tmp","mcpServers":[]}}}}"#
        )
    }

    fn update_notification(n: u64) -> String {
        format!(
            r#"{{"jsonrpc":"2.0","method":"session/update","params":{{"update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"chunk-{n}"}}}}}}}}"#
        )
    }

    /// Drive the full handshake for the primary client: initialize (client
    /// id 1, agent id 1) and session/new (client id 2, agent id 2).
    async fn handshake(broker: &mut TestBroker, primary_rx: &mut mpsc::Receiver<String>) {
        broker.client_line(ClientId::Primary, init_request(1));
        let fwd = broker.agent_recv().await;
        assert_eq!(fwd["method"], json!("initialize"));
        broker.agent_msg(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"protocolVersion":1,"agentInfo":{{"name":"claude-code","version":"1.0"}}}}}}"#,
            fwd["id"]
        ));
        let reply = recv_json(primary_rx).await;
        assert_eq!(reply["id"], json!(1));

        broker.client_line(ClientId::Primary, session_new_request(2));
        let fwd = broker.agent_recv().await;
        assert_eq!(fwd["method"], json!("session/new"));
        broker.agent_msg(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"sessionId":"sess-1"}}}}"#,
            fwd["id"]
        ));
        let reply = recv_json(primary_rx).await;
        assert_eq!(reply["id"], json!(2));
        assert_eq!(reply["result"]["sessionId"], json!("sess-1"));
    }

    #[tokio::test]
    async fn test_handshake_forward_and_rebind() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);

        broker.client_line(ClientId::Primary, init_request(1));
        let fwd = broker.agent_recv().await;
        // Forwarded with a broker-allocated id, method and params intact.
        assert_eq!(fwd["method"], json!("initialize"));
        assert_eq!(fwd["params"]["clientInfo"]["name"], json!("test"));

        broker.agent_msg(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"agentInfo":{{"name":"claude-code"}}}}}}"#,
            fwd["id"]
        ));
        let reply = recv_json(&mut primary).await;
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["result"]["agentInfo"]["name"], json!("claude-code"));
    }

    #[tokio::test]
    async fn test_client_ids_never_reach_the_agent() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        handshake(&mut broker, &mut primary).await;

        broker.client_line(
            ClientId::Primary,
            r#"{"jsonrpc":"2.0","id":99,"method":"session/prompt","params":{"sessionId":"sess-1","prompt":[]}}"#,
        );
        let fwd = broker.agent_recv().await;
        assert_ne!(fwd["id"], json!(99));
        // Monotonic: two handshake requests already consumed ids 1 and 2.
        assert_eq!(fwd["id"], json!(3));
    }

    #[tokio::test]
    async fn test_agent_ids_monotonic_across_clients() {
        let mut broker = start_broker();
        let _primary = broker.attach(ClientId::Primary);
        let _peer = broker.attach(ClientId::Peer(1));

        broker.client_line(
            ClientId::Primary,
            r#"{"jsonrpc":"2.0","id":5,"method":"session/prompt","params":{}}"#,
        );
        broker.client_line(
            ClientId::Peer(1),
            r#"{"jsonrpc":"2.0","id":5,"method":"session/prompt","params":{}}"#,
        );

        let first = broker.agent_recv().await;
        let second = broker.agent_recv().await;
        assert_eq!(first["id"], json!(1));
        assert_eq!(second["id"], json!(2));
    }

    #[tokio::test]
    async fn test_second_initialize_served_from_cache() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        handshake(&mut broker, &mut primary).await;

        let mut peer = broker.attach(ClientId::Peer(1));
        // Replay arrives first; skip it.
        let _ = recv_json(&mut peer).await;
        let _ = recv_json(&mut peer).await;

        broker.client_line(ClientId::Peer(1), init_request(7));
        let reply = recv_json(&mut peer).await;
        assert_eq!(reply["id"], json!(7));
        assert_eq!(reply["result"]["agentInfo"]["name"], json!("claude-code"));

        broker.client_line(ClientId::Peer(1), session_new_request(8));
        let reply = recv_json(&mut peer).await;
        assert_eq!(reply["id"], json!(8));
        assert_eq!(reply["result"]["sessionId"], json!("sess-1"));

        // The cached replies prove both lines were fully routed; the agent
        // must have seen neither.
        assert!(matches!(broker.agent_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_initialize_coalesced_while_in_flight() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        let mut peer = broker.attach(ClientId::Peer(1));

        broker.client_line(ClientId::Primary, init_request(1));
        broker.client_line(ClientId::Peer(1), init_request(41));

        let fwd = broker.agent_recv().await;
        broker.agent_msg(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"agentInfo":{{"name":"claude-code"}}}}}}"#,
            fwd["id"]
        ));

        let first = recv_json(&mut primary).await;
        assert_eq!(first["id"], json!(1));
        let second = recv_json(&mut peer).await;
        assert_eq!(second["id"], json!(41));
        assert_eq!(second["result"]["agentInfo"]["name"], json!("claude-code"));

        // Exactly one initialize crossed to the agent.
        assert!(matches!(broker.agent_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_handshake_error_propagates_without_caching() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        let mut peer = broker.attach(ClientId::Peer(1));

        broker.client_line(ClientId::Primary, init_request(1));
        broker.client_line(ClientId::Peer(1), init_request(2));
        let fwd = broker.agent_recv().await;
        broker.agent_msg(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"error":{{"code":-32000,"message":"boom"}}}}"#,
            fwd["id"]
        ));

        let first = recv_json(&mut primary).await;
        assert_eq!(first["error"]["code"], json!(-32000));
        let second = recv_json(&mut peer).await;
        assert_eq!(second["id"], json!(2));
        assert_eq!(second["error"]["code"], json!(-32000));

        // Nothing cached: a retry drives the agent again.
        broker.client_line(ClientId::Primary, init_request(3));
        let fwd = broker.agent_recv().await;
        assert_eq!(fwd["method"], json!("initialize"));
    }

    #[tokio::test]
    async fn test_replay_on_attach() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        handshake(&mut broker, &mut primary).await;

        broker.agent_msg(&update_notification(1));
        broker.agent_msg(&update_notification(2));
        let _ = recv_json(&mut primary).await;
        let _ = recv_json(&mut primary).await;

        // A late joiner gets the prelude before saying anything.
        let mut peer = broker.attach(ClientId::Peer(1));
        let init = recv_json(&mut peer).await;
        assert_eq!(init["result"]["agentInfo"]["name"], json!("claude-code"));
        assert_eq!(init["id"], json!(1));
        let session = recv_json(&mut peer).await;
        assert_eq!(session["result"]["sessionId"], json!("sess-1"));
        let u1 = recv_json(&mut peer).await;
        assert_eq!(
            u1["params"]["update"]["content"]["text"],
            json!("chunk-1")
        );
        let u2 = recv_json(&mut peer).await;
        assert_eq!(
            u2["params"]["update"]["content"]["text"],
            json!("chunk-2")
        );
    }

    #[tokio::test]
    async fn test_updates_fan_out_to_all_clients_in_order() {
        let broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        let mut peer = broker.attach(ClientId::Peer(1));

        for n in 1..=3 {
            broker.agent_msg(&update_notification(n));
        }
        for rx in [&mut primary, &mut peer] {
            for n in 1..=3 {
                let msg = recv_json(rx).await;
                assert_eq!(
                    msg["params"]["update"]["content"]["text"],
                    json!(format!("chunk-{n}"))
                );
            }
        }
    }

    #[tokio::test]
    async fn test_reply_routes_to_originator_only() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        let mut peer = broker.attach(ClientId::Peer(1));

        broker.client_line(
            ClientId::Peer(1),
            r#"{"jsonrpc":"2.0","id":50,"method":"session/prompt","params":{"sessionId":"sess-1"}}"#,
        );
        let fwd = broker.agent_recv().await;
        broker.agent_msg(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"stopReason":"end_turn"}}}}"#,
            fwd["id"]
        ));

        let reply = recv_json(&mut peer).await;
        assert_eq!(reply["id"], json!(50));
        assert_eq!(reply["result"]["stopReason"], json!("end_turn"));

        // Primary sees updates, never the peer's reply. A follow-up update
        // proves the broker has moved past the reply.
        broker.agent_msg(&update_notification(9));
        let next = recv_json(&mut primary).await;
        assert_eq!(next["method"], json!("session/update"));
    }

    #[tokio::test]
    async fn test_reply_for_unknown_id_dropped() {
        let broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);

        broker.agent_msg(r#"{"jsonrpc":"2.0","id":777,"result":{"stale":true}}"#);
        broker.agent_msg(&update_notification(1));
        let next = recv_json(&mut primary).await;
        assert_eq!(next["method"], json!("session/update"));
    }

    #[tokio::test]
    async fn test_reply_to_disconnected_client_dropped() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        let _peer = broker.attach(ClientId::Peer(1));

        broker.client_line(
            ClientId::Peer(1),
            r#"{"jsonrpc":"2.0","id":50,"method":"session/prompt","params":{}}"#,
        );
        let fwd = broker.agent_recv().await;
        broker
            .events
            .send(BrokerEvent::ClientClosed {
                client: ClientId::Peer(1),
            })
            .unwrap();
        broker.agent_msg(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"stopReason":"end_turn"}}}}"#,
            fwd["id"]
        ));

        // The reply vanishes; the stream stays healthy.
        broker.agent_msg(&update_notification(1));
        let next = recv_json(&mut primary).await;
        assert_eq!(next["method"], json!("session/update"));
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);

        broker.client_line(ClientId::Primary, r#"{"jsonrpc":"2.0","id":4}"#);
        let reply = recv_json(&mut primary).await;
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["id"], json!(4));
    }

    #[tokio::test]
    async fn test_unparsable_line_rejected() {
        let broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);

        broker.client_line(ClientId::Primary, "this is not json");
        let reply = recv_json(&mut primary).await;
        assert_eq!(reply["error"]["code"], json!(-32700));
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_client_notification_passes_through_verbatim() {
        let mut broker = start_broker();
        let _primary = broker.attach(ClientId::Primary);

        broker.client_line(
            ClientId::Primary,
            r#"{"jsonrpc":"2.0","method":"session/cancel","params":{"sessionId":"sess-1"},"_meta":{"x":1}}"#,
        );
        let fwd = broker.agent_recv().await;
        assert_eq!(fwd["method"], json!("session/cancel"));
        assert_eq!(fwd["_meta"]["x"], json!(1));
        assert!(fwd.get("id").is_none());
    }

    #[tokio::test]
    async fn test_reverse_request_goes_to_responder() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        let mut peer = broker.attach(ClientId::Peer(1));

        broker.agent_msg(
            r#"{"jsonrpc":"2.0","id":"srv-1","method":"session/request_permission","params":{"options":[]}}"#,
        );
        let req = recv_json(&mut primary).await;
        assert_eq!(req["id"], json!("srv-1"));
        assert_eq!(req["method"], json!("session/request_permission"));

        // Only the responder got it.
        broker.agent_msg(&update_notification(1));
        let next = recv_json(&mut peer).await;
        assert_eq!(next["method"], json!("session/update"));

        // The responder's answer crosses id-unchanged.
        broker.client_line(
            ClientId::Primary,
            r#"{"jsonrpc":"2.0","id":"srv-1","result":{"outcome":{"outcome":"selected","optionId":"allow"}}}"#,
        );
        let answer = broker.agent_recv().await;
        assert_eq!(answer["id"], json!("srv-1"));
        assert_eq!(answer["result"]["outcome"]["outcome"], json!("selected"));
    }

    #[tokio::test]
    async fn test_reverse_reply_from_bystander_dropped() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        let _peer = broker.attach(ClientId::Peer(1));

        broker.agent_msg(
            r#"{"jsonrpc":"2.0","id":"srv-2","method":"session/request_permission","params":{}}"#,
        );
        let _ = recv_json(&mut primary).await;

        broker.client_line(
            ClientId::Peer(1),
            r#"{"jsonrpc":"2.0","id":"srv-2","result":{"outcome":"spoofed"}}"#,
        );
        // Prove the spoofed answer never crossed: the next thing the agent
        // sees is a genuine request.
        broker.client_line(
            ClientId::Primary,
            r#"{"jsonrpc":"2.0","id":9,"method":"session/prompt","params":{}}"#,
        );
        let next = broker.agent_recv().await;
        assert_eq!(next["method"], json!("session/prompt"));
    }

    #[tokio::test]
    async fn test_no_responder_refuses_agent_request() {
        let mut broker = start_broker();
        broker.agent_msg(
            r#"{"jsonrpc":"2.0","id":"srv-3","method":"session/request_permission","params":{}}"#,
        );
        let refusal = broker.agent_recv().await;
        assert_eq!(refusal["id"], json!("srv-3"));
        assert_eq!(refusal["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn test_responder_promotion_on_disconnect() {
        let broker = start_broker();
        let _primary = broker.attach(ClientId::Primary);
        let mut peer = broker.attach(ClientId::Peer(1));

        broker
            .events
            .send(BrokerEvent::ClientClosed {
                client: ClientId::Primary,
            })
            .unwrap();

        broker.agent_msg(
            r#"{"jsonrpc":"2.0","id":"srv-4","method":"session/request_permission","params":{}}"#,
        );
        let req = recv_json(&mut peer).await;
        assert_eq!(req["id"], json!("srv-4"));
    }

    #[tokio::test]
    async fn test_responder_death_settles_outstanding_reverse_calls() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);

        broker.agent_msg(
            r#"{"jsonrpc":"2.0","id":"srv-5","method":"session/request_permission","params":{}}"#,
        );
        let _ = recv_json(&mut primary).await;

        broker
            .events
            .send(BrokerEvent::ClientClosed {
                client: ClientId::Primary,
            })
            .unwrap();
        let refusal = broker.agent_recv().await;
        assert_eq!(refusal["id"], json!("srv-5"));
        assert_eq!(refusal["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn test_slow_reader_detached_others_unaffected() {
        let mut broker = start_broker();
        let mut primary = broker.attach(ClientId::Primary);
        // A peer that never reads, with room for only 2 frames.
        let slow_rx = broker.attach_with_capacity(ClientId::Peer(1), 2);

        for n in 1..=5 {
            broker.agent_msg(&update_notification(n));
        }
        for n in 1..=5 {
            let msg = recv_json(&mut primary).await;
            assert_eq!(
                msg["params"]["update"]["content"]["text"],
                json!(format!("chunk-{n}"))
            );
        }
        // The slow peer got at most its queue capacity before being dropped.
        drop(slow_rx);

        // Routing still works end to end.
        broker.client_line(
            ClientId::Primary,
            r#"{"jsonrpc":"2.0","id":3,"method":"session/prompt","params":{}}"#,
        );
        let fwd = broker.agent_recv().await;
        assert_eq!(fwd["method"], json!("session/prompt"));
    }

    #[tokio::test]
    async fn test_lines_from_detached_client_ignored() {
        let mut broker = start_broker();
        let _primary = broker.attach(ClientId::Primary);

        broker
            .events
            .send(BrokerEvent::ClientClosed {
                client: ClientId::Peer(1),
            })
            .unwrap();
        broker.client_line(
            ClientId::Peer(1),
            r#"{"jsonrpc":"2.0","id":1,"method":"session/prompt","params":{}}"#,
        );
        broker.client_line(
            ClientId::Primary,
            r#"{"jsonrpc":"2.0","id":1,"method":"session/prompt","params":{}}"#,
        );
        // Only the live client's request reaches the agent.
        let fwd = broker.agent_recv().await;
        assert_eq!(fwd["id"], json!(1));
        assert!(matches!(broker.agent_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_agent_exit_stops_the_broker() {
        let broker = start_broker();
        broker
            .events
            .send(BrokerEvent::AgentExited { code: 3 })
            .unwrap();
        assert_eq!(
            broker.handle.await.unwrap(),
            BrokerExit::AgentExited { code: 3 }
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_the_broker() {
        let broker = start_broker();
        broker
            .events
            .send(BrokerEvent::Shutdown { signal: 15 })
            .unwrap();
        assert_eq!(
            broker.handle.await.unwrap(),
            BrokerExit::Signalled { signal: 15 }
        );
    }
}
