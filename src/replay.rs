//! Replay log: the cached session prelude handed to late-joining clients.
//!
//! The log has two fixed slots and a growing tail, mirroring how an ACP
//! session comes into being: the agent's `initialize` reply, its
//! `session/new` reply, and every `session/update` notification since. A
//! client that attaches mid-session receives exactly this sequence before any
//! live traffic, which is enough to rebuild the UI state the earlier clients
//! already have.
//!
//! Cached replies keep the request id from the original exchange; the
//! short-circuit path in the broker rebinds the stored `result` to whatever
//! id a later caller used. Nothing here is persisted — the log lives and dies
//! with the process.

use serde_json::Value;

use crate::jsonrpc::Envelope;

/// A cached agent reply: the original requester's id plus the `result`.
#[derive(Debug, Clone)]
pub struct CachedReply {
    pub id: Value,
    pub result: Value,
}

/// Ordered record of the session-defining messages. Append-only.
#[derive(Debug, Default)]
pub struct ReplayLog {
    init: Option<CachedReply>,
    session: Option<CachedReply>,
    /// Pre-framed `session/update` lines in agent-receive order.
    updates: Vec<String>,
}

impl ReplayLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_reply(&self) -> Option<&CachedReply> {
        self.init.as_ref()
    }

    pub fn session_reply(&self) -> Option<&CachedReply> {
        self.session.as_ref()
    }

    /// Record the agent's `initialize` result. The agent is only ever asked
    /// once, so a second recording indicates a routing bug; first wins.
    pub fn record_init(&mut self, id: Value, result: Value) {
        if self.init.is_some() {
            log::warn!("initialize reply already cached, keeping the first");
            return;
        }
        self.init = Some(CachedReply { id, result });
    }

    /// Record the agent's `session/new` result. First wins, as above.
    pub fn record_session(&mut self, id: Value, result: Value) {
        if self.session.is_some() {
            log::warn!("session/new reply already cached, keeping the first");
            return;
        }
        self.session = Some(CachedReply { id, result });
    }

    /// Append a `session/update` notification (already framed).
    pub fn push_update(&mut self, line: String) {
        self.updates.push(line);
    }

    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    /// The full prelude for a newly attached client, in order: cached
    /// `initialize` reply, cached `session/new` reply, then every recorded
    /// update.
    pub fn snapshot_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(2 + self.updates.len());
        if let Some(init) = &self.init {
            lines.push(Envelope::reply(init.id.clone(), init.result.clone()).to_line());
        }
        if let Some(session) = &self.session {
            lines.push(Envelope::reply(session.id.clone(), session.result.clone()).to_line());
        }
        lines.extend(self.updates.iter().cloned());
        lines
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
