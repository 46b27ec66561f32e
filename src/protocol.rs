//! The slice of ACP the broker understands by name.
//!
//! Everything else on the wire is forwarded opaquely; these three methods
//! drive the replay log, and the helpers pull out the couple of fields worth
//! logging.

use serde_json::Value;

use crate::jsonrpc::Envelope;

/// Handshake request answered once per broker lifetime, then served from
/// cache.
pub const INITIALIZE: &str = "initialize";

/// Session-creating request, cached the same way so every client shares the
/// one real session.
pub const SESSION_NEW: &str = "session/new";

/// Streaming notification recorded for replay and fanned out to every
/// client.
pub const SESSION_UPDATE: &str = "session/update";

/// The `sessionUpdate` discriminator inside a `session/update` notification.
pub fn update_kind(msg: &Envelope) -> Option<&str> {
    msg.params()?.get("update")?.get("sessionUpdate")?.as_str()
}

/// The `sessionId` inside a `session/new` result.
pub fn session_id(result: &Value) -> Option<&str> {
    result.get("sessionId")?.as_str()
}
