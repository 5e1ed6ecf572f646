// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-notification listeners.
//!
//! Three interchangeable transports deliver `{old, new}` change envelopes
//! produced elsewhere (a peer controller, the central API, a database
//! trigger). Whatever the transport, the dispatch is the same and re-enters
//! the façade through the ordinary write-behind path:
//!
//! - `old` and `new` → [`save`](crate::db::ControllerDb::save)
//! - only `new`      → `save` (insert)
//! - only `old`      → `erase_network` / `erase_member`
//! - neither         → no-op
//!
//! Reusing `save` means an externally-originated change and a local one are
//! indistinguishable downstream: one commit, one fan-out event. The
//! field-equality short-circuit in `save` is also what terminates the echo
//! when our own committed change comes back around on the stream.
//!
//! Malformed payloads are dropped with a log line and still acknowledged;
//! a payload that cannot be parsed now will not parse later either.

pub mod pgsql;
pub mod pubsub;
pub mod redis;

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::ControllerDb;
use crate::record::{MemberId, MemberRecord, NetworkId, NetworkRecord, RecordObject};

/// Which record kind a listener instance watches. Every transport runs one
/// listener per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Network,
    Member,
}

impl ListenerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Member => "member",
        }
    }
}

/// Handle over the background tasks a listener variant spawned.
pub struct ListenerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn new(cancel: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { cancel, tasks }
    }

    /// Cancel the consumers and wait for them to wind down.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// A decoded change envelope, transport-independent.
#[derive(Debug, Clone, Default)]
pub struct ChangeEnvelope {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl ChangeEnvelope {
    /// Parse a JSON payload carrying the envelope under the given keys
    /// (`old_val`/`new_val` on the database channel, `old`/`new` elsewhere).
    pub fn from_json(payload: &str, old_key: &str, new_key: &str) -> Option<Self> {
        let doc: Value = serde_json::from_str(payload).ok()?;
        if !doc.is_object() {
            return None;
        }
        let pick = |key: &str| doc.get(key).filter(|v| v.is_object()).cloned();
        Some(Self {
            old: pick(old_key),
            new: pick(new_key),
        })
    }

    pub fn is_noop(&self) -> bool {
        self.old.is_none() && self.new.is_none()
    }
}

/// Feed one network envelope into the façade.
pub(crate) async fn dispatch_network(db: &Arc<ControllerDb>, envelope: ChangeEnvelope) -> bool {
    if envelope.is_noop() {
        return true;
    }
    if let Some(new) = envelope.new.as_ref() {
        let Some(rec) = NetworkRecord::from_json(new) else {
            return false;
        };
        db.save(RecordObject::Network(rec), db.is_ready());
        return true;
    }
    // Deletion: only "old" present.
    let id = envelope
        .old
        .as_ref()
        .and_then(|old| old.get("id"))
        .and_then(Value::as_str)
        .and_then(NetworkId::parse);
    match id {
        Some(network_id) => {
            db.erase_network(network_id).await;
            true
        }
        None => false,
    }
}

/// Feed one member envelope into the façade.
pub(crate) async fn dispatch_member(db: &Arc<ControllerDb>, envelope: ChangeEnvelope) -> bool {
    if envelope.is_noop() {
        return true;
    }
    if let Some(new) = envelope.new.as_ref() {
        let Some(rec) = MemberRecord::from_json(new) else {
            return false;
        };
        db.save(RecordObject::Member(rec), db.is_ready());
        return true;
    }
    let old = envelope.old.as_ref();
    let network_id = old
        .and_then(|v| v.get("nwid"))
        .and_then(Value::as_str)
        .and_then(NetworkId::parse);
    let member_id = old
        .and_then(|v| v.get("id"))
        .and_then(Value::as_str)
        .and_then(MemberId::parse);
    match (network_id, member_id) {
        (Some(network_id), Some(member_id)) => {
            db.erase_member(network_id, member_id).await;
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_both_sides() {
        let payload = json!({
            "old_val": {"id": "8056c2e21c24673d", "name": "old"},
            "new_val": {"id": "8056c2e21c24673d", "name": "new"},
        })
        .to_string();
        let env = ChangeEnvelope::from_json(&payload, "old_val", "new_val").unwrap();
        assert!(env.old.is_some());
        assert!(env.new.is_some());
        assert!(!env.is_noop());
    }

    #[test]
    fn test_envelope_null_sides_are_absent() {
        let payload = json!({"old": null, "new": {"id": "8056c2e21c24673d"}}).to_string();
        let env = ChangeEnvelope::from_json(&payload, "old", "new").unwrap();
        assert!(env.old.is_none());
        assert!(env.new.is_some());
    }

    #[test]
    fn test_envelope_both_null_is_noop() {
        let payload = json!({"old": null, "new": null}).to_string();
        let env = ChangeEnvelope::from_json(&payload, "old", "new").unwrap();
        assert!(env.is_noop());
    }

    #[test]
    fn test_envelope_garbage_payload() {
        assert!(ChangeEnvelope::from_json("not json at all", "old", "new").is_none());
        assert!(ChangeEnvelope::from_json("[1,2,3]", "old", "new").is_none());
    }

    #[test]
    fn test_envelope_non_object_sides_ignored() {
        let payload = json!({"old": "string", "new": 42}).to_string();
        let env = ChangeEnvelope::from_json(&payload, "old", "new").unwrap();
        assert!(env.is_noop());
    }
}
