// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream-based notification listener.
//!
//! Consumes `network-stream:{<cid>}` and `member-stream:{<cid>}`. Each
//! entry carries the JSON `{old, new}` envelope in its `payload` field.
//! Consumption starts from id `"0"` so anything still parked in the stream
//! from a previous run is replayed; re-applying a change we already hold is
//! a no-op thanks to the save-side equality short-circuit. An entry is
//! acknowledged by deleting it from the stream once dispatched.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::ControllerDb;

use super::{dispatch_member, dispatch_network, ChangeEnvelope, ListenerHandle, ListenerKind};

const BLOCK_MS: usize = 5_000;
const READ_COUNT: usize = 64;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Spawn the two stream consumers and return their handle.
///
/// Each consumer owns a dedicated connection: XREAD BLOCK parks the
/// connection it runs on, so the consumers must not share the managed
/// connection the rest of the crate multiplexes over.
pub fn start(db: Arc<ControllerDb>, client: redis::Client, controller_id: &str) -> ListenerHandle {
    let cancel = CancellationToken::new();
    let tasks: Vec<JoinHandle<()>> = [ListenerKind::Network, ListenerKind::Member]
        .into_iter()
        .map(|kind| {
            let stream_key = match kind {
                ListenerKind::Network => format!("network-stream:{{{controller_id}}}"),
                ListenerKind::Member => format!("member-stream:{{{controller_id}}}"),
            };
            tokio::spawn(consume_loop(
                db.clone(),
                client.clone(),
                stream_key,
                kind,
                cancel.clone(),
            ))
        })
        .collect();
    ListenerHandle::new(cancel, tasks)
}

async fn consume_loop(
    db: Arc<ControllerDb>,
    client: redis::Client,
    stream_key: String,
    kind: ListenerKind,
    cancel: CancellationToken,
) {
    info!(stream = %stream_key, "stream notification listener starting");

    let mut connection = loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(connection) => break connection,
            Err(e) => {
                warn!(stream = %stream_key, error = %e, "listener connection failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                }
            }
        }
    };

    // Replay from the beginning: whatever is still in the stream was not
    // acknowledged by anyone.
    let mut last_id = "0".to_string();

    while !cancel.is_cancelled() {
        let opts = StreamReadOptions::default().block(BLOCK_MS).count(READ_COUNT);
        let stream_keys = [&stream_key];
        let last_ids = [&last_id];
        let reply: Result<StreamReadReply, redis::RedisError> = tokio::select! {
            _ = cancel.cancelled() => break,
            reply = connection.xread_options(&stream_keys, &last_ids, &opts) => reply,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!(stream = %stream_key, error = %e, "stream read failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_BACKOFF) => continue,
                }
            }
        };

        for stream in reply.keys {
            for entry in stream.ids {
                last_id = entry.id.clone();

                let payload: Option<String> = entry
                    .map
                    .get("payload")
                    .and_then(|v| redis::from_redis_value(v).ok());

                match payload {
                    Some(payload) => handle_payload(&db, kind, &payload).await,
                    None => {
                        warn!(stream = %stream_key, id = %entry.id, "stream entry without payload field");
                        crate::metrics::record_notification("redis", kind.as_str(), "malformed");
                    }
                }

                // Ack by deleting the consumed entry.
                let deleted: Result<i64, redis::RedisError> =
                    connection.xdel(&stream_key, &[&entry.id]).await;
                if let Err(e) = deleted {
                    warn!(stream = %stream_key, id = %entry.id, error = %e, "failed to ack stream entry");
                }
            }
        }
    }

    info!(stream = %stream_key, "stream notification listener stopped");
}

async fn handle_payload(db: &Arc<ControllerDb>, kind: ListenerKind, payload: &str) {
    debug!(kind = kind.as_str(), payload_len = payload.len(), "stream notification received");

    let Some(envelope) = ChangeEnvelope::from_json(payload, "old", "new") else {
        warn!(kind = kind.as_str(), "dropping malformed stream payload");
        crate::metrics::record_notification("redis", kind.as_str(), "malformed");
        return;
    };

    let ok = match kind {
        ListenerKind::Network => dispatch_network(db, envelope).await,
        ListenerKind::Member => dispatch_member(db, envelope).await,
    };
    crate::metrics::record_notification("redis", kind.as_str(), if ok { "success" } else { "malformed" });
}
