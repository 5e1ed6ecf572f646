//! Database-native notification listener.
//!
//! One dedicated connection per channel, `LISTEN network_<cid>` /
//! `LISTEN member_<cid>`, blocking receive with a 5 second timeout so the
//! loop can observe shutdown. Payloads are JSON `{old_val, new_val}`
//! envelopes produced by triggers on the record tables.
//!
//! A lost connection is re-established with a short backoff; NOTIFY delivery
//! is at-most-once on a given connection, and missed changes are repaired by
//! the equality short-circuit the next time the record moves.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgListener, PgPool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::ControllerDb;

use super::{dispatch_member, dispatch_network, ChangeEnvelope, ListenerHandle, ListenerKind};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Spawn the two channel consumers and return their handle.
pub fn start(db: Arc<ControllerDb>, pool: PgPool, controller_id: &str) -> ListenerHandle {
    let cancel = CancellationToken::new();
    let tasks: Vec<JoinHandle<()>> = [ListenerKind::Network, ListenerKind::Member]
        .into_iter()
        .map(|kind| {
            let channel = match kind {
                ListenerKind::Network => format!("network_{controller_id}"),
                ListenerKind::Member => format!("member_{controller_id}"),
            };
            tokio::spawn(listen_loop(
                db.clone(),
                pool.clone(),
                channel,
                kind,
                cancel.clone(),
            ))
        })
        .collect();
    ListenerHandle::new(cancel, tasks)
}

async fn listen_loop(
    db: Arc<ControllerDb>,
    pool: PgPool,
    channel: String,
    kind: ListenerKind,
    cancel: CancellationToken,
) {
    info!(channel = %channel, "database notification listener starting");

    'reconnect: while !cancel.is_cancelled() {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(l) => l,
            Err(e) => {
                warn!(channel = %channel, error = %e, "listener connection failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue 'reconnect,
                }
            }
        };
        if let Err(e) = listener.listen(&channel).await {
            warn!(channel = %channel, error = %e, "LISTEN failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => break 'reconnect,
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue 'reconnect,
            }
        }

        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => break 'reconnect,
                recv = tokio::time::timeout(RECV_TIMEOUT, listener.recv()) => recv,
            };
            match notification {
                Err(_elapsed) => continue, // timeout tick; lets shutdown run
                Ok(Err(e)) => {
                    warn!(channel = %channel, error = %e, "notification connection lost, reconnecting");
                    continue 'reconnect;
                }
                Ok(Ok(notification)) => {
                    handle_payload(&db, kind, notification.payload()).await;
                }
            }
        }
    }

    info!(channel = %channel, "database notification listener stopped");
}

async fn handle_payload(db: &Arc<ControllerDb>, kind: ListenerKind, payload: &str) {
    debug!(kind = kind.as_str(), payload_len = payload.len(), "notification received");

    let Some(envelope) = ChangeEnvelope::from_json(payload, "old_val", "new_val") else {
        warn!(kind = kind.as_str(), "dropping malformed notification payload");
        crate::metrics::record_notification("pgsql", kind.as_str(), "malformed");
        return;
    };

    let ok = match kind {
        ListenerKind::Network => dispatch_network(db, envelope).await,
        ListenerKind::Member => dispatch_member(db, envelope).await,
    };
    crate::metrics::record_notification("pgsql", kind.as_str(), if ok { "success" } else { "malformed" });
}
