// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commit workers.
//!
//! A fixed pool of identical workers drains the write-behind queue. Each
//! item is one store mutation plus its follow-through: re-read the cache for
//! the pre-commit "old", install the committed record, fan the delta out to
//! change handlers, and maintain the cache-side indexes.
//!
//! Store errors are logged and the item is dropped — no retry. The queue is
//! the only durability layer; convergence after an outage is re-established
//! by the external notification stream, and callers that need certainty
//! re-save.
//!
//! Commits for the same id are not serialized across workers; the store
//! upsert is last-writer-wins and the caller layer serializes per-id
//! changes.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::record::{CommitItem, MemberId, MemberRecord, NetworkId, NetworkRecord};

use super::ControllerDb;

pub(super) async fn commit_worker(db: Arc<ControllerDb>, worker: usize) {
    info!(worker, "commit worker started");
    while let Some((item, notify)) = db.commit_queue.get().await {
        crate::metrics::set_commit_queue_depth(db.commit_queue.len());
        match item {
            CommitItem::Network(rec) => commit_network(&db, rec, notify).await,
            CommitItem::Member(rec) => commit_member(&db, rec, notify).await,
            CommitItem::DeleteNetwork(network_id) => delete_network(&db, network_id).await,
            CommitItem::DeleteMember(network_id, member_id) => {
                delete_member(&db, network_id, member_id).await
            }
        }
    }
    info!(worker, "commit worker stopped");
}

async fn commit_network(db: &Arc<ControllerDb>, rec: NetworkRecord, notify: bool) {
    let started = Instant::now();
    let Some(network_id) = rec.id else { return };

    if let Err(e) = db.store.upsert_network(&rec, db.controller_id()).await {
        warn!(network_id = %network_id, error = %e, "network commit failed");
        crate::metrics::record_commit("network", "error");
        return;
    }

    let old = db.insert_network_cache(rec.clone());
    if notify {
        db.notify_network_changed(old.as_ref(), Some(&rec));
    }

    if db.redis_member_status {
        if let Some(connection) = db.redis.clone() {
            let key = format!("networks:{{{}}}", db.controller_id());
            let mut conn = connection;
            let result: Result<i64, redis::RedisError> =
                redis::cmd("SADD").arg(&key).arg(network_id.to_string()).query_async(&mut conn).await;
            if let Err(e) = result {
                warn!(network_id = %network_id, error = %e, "failed to index network in cache");
            }
        }
    }

    crate::metrics::record_commit("network", "success");
    crate::metrics::record_commit_latency("network", started.elapsed());
}

async fn commit_member(db: &Arc<ControllerDb>, rec: MemberRecord, notify: bool) {
    let started = Instant::now();
    let (Some(network_id), Some(member_id)) = (rec.nwid, rec.id) else {
        return;
    };

    // A membership can only hang off a network Central knows about; changes
    // racing a network deletion get dropped here.
    match db.store.network_exists(network_id).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(network_id = %network_id, member_id = %member_id,
                "network does not exist, skipping member commit");
            crate::metrics::record_commit("member", "skipped");
            return;
        }
        Err(e) => {
            warn!(network_id = %network_id, error = %e, "network existence check failed");
            crate::metrics::record_commit("member", "error");
            return;
        }
    }

    let is_new_member = match db.store.member_exists(network_id, member_id).await {
        Ok(exists) => !exists,
        Err(e) => {
            warn!(network_id = %network_id, member_id = %member_id, error = %e,
                "member existence check failed");
            crate::metrics::record_commit("member", "error");
            return;
        }
    };

    if let Err(e) = db.store.upsert_member(&rec).await {
        warn!(network_id = %network_id, member_id = %member_id, error = %e, "member commit failed");
        crate::metrics::record_commit("member", "error");
        return;
    }

    if !is_new_member {
        if let Err(e) = db.store.delete_stale_ip_assignments(network_id, member_id).await {
            warn!(network_id = %network_id, member_id = %member_id, error = %e,
                "stale ip assignment cleanup failed");
        }
    } else if let Some(hook) = &db.member_joined {
        hook.notify_network_joined(network_id, member_id);
    }

    let old = db.insert_member_cache(rec.clone());
    if notify {
        db.notify_member_changed(old.as_ref(), Some(&rec));
    }

    crate::metrics::record_commit("member", "success");
    crate::metrics::record_commit_latency("member", started.elapsed());
}

async fn delete_network(db: &Arc<ControllerDb>, network_id: NetworkId) {
    let started = Instant::now();

    if let Err(e) = db.store.delete_network(network_id).await {
        warn!(network_id = %network_id, error = %e, "network deletion failed");
        crate::metrics::record_commit("delete_network", "error");
        return;
    }

    // The deletion event already fired from erase_network; here we only
    // retire the committed view.
    db.remove_network_cache(network_id);

    if db.redis_member_status {
        if let Some(connection) = db.redis.clone() {
            let cid = db.controller_id();
            let mut pipe = redis::pipe();
            pipe.srem(format!("networks:{{{cid}}}"), network_id.to_string())
                .ignore()
                .del(format!("network-nodes-online:{{{cid}}}:{network_id}"))
                .ignore();
            let mut conn = connection;
            if let Err(e) = pipe.query_async::<()>(&mut conn).await {
                warn!(network_id = %network_id, error = %e, "failed to drop network cache indexes");
            }
        }
    }

    crate::metrics::record_commit("delete_network", "success");
    crate::metrics::record_commit_latency("delete_network", started.elapsed());
}

async fn delete_member(db: &Arc<ControllerDb>, network_id: NetworkId, member_id: MemberId) {
    let started = Instant::now();

    if let Err(e) = db.store.delete_member(network_id, member_id).await {
        warn!(network_id = %network_id, member_id = %member_id, error = %e, "member deletion failed");
        crate::metrics::record_commit("delete_member", "error");
        return;
    }

    db.remove_member_cache(network_id, member_id);

    if db.redis_member_status {
        if let Some(connection) = db.redis.clone() {
            let cid = db.controller_id();
            let mut pipe = redis::pipe();
            pipe.srem(
                format!("network-nodes-all:{{{cid}}}:{network_id}"),
                member_id.to_string(),
            )
            .ignore()
            .del(format!("member:{{{cid}}}:{network_id}:{member_id}"))
            .ignore();
            let mut conn = connection;
            if let Err(e) = pipe.query_async::<()>(&mut conn).await {
                warn!(network_id = %network_id, member_id = %member_id, error = %e,
                    "failed to drop member cache indexes");
            }
        }
    }

    crate::metrics::record_commit("delete_member", "success");
    crate::metrics::record_commit_latency("delete_member", started.elapsed());
}
