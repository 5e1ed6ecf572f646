// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key-value status sink.
//!
//! One atomic pipeline per flush maintains the online-presence views other
//! services read directly from the cache:
//!
//! - `nodes-online:{cid}` — sorted set of member ids scored by last-seen
//! - `nodes-online2:{cid}` — sorted set keyed `<network>-<member>`
//! - `network-nodes-online:{cid}:<network>` — per-network sorted set
//! - `active-networks:{cid}` — sorted set of networks with recent check-ins
//! - `network-nodes-all:{cid}:<network>` — set of all members ever seen
//! - `member:{cid}:<network>:<member>` — hash of the latest status record
//!
//! Every key carries the `{cid}` hash tag, so a cluster routes the whole
//! flush to one shard and the MULTI/EXEC stays atomic. Entries older than
//! five minutes are trimmed from each sorted set at flush time.

use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::liveness::now_ms;

use super::{PendingStatusEntry, StatusSink};

/// Presence entries expire out of the sorted sets after five minutes.
const ONLINE_EXPIRY_MS: i64 = 300_000;

pub struct RedisStatusSink {
    connection: ConnectionManager,
    controller_id: String,
    pending: Mutex<Vec<PendingStatusEntry>>,
}

impl RedisStatusSink {
    pub fn new(connection: ConnectionManager, controller_id: &str) -> Self {
        Self {
            connection,
            controller_id: controller_id.to_string(),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn build_pipeline(cid: &str, to_write: &[PendingStatusEntry]) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();

        let mut networks_updated: BTreeSet<String> = BTreeSet::new();
        for entry in to_write {
            let network_id = entry.network_id.to_string();
            let member_id = entry.member_id.to_string();
            let record = [
                ("id", member_id.clone()),
                ("address", entry.ip_string()),
                ("last_updated", entry.last_seen.to_string()),
                ("os", entry.os.clone()),
                ("arch", entry.arch.clone()),
                ("version", entry.version.clone()),
            ];

            pipe.zadd(format!("nodes-online:{{{cid}}}"), &member_id, entry.last_seen)
                .ignore()
                .zadd(
                    format!("nodes-online2:{{{cid}}}"),
                    format!("{network_id}-{member_id}"),
                    entry.last_seen,
                )
                .ignore()
                .zadd(
                    format!("network-nodes-online:{{{cid}}}:{network_id}"),
                    &member_id,
                    entry.last_seen,
                )
                .ignore()
                .zadd(format!("active-networks:{{{cid}}}"), &network_id, entry.last_seen)
                .ignore()
                .sadd(format!("network-nodes-all:{{{cid}}}:{network_id}"), &member_id)
                .ignore()
                .hset_multiple(format!("member:{{{cid}}}:{network_id}:{member_id}"), &record)
                .ignore();

            networks_updated.insert(network_id);
        }

        let expire_before = now_ms() - ONLINE_EXPIRY_MS;
        pipe.zrembyscore(format!("nodes-online:{{{cid}}}"), "-inf", expire_before)
            .ignore()
            .zrembyscore(format!("nodes-online2:{{{cid}}}"), "-inf", expire_before)
            .ignore()
            .zrembyscore(format!("active-networks:{{{cid}}}"), "-inf", expire_before)
            .ignore();
        for network_id in &networks_updated {
            pipe.zrembyscore(
                format!("network-nodes-online:{{{cid}}}:{network_id}"),
                "-inf",
                expire_before,
            )
            .ignore();
        }

        pipe
    }
}

#[async_trait]
impl StatusSink for RedisStatusSink {
    fn update_node_status(&self, entry: PendingStatusEntry) {
        self.pending.lock().push(entry);
    }

    fn queue_length(&self) -> usize {
        self.pending.lock().len()
    }

    async fn write_pending(&self) {
        let to_write = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        if to_write.is_empty() {
            return;
        }

        let flush_start = std::time::Instant::now();
        let pipe = Self::build_pipeline(&self.controller_id, &to_write);
        let mut conn = self.connection.clone();
        match pipe.query_async::<()>(&mut conn).await {
            Ok(()) => {
                crate::metrics::record_status_flush("redis", to_write.len(), flush_start.elapsed());
                debug!(
                    controller_id = %self.controller_id,
                    updated = to_write.len(),
                    "member status flushed to cache"
                );
            }
            Err(e) => {
                warn!(error = %e, dropped = to_write.len(), "status flush to cache failed, dropping batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{MemberId, NetworkId};

    fn entry(n: u64, m: u64, seen: i64) -> PendingStatusEntry {
        PendingStatusEntry {
            network_id: NetworkId(n),
            member_id: MemberId(m),
            os: "linux".into(),
            arch: "x86_64".into(),
            version: "1.14.0".into(),
            address: Some("1.2.3.4:9993".parse().unwrap()),
            last_seen: seen,
        }
    }

    #[test]
    fn test_pipeline_covers_all_views() {
        let entries = vec![entry(0x8056, 0xa1, 1000), entry(0x8056, 0xa2, 2000)];
        let pipe = RedisStatusSink::build_pipeline("deadbeef01", &entries);
        let wire = String::from_utf8_lossy(&pipe.get_packed_pipeline()).to_string();

        assert!(wire.contains("nodes-online:{deadbeef01}"));
        assert!(wire.contains("nodes-online2:{deadbeef01}"));
        assert!(wire.contains("network-nodes-online:{deadbeef01}:0000000000008056"));
        assert!(wire.contains("active-networks:{deadbeef01}"));
        assert!(wire.contains("network-nodes-all:{deadbeef01}:0000000000008056"));
        assert!(wire.contains("member:{deadbeef01}:0000000000008056:00000000a1"));
        // Composite view keys entries as "<network>-<member>".
        assert!(wire.contains("0000000000008056-00000000a1"));
        // Trims stale presence entries for every touched view.
        assert!(wire.contains("ZREMRANGEBYSCORE"));
        // MULTI/EXEC wrapping keeps the flush atomic on one shard.
        assert!(wire.contains("MULTI"));
        assert!(wire.contains("EXEC"));
    }

    #[test]
    fn test_empty_batch_builds_trim_only_pipeline() {
        let pipe = RedisStatusSink::build_pipeline("deadbeef01", &[]);
        let wire = String::from_utf8_lossy(&pipe.get_packed_pipeline()).to_string();
        assert!(!wire.contains("member:{deadbeef01}"));
        assert!(wire.contains("ZREMRANGEBYSCORE"));
    }
}
