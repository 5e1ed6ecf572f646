//! Relational status sink.
//!
//! Flushes the pending buffer as one transaction: a per-entry upsert keyed
//! (device_id, network_id), skipping entries whose membership has vanished
//! since the report was buffered. A failed flush rolls back, logs, and drops
//! the batch.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::store::PgStore;

use super::{PendingStatusEntry, StatusSink};

pub struct PostgresStatusSink {
    store: PgStore,
    pending: Mutex<Vec<PendingStatusEntry>>,
}

impl PostgresStatusSink {
    pub fn new(store: PgStore) -> Self {
        Self {
            store,
            pending: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StatusSink for PostgresStatusSink {
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
        let mut tx = match self.store.pool().begin().await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, dropped = to_write.len(), "status flush could not open a transaction");
                return;
            }
        };

        let mut written = 0usize;
        let mut skipped = 0usize;
        for entry in &to_write {
            let network_id = entry.network_id.to_string();
            let member_id = entry.member_id.to_string();

            match self.store.membership_exists(&network_id, &member_id).await {
                Ok(true) => {}
                Ok(false) => {
                    skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, network_id = %network_id, member_id = %member_id,
                        "membership pre-check failed, skipping entry");
                    skipped += 1;
                    continue;
                }
            }

            if let Err(e) = self
                .store
                .upsert_member_status(
                    &mut tx,
                    &network_id,
                    &member_id,
                    &entry.os,
                    &entry.arch,
                    &entry.version,
                    &entry.ip_string(),
                    entry.last_seen,
                )
                .await
            {
                warn!(error = %e, dropped = to_write.len(), "status flush failed, dropping batch");
                return;
            }
            written += 1;
        }

        if let Err(e) = tx.commit().await {
            warn!(error = %e, dropped = to_write.len(), "status flush commit failed, dropping batch");
            return;
        }

        crate::metrics::record_status_flush("pgsql", written, flush_start.elapsed());
        debug!(written, skipped, "member status flushed to store");
    }
}
