//! Wide-column status sink.
//!
//! One row per `<network>#<member>`. Each flush reads the current row with a
//! latest-cell-only filter and writes only the columns whose values changed,
//! plus an unconditional `last_seen` cell. Write amplification on a
//! wide-column store is priced per cell, and os/arch/version/address almost
//! never change between check-ins.
//!
//! Failures are logged and the batch is dropped; the next flush carries
//! fresh data anyway.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bigtable_rs::bigtable::{BigTable, BigTableConnection};
use bigtable_rs::google::bigtable::v2::mutate_rows_request::Entry;
use bigtable_rs::google::bigtable::v2::row_filter::Filter;
use bigtable_rs::google::bigtable::v2::{
    mutation, MutateRowsRequest, Mutation, ReadRowsRequest, RowFilter, RowSet,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::BigTableConfig;
use crate::error::DbError;

use super::{PendingStatusEntry, StatusSink};

const COLUMN_FAMILY: &str = "status";

pub struct BigTableStatusSink {
    connection: BigTableConnection,
    table_id: String,
    pending: Mutex<Vec<PendingStatusEntry>>,
}

impl BigTableStatusSink {
    pub async fn connect(config: &BigTableConfig) -> Result<Self, DbError> {
        let connection = BigTableConnection::new(
            &config.project_id,
            &config.instance_id,
            false,
            4,
            Some(Duration::from_secs(5)),
        )
        .await
        .map_err(|e| DbError::Sink(e.to_string()))?;
        Ok(Self {
            connection,
            table_id: config.table_id.clone(),
            pending: Mutex::new(Vec::new()),
        })
    }

    fn row_key(entry: &PendingStatusEntry) -> Vec<u8> {
        format!("{}#{}", entry.network_id, entry.member_id).into_bytes()
    }

    /// Column values this entry would write, keyed by qualifier.
    fn column_values(entry: &PendingStatusEntry) -> Vec<(&'static str, String)> {
        vec![
            ("os", entry.os.clone()),
            ("arch", entry.arch.clone()),
            ("version", entry.version.clone()),
            ("address", entry.ip_string()),
        ]
    }

    /// Read back the latest cell of every column for the given rows.
    async fn read_current(
        &self,
        client: &mut BigTable,
        row_keys: Vec<Vec<u8>>,
    ) -> Result<HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>>, DbError> {
        let request = ReadRowsRequest {
            table_name: client.get_full_table_name(&self.table_id),
            rows: Some(RowSet {
                row_keys,
                row_ranges: vec![],
            }),
            filter: Some(RowFilter {
                filter: Some(Filter::CellsPerColumnLimitFilter(1)),
            }),
            ..ReadRowsRequest::default()
        };

        let rows = client
            .read_rows(request)
            .await
            .map_err(|e| DbError::Sink(e.to_string()))?;

        let mut current: HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>> = HashMap::new();
        for (key, cells) in rows {
            let columns = current.entry(key).or_default();
            for cell in cells {
                columns.insert(cell.qualifier, cell.value);
            }
        }
        Ok(current)
    }

    fn set_cell(qualifier: &str, value: Vec<u8>, timestamp_ms: i64) -> Mutation {
        Mutation {
            mutation: Some(mutation::Mutation::SetCell(mutation::SetCell {
                family_name: COLUMN_FAMILY.to_string(),
                column_qualifier: qualifier.as_bytes().to_vec(),
                timestamp_micros: timestamp_ms * 1000,
                value,
            })),
        }
    }

    /// Build the changed-columns-only mutation set for one entry.
    fn build_entry(
        entry: &PendingStatusEntry,
        current: Option<&HashMap<Vec<u8>, Vec<u8>>>,
    ) -> Entry {
        let mut mutations = Vec::new();
        for (qualifier, value) in Self::column_values(entry) {
            let unchanged = current
                .and_then(|cols| cols.get(qualifier.as_bytes()))
                .is_some_and(|existing| existing == value.as_bytes());
            if !unchanged {
                mutations.push(Self::set_cell(qualifier, value.into_bytes(), entry.last_seen));
            }
        }
        mutations.push(Self::set_cell(
            "last_seen",
            entry.last_seen.to_string().into_bytes(),
            entry.last_seen,
        ));
        Entry {
            row_key: Self::row_key(entry),
            mutations,
            idempotency: None,
        }
    }
}

#[async_trait]
impl StatusSink for BigTableStatusSink {
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
        let mut client = self.connection.client();

        let row_keys: Vec<Vec<u8>> = to_write.iter().map(Self::row_key).collect();
        let current = match self.read_current(&mut client, row_keys).await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, dropped = to_write.len(), "status row read-back failed, dropping batch");
                return;
            }
        };

        let entries: Vec<Entry> = to_write
            .iter()
            .map(|entry| Self::build_entry(entry, current.get(&Self::row_key(entry))))
            .collect();

        let request = MutateRowsRequest {
            table_name: client.get_full_table_name(&self.table_id),
            entries,
            ..MutateRowsRequest::default()
        };

        match client.mutate_rows(request).await {
            Ok(_) => {
                crate::metrics::record_status_flush("bigtable", to_write.len(), flush_start.elapsed());
                debug!(updated = to_write.len(), "member status flushed to wide-column store");
            }
            Err(e) => {
                warn!(error = %e, dropped = to_write.len(), "status flush to wide-column store failed, dropping batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{MemberId, NetworkId};

    fn entry() -> PendingStatusEntry {
        PendingStatusEntry {
            network_id: NetworkId(0x8056c2e21c24673d),
            member_id: MemberId(0xa10dccea52),
            os: "linux".into(),
            arch: "x86_64".into(),
            version: "1.14.0".into(),
            address: Some("1.2.3.4:9993".parse().unwrap()),
            last_seen: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_row_key_shape() {
        assert_eq!(
            BigTableStatusSink::row_key(&entry()),
            b"8056c2e21c24673d#a10dccea52".to_vec()
        );
    }

    #[test]
    fn test_fresh_row_writes_every_column() {
        let e = entry();
        let built = BigTableStatusSink::build_entry(&e, None);
        // os, arch, version, address, last_seen
        assert_eq!(built.mutations.len(), 5);
    }

    #[test]
    fn test_unchanged_columns_are_skipped() {
        let e = entry();
        let mut current: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        current.insert(b"os".to_vec(), b"linux".to_vec());
        current.insert(b"arch".to_vec(), b"x86_64".to_vec());
        current.insert(b"version".to_vec(), b"1.14.0".to_vec());
        current.insert(b"address".to_vec(), b"1.2.3.4".to_vec());

        let built = BigTableStatusSink::build_entry(&e, Some(&current));
        // Only the unconditional last_seen cell remains.
        assert_eq!(built.mutations.len(), 1);
    }

    #[test]
    fn test_changed_column_is_written() {
        let e = entry();
        let mut current: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        current.insert(b"os".to_vec(), b"linux".to_vec());
        current.insert(b"arch".to_vec(), b"x86_64".to_vec());
        current.insert(b"version".to_vec(), b"1.12.2".to_vec());
        current.insert(b"address".to_vec(), b"1.2.3.4".to_vec());

        let built = BigTableStatusSink::build_entry(&e, Some(&current));
        // version changed + last_seen
        assert_eq!(built.mutations.len(), 2);
    }
}
