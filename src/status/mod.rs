//! Batched member-liveness sinks.
//!
//! The online-notification loop drains the in-memory liveness map every tick
//! and hands each surviving report to the configured sink. Sinks buffer under
//! a mutex — [`update_node_status`](StatusSink::update_node_status) is a
//! constant-time enqueue — and flush the whole buffer in one backend round
//! per [`write_pending`](StatusSink::write_pending) call.
//!
//! All sinks are lossy on failure: a flush that errors logs, drops its batch
//! and moves on. Liveness data is regenerated continuously; there is nothing
//! worth retrying.

pub mod bigtable;
pub mod postgres;
pub mod redis;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::record::{MemberId, NetworkId};

/// One buffered liveness record awaiting flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStatusEntry {
    pub network_id: NetworkId,
    pub member_id: MemberId,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub address: Option<SocketAddr>,
    pub last_seen: i64,
}

impl PendingStatusEntry {
    /// IP portion of the physical address, empty when unknown.
    pub fn ip_string(&self) -> String {
        self.address.map(|a| a.ip().to_string()).unwrap_or_default()
    }
}

/// Split an "os/arch" report into its halves; anything unparseable reports
/// as unknown.
pub fn split_os_arch(os_arch: &str) -> (String, String) {
    let mut parts = os_arch.splitn(2, '/');
    match (parts.next(), parts.next()) {
        (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => {
            (os.to_string(), arch.to_string())
        }
        _ => ("unknown".to_string(), "unknown".to_string()),
    }
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Buffer one liveness record. O(1) under the sink's mutex.
    fn update_node_status(&self, entry: PendingStatusEntry);

    /// Number of buffered records awaiting flush.
    fn queue_length(&self) -> usize;

    /// Atomically swap out the pending buffer and write it to the backend.
    async fn write_pending(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_os_arch() {
        assert_eq!(
            split_os_arch("linux/x86_64"),
            ("linux".to_string(), "x86_64".to_string())
        );
        assert_eq!(
            split_os_arch("darwin/arm64"),
            ("darwin".to_string(), "arm64".to_string())
        );
    }

    #[test]
    fn test_split_os_arch_malformed() {
        assert_eq!(
            split_os_arch("windows"),
            ("unknown".to_string(), "unknown".to_string())
        );
        assert_eq!(
            split_os_arch(""),
            ("unknown".to_string(), "unknown".to_string())
        );
        assert_eq!(
            split_os_arch("/"),
            ("unknown".to_string(), "unknown".to_string())
        );
    }

    #[test]
    fn test_ip_string() {
        let entry = PendingStatusEntry {
            network_id: NetworkId(1),
            member_id: MemberId(2),
            os: "linux".into(),
            arch: "x86_64".into(),
            version: String::new(),
            address: Some("1.2.3.4:9993".parse().unwrap()),
            last_seen: 1,
        };
        assert_eq!(entry.ip_string(), "1.2.3.4");

        let entry = PendingStatusEntry { address: None, ..entry };
        assert_eq!(entry.ip_string(), "");
    }
}
