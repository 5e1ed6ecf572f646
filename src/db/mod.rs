//! The controller DB façade.
//!
//! [`ControllerDb`] is the authoritative, in-memory view of every network
//! and member record one controller instance owns, reconciled with the
//! PostgreSQL store of record through a write-behind commit pipeline.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized → NetworksLoaded → FullyReady
//! ```
//!
//! Readiness is monotonic: each bulk-load phase raises it one step and it
//! never regresses. `erase_*` and the online-notification loop block on
//! [`wait_for_ready`](ControllerDb::wait_for_ready); reads served before
//! `FullyReady` would not be authoritative.
//!
//! # Write path
//!
//! `save` compares the normalized incoming record against the cached one;
//! an identical record is a no-op. A differing record gets its revision
//! bumped past the cached one and is queued for a commit worker, which
//! performs the store upsert, re-reads the cache to capture the pre-commit
//! "old", installs the committed record, and fans the (old, new) pair out to
//! the registered change handlers. The cache therefore always holds the
//! *committed* view, and handler events carry exactly one delta per commit.

mod commit;
mod lifecycle;
mod loops;
mod sso;

pub use sso::AuthInfo;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ControllerConfig;
use crate::hooks::MemberJoinedHook;
use crate::listener::ListenerHandle;
use crate::liveness::LivenessMap;
use crate::queue::CommitQueue;
use crate::record::{CommitItem, MemberId, MemberRecord, NetworkId, NetworkRecord, RecordObject};
use crate::status::StatusSink;
use crate::store::PgStore;

/// Who this controller is. The outer daemon owns identity generation and
/// signing; the data plane only needs the address and the public blob for
/// the heartbeat row.
#[derive(Debug, Clone)]
pub struct ControllerIdentity {
    /// 10-hex-digit controller address; namespaces every channel, stream,
    /// subscription and cache key.
    pub address: String,
    /// Public identity string, persisted with each heartbeat.
    pub public: String,
}

/// Two-phase readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Uninitialized,
    NetworksLoaded,
    FullyReady,
}

/// Post-commit change observer. Invoked synchronously from the commit
/// worker, so implementations see a well-ordered stream per worker and must
/// defer anything slow.
pub trait ChangeHandler: Send + Sync {
    fn on_network_change(&self, old: Option<&NetworkRecord>, new: Option<&NetworkRecord>);
    fn on_member_change(&self, old: Option<&MemberRecord>, new: Option<&MemberRecord>);
}

pub struct ControllerDb {
    pub(crate) config: ControllerConfig,
    pub(crate) identity: ControllerIdentity,
    pub(crate) store: PgStore,

    networks: RwLock<HashMap<NetworkId, NetworkRecord>>,
    members: RwLock<HashMap<(NetworkId, MemberId), MemberRecord>>,

    pub(crate) commit_queue: CommitQueue<(CommitItem, bool)>,
    pub(crate) liveness: LivenessMap,
    pub(crate) status_sink: Arc<dyn StatusSink>,

    /// Cache connection for the member-status side indexes; present only
    /// when a redis config exists and `ZT_REDIS_MEMBER_STATUS` is enabled
    /// or a redis-backed mode is selected.
    pub(crate) redis: Option<ConnectionManager>,
    pub(crate) redis_member_status: bool,

    handlers: RwLock<Vec<Arc<dyn ChangeHandler>>>,
    pub(crate) member_joined: Option<MemberJoinedHook>,

    ready_tx: watch::Sender<ReadyState>,
    ready_rx: watch::Receiver<ReadyState>,

    pub(crate) sso_psk: [u8; 48],

    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) listener: Mutex<Option<ListenerHandle>>,
}

impl ControllerDb {
    /// The 10-hex-digit controller address.
    pub fn controller_id(&self) -> &str {
        &self.identity.address
    }

    // ------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------

    /// Block until both bulk-load phases have completed. Never fails.
    pub async fn wait_for_ready(&self) -> bool {
        let mut rx = self.ready_rx.clone();
        let _ = rx.wait_for(|state| *state == ReadyState::FullyReady).await;
        true
    }

    /// Non-blocking readiness snapshot.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow() == ReadyState::FullyReady
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.ready_rx.borrow()
    }

    /// Raise the readiness gate one step. Monotonic: a stale or repeated
    /// transition is ignored.
    pub(crate) fn advance_ready(&self, next: ReadyState) {
        self.ready_tx.send_modify(|state| {
            if next > *state {
                *state = next;
            }
        });
    }

    // ------------------------------------------------------------------
    // Reads (never touch the store)
    // ------------------------------------------------------------------

    pub fn get_network(&self, network_id: NetworkId) -> Option<NetworkRecord> {
        self.networks.read().get(&network_id).cloned()
    }

    pub fn get_member(&self, network_id: NetworkId, member_id: MemberId) -> Option<MemberRecord> {
        self.members.read().get(&(network_id, member_id)).cloned()
    }

    pub fn network_count(&self) -> usize {
        self.networks.read().len()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// Ids of all cached networks (used by the cache warm-up pass).
    pub(crate) fn network_ids(&self) -> Vec<NetworkId> {
        self.networks.read().keys().copied().collect()
    }

    /// Undelivered commit-queue items.
    pub fn commit_queue_depth(&self) -> usize {
        self.commit_queue.len()
    }

    // ------------------------------------------------------------------
    // Write-behind entry points
    // ------------------------------------------------------------------

    /// Accept a record for commit.
    ///
    /// Returns `false` with no side effect when the normalized record is
    /// field-equal to the cached one. Otherwise the revision is bumped past
    /// the cached record's and a commit item is queued; the call does not
    /// wait for the commit.
    pub fn save(&self, record: RecordObject, notify_listeners: bool) -> bool {
        match record {
            RecordObject::Network(mut rec) => {
                let Some(network_id) = rec.id else {
                    warn!("network save without an id");
                    return false;
                };
                let cached = self.get_network(network_id);
                if cached.as_ref() == Some(&rec) {
                    return false;
                }
                rec.revision = cached.map(|c| c.revision).unwrap_or(0) + 1;
                self.commit_queue.post((CommitItem::Network(rec), notify_listeners));
            }
            RecordObject::Member(mut rec) => {
                let (Some(network_id), Some(member_id)) = (rec.nwid, rec.id) else {
                    warn!("member save without both ids");
                    return false;
                };
                let cached = self.get_member(network_id, member_id);
                if cached.as_ref() == Some(&rec) {
                    return false;
                }
                rec.revision = cached.map(|c| c.revision).unwrap_or(0) + 1;
                self.commit_queue.post((CommitItem::Member(rec), notify_listeners));
            }
        }
        crate::metrics::set_commit_queue_depth(self.commit_queue.len());
        true
    }

    /// Queue a network deletion and propagate it optimistically.
    ///
    /// The change event (empty "new") fires immediately so downstream state
    /// converges without waiting for the store; the cache entry itself is
    /// removed by the commit worker once the store-side deletion succeeds,
    /// without a second event.
    pub async fn erase_network(&self, network_id: NetworkId) {
        self.wait_for_ready().await;
        self.commit_queue
            .post((CommitItem::DeleteNetwork(network_id), true));

        let old = self.get_network(network_id).unwrap_or_else(|| NetworkRecord {
            id: Some(network_id),
            ..Default::default()
        });
        self.notify_network_changed(Some(&old), None);
    }

    /// Queue a member deletion and propagate it optimistically.
    pub async fn erase_member(&self, network_id: NetworkId, member_id: MemberId) {
        self.wait_for_ready().await;
        self.commit_queue
            .post((CommitItem::DeleteMember(network_id, member_id), true));

        let old = self
            .get_member(network_id, member_id)
            .unwrap_or_else(|| MemberRecord {
                id: Some(member_id),
                nwid: Some(network_id),
                ..Default::default()
            });
        self.notify_member_changed(Some(&old), None);
    }

    /// Absorb one liveness report. O(1); never touches the store.
    pub fn node_is_online_with_os_arch(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        physical_address: Option<SocketAddr>,
        os_arch: &str,
    ) {
        crate::metrics::record_node_checkin();
        self.liveness
            .record(network_id, member_id, physical_address, os_arch);
    }

    pub fn node_is_online(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
        physical_address: Option<SocketAddr>,
    ) {
        self.node_is_online_with_os_arch(network_id, member_id, physical_address, "unknown/unknown");
    }

    // ------------------------------------------------------------------
    // Change fan-out and cache maintenance
    // ------------------------------------------------------------------

    /// Register a post-commit change observer.
    pub fn register_change_handler(&self, handler: Arc<dyn ChangeHandler>) {
        self.handlers.write().push(handler);
    }

    pub(crate) fn notify_network_changed(
        &self,
        old: Option<&NetworkRecord>,
        new: Option<&NetworkRecord>,
    ) {
        let handlers = self.handlers.read().clone();
        for handler in &handlers {
            handler.on_network_change(old, new);
        }
    }

    pub(crate) fn notify_member_changed(
        &self,
        old: Option<&MemberRecord>,
        new: Option<&MemberRecord>,
    ) {
        let handlers = self.handlers.read().clone();
        for handler in &handlers {
            handler.on_member_change(old, new);
        }
    }

    /// Install a committed network record, returning the previous view.
    pub(crate) fn insert_network_cache(&self, rec: NetworkRecord) -> Option<NetworkRecord> {
        let Some(network_id) = rec.id else { return None };
        let previous = self.networks.write().insert(network_id, rec);
        crate::metrics::set_network_count(self.network_count());
        previous
    }

    /// Install a committed member record, returning the previous view.
    pub(crate) fn insert_member_cache(&self, rec: MemberRecord) -> Option<MemberRecord> {
        let (Some(network_id), Some(member_id)) = (rec.nwid, rec.id) else {
            return None;
        };
        let previous = self.members.write().insert((network_id, member_id), rec);
        crate::metrics::set_member_count(self.member_count());
        previous
    }

    /// Drop a deleted network and every membership under it.
    pub(crate) fn remove_network_cache(&self, network_id: NetworkId) -> Option<NetworkRecord> {
        let removed = self.networks.write().remove(&network_id);
        self.members
            .write()
            .retain(|(nwid, _), _| *nwid != network_id);
        crate::metrics::set_network_count(self.network_count());
        crate::metrics::set_member_count(self.member_count());
        removed
    }

    pub(crate) fn remove_member_cache(
        &self,
        network_id: NetworkId,
        member_id: MemberId,
    ) -> Option<MemberRecord> {
        let removed = self.members.write().remove(&(network_id, member_id));
        crate::metrics::set_member_count(self.member_count());
        removed
    }
}

/// Decode the `ZT_SSO_PSK` value: hex, truncated or zero-padded to 48 bytes.
pub(crate) fn parse_sso_psk(hex_str: &str) -> [u8; 48] {
    let mut psk = [0u8; 48];
    let decoded = hex::decode(hex_str.trim()).unwrap_or_default();
    let n = decoded.len().min(48);
    psk[..n].copy_from_slice(&decoded[..n]);
    psk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_ordering() {
        assert!(ReadyState::Uninitialized < ReadyState::NetworksLoaded);
        assert!(ReadyState::NetworksLoaded < ReadyState::FullyReady);
    }

    #[test]
    fn test_parse_sso_psk_exact() {
        let hex = "ab".repeat(48);
        let psk = parse_sso_psk(&hex);
        assert!(psk.iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_parse_sso_psk_short_is_zero_padded() {
        let psk = parse_sso_psk("deadbeef");
        assert_eq!(&psk[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert!(psk[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_parse_sso_psk_long_is_truncated() {
        let hex = "11".repeat(64);
        let psk = parse_sso_psk(&hex);
        assert!(psk.iter().all(|b| *b == 0x11));
    }

    #[test]
    fn test_parse_sso_psk_garbage_is_zero() {
        assert_eq!(parse_sso_psk("not hex"), [0u8; 48]);
    }
}
