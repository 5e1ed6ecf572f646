//! Property-based tests for the record normalization layer and the commit
//! queue.
//!
//! Uses proptest to throw random and malformed inputs at the parsing paths
//! and to check ordering properties of the queue. Nothing here needs a
//! backend.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Value};

use controller_db::queue::CommitQueue;
use controller_db::{MemberId, MemberRecord, NetworkId, NetworkRecord, RecordObject};

// =============================================================================
// Strategies
// =============================================================================

/// Arbitrary JSON values (including structures no record would ever have).
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(4, 64, 10, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
            prop::collection::hash_map(".*", inner, 0..10)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// A sparse-but-valid network document: always has an id, everything else
/// optional.
fn network_document_strategy() -> impl Strategy<Value = Value> {
    (
        1u64..u64::MAX,
        prop::option::of("[a-z0-9 ]{0,20}"),
        prop::option::of(0u64..1_000_000),
        prop::option::of(576u32..10_000),
        prop::option::of(any::<bool>()),
    )
        .prop_map(|(id, name, revision, mtu, private)| {
            let mut doc = json!({ "id": NetworkId(id).to_string() });
            if let Some(name) = name {
                doc["name"] = json!(name);
            }
            if let Some(revision) = revision {
                doc["revision"] = json!(revision);
            }
            if let Some(mtu) = mtu {
                doc["mtu"] = json!(mtu);
            }
            if let Some(private) = private {
                doc["private"] = json!(private);
            }
            doc
        })
}

fn member_document_strategy() -> impl Strategy<Value = Value> {
    (
        1u64..u64::MAX,
        1u64..0xff_ffff_ffffu64,
        prop::option::of(any::<bool>()),
        prop::collection::vec("[0-9.]{7,15}", 0..4),
    )
        .prop_map(|(nwid, id, authorized, ips)| {
            let mut doc = json!({
                "id": MemberId(id).to_string(),
                "nwid": NetworkId(nwid).to_string(),
                "ipAssignments": ips,
            });
            if let Some(authorized) = authorized {
                doc["authorized"] = json!(authorized);
            }
            doc
        })
}

// =============================================================================
// Parsing never panics
// =============================================================================

proptest! {
    #[test]
    fn fuzz_network_from_arbitrary_json(doc in arbitrary_json_strategy()) {
        // Must never panic; None is always an acceptable outcome.
        let _ = NetworkRecord::from_json(&doc);
        let _ = MemberRecord::from_json(&doc);
        let _ = RecordObject::from_json(&doc);
    }

    #[test]
    fn fuzz_record_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..4096)) {
        if let Ok(doc) = serde_json::from_slice::<Value>(&bytes) {
            let _ = NetworkRecord::from_json(&doc);
            let _ = MemberRecord::from_json(&doc);
        }
    }
}

// =============================================================================
// Normalization properties
// =============================================================================

proptest! {
    /// Normalizing an already-normalized record is the identity: this is
    /// what stops the listener echo loop after one round trip.
    #[test]
    fn prop_network_normalization_idempotent(doc in network_document_strategy()) {
        let first = NetworkRecord::from_json(&doc).expect("document always has an id");
        let second = NetworkRecord::from_json(&first.to_json()).expect("roundtrip parses");
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_member_normalization_idempotent(doc in member_document_strategy()) {
        let first = MemberRecord::from_json(&doc).expect("document always has both ids");
        let second = MemberRecord::from_json(&first.to_json()).expect("roundtrip parses");
        prop_assert_eq!(first, second);
    }

    /// Defaults are stable: a sparse document and the same document with
    /// its defaults spelled out normalize identically.
    #[test]
    fn prop_network_defaults_are_canonical(id in 1u64..u64::MAX) {
        let sparse = NetworkRecord::from_json(&json!({"id": NetworkId(id).to_string()})).unwrap();
        let spelled = NetworkRecord::from_json(&json!({
            "id": NetworkId(id).to_string(),
            "mtu": 2800,
            "multicastLimit": 64,
            "private": true,
            "v4AssignMode": {"zt": true},
            "v6AssignMode": {"zt": true, "6plane": true, "rfc4193": false},
        })).unwrap();
        prop_assert_eq!(sparse, spelled);
    }

    /// Id rendering round-trips through parse for the whole value range.
    #[test]
    fn prop_id_roundtrip(nwid in 1u64..u64::MAX, member in 1u64..0xff_ffff_ffffu64) {
        let network_id = NetworkId(nwid);
        prop_assert_eq!(NetworkId::parse(&network_id.to_string()), Some(network_id));
        let member_id = MemberId(member);
        prop_assert_eq!(MemberId::parse(&member_id.to_string()), Some(member_id));
    }
}

// =============================================================================
// Queue ordering
// =============================================================================

proptest! {
    /// A single consumer sees exactly the posted sequence.
    #[test]
    fn prop_queue_preserves_insertion_order(items in prop::collection::vec(any::<u32>(), 0..200)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let queue = CommitQueue::new();
            for item in &items {
                queue.post(*item);
            }
            let mut drained = Vec::with_capacity(items.len());
            for _ in 0..items.len() {
                drained.push(queue.get().await.unwrap());
            }
            prop_assert_eq!(drained, items);
            prop_assert!(queue.is_empty());
            Ok(())
        })?;
    }

    /// Stop delivers "no item" to any number of waiters and stays stopped.
    #[test]
    fn prop_queue_stop_is_terminal(waiters in 1usize..16) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let queue = std::sync::Arc::new(CommitQueue::<u32>::new());
            let handles: Vec<_> = (0..waiters)
                .map(|_| {
                    let q = queue.clone();
                    tokio::spawn(async move { q.get().await })
                })
                .collect();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            queue.stop();
            for handle in handles {
                prop_assert_eq!(handle.await.unwrap(), None);
            }
            prop_assert_eq!(queue.get().await, None);
            Ok(())
        })?;
    }
}
