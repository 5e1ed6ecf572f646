//! Network and member record types.
//!
//! These are the two documents the controller is authoritative for. The
//! relational store keeps them as a serialized `configuration` blob plus a
//! handful of promoted columns; notification transports carry them as JSON or
//! protobuf. Internally we always work with the normalized structs below —
//! JSON exists only at the boundaries.
//!
//! Normalization happens in `serde` itself: every optional field carries a
//! default, so deserializing a sparse document yields the same struct as
//! deserializing the fully-populated one. The write-behind path relies on
//! this: `save` compares the incoming normalized record against the cached
//! one and short-circuits when they are field-wise equal.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 64-bit network id, rendered as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(pub u64);

/// 40-bit device id, rendered as 10 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub u64);

impl NetworkId {
    /// Parse from the canonical 16-digit hex form. Zero is not a valid id.
    pub fn parse(s: &str) -> Option<Self> {
        match u64::from_str_radix(s.trim(), 16) {
            Ok(0) | Err(_) => None,
            Ok(v) => Some(Self(v)),
        }
    }
}

impl MemberId {
    /// Parse from the canonical 10-digit hex form. Zero is not a valid id.
    pub fn parse(s: &str) -> Option<Self> {
        match u64::from_str_radix(s.trim(), 16) {
            Ok(0) | Err(_) => None,
            Ok(v) => Some(Self(v)),
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl Serialize for NetworkId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NetworkId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid network id: {s}")))
    }
}

impl Serialize for MemberId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MemberId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid member id: {s}")))
    }
}

/// One virtual network's configuration.
///
/// Field names mirror the stored `configuration` JSON document (camelCase).
/// Opaque sub-documents (rules, routes, DNS, assignment pools, capability and
/// tag vectors) stay as raw JSON values: the controller stores and forwards
/// them but never interprets them here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkRecord {
    pub id: Option<NetworkId>,
    pub name: String,
    pub revision: u64,
    pub creation_time: i64,
    pub last_modified: i64,
    pub mtu: u32,
    pub multicast_limit: u32,
    pub private: bool,
    pub enable_broadcast: bool,
    pub remote_trace_level: i32,
    pub remote_trace_target: Option<String>,
    pub rules: Value,
    pub tags: Value,
    pub capabilities: Value,
    pub routes: Value,
    pub dns: Value,
    pub ip_assignment_pools: Value,
    pub v4_assign_mode: Value,
    pub v6_assign_mode: Value,
    pub sso_enabled: bool,
    pub client_id: Option<String>,
    pub authorization_endpoint: Option<String>,
    #[serde(rename = "ssoProvider")]
    pub sso_provider: Option<String>,
}

impl Default for NetworkRecord {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            revision: 0,
            creation_time: 0,
            last_modified: 0,
            mtu: 2800,
            multicast_limit: 64,
            private: true,
            enable_broadcast: false,
            remote_trace_level: 0,
            remote_trace_target: None,
            rules: json!([]),
            tags: json!([]),
            capabilities: json!([]),
            routes: json!([]),
            dns: json!({"domain": "", "servers": []}),
            ip_assignment_pools: json!([]),
            v4_assign_mode: json!({"zt": true}),
            v6_assign_mode: json!({"zt": true, "6plane": true, "rfc4193": false}),
            sso_enabled: false,
            client_id: None,
            authorization_endpoint: None,
            sso_provider: None,
        }
    }
}

impl NetworkRecord {
    /// Deserialize and normalize an untyped JSON document.
    ///
    /// Returns `None` when the document has no parseable `id` — a network
    /// without an id cannot be cached or committed. Malformed optional
    /// fields fall back to their defaults rather than failing the whole
    /// record, matching how the bulk loader treats a sparse configuration
    /// blob.
    pub fn from_json(v: &Value) -> Option<Self> {
        let mut rec: Self = serde_json::from_value(sanitize(v, NETWORK_VALUE_FIELDS)).ok()?;
        rec.id?;
        // Empty-object assign modes mean "never configured": fill defaults.
        if !rec.v4_assign_mode.is_object() || rec.v4_assign_mode.as_object().is_some_and(|m| m.is_empty()) {
            rec.v4_assign_mode = json!({"zt": true});
        }
        if !rec.v6_assign_mode.is_object() || rec.v6_assign_mode.as_object().is_some_and(|m| m.is_empty()) {
            rec.v6_assign_mode = json!({"zt": true, "6plane": true, "rfc4193": false});
        }
        if !rec.dns.is_object() {
            rec.dns = json!({"domain": "", "servers": []});
        }
        Some(rec)
    }

    /// Serialize to the stored configuration document, tagged with the
    /// object type so a round trip through the notification transports is
    /// self-describing.
    pub fn to_json(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        v["objtype"] = json!("network");
        v
    }
}

/// One (network, device) membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberRecord {
    pub id: Option<MemberId>,
    pub nwid: Option<NetworkId>,
    /// Full public identity of the device, as stored in the membership row.
    pub identity: Option<String>,
    /// Node address string; mirrors `identity` when loaded from the store.
    pub address: Option<String>,
    pub authorized: bool,
    pub active_bridge: bool,
    /// Ordered list of assigned IPs. Order matters: assignment is positional.
    pub ip_assignments: Vec<String>,
    pub no_auto_assign_ips: bool,
    pub sso_exempt: bool,
    pub authentication_expiry_time: i64,
    pub creation_time: i64,
    pub last_authorized_time: i64,
    pub last_deauthorized_time: i64,
    pub remote_trace_level: i32,
    pub remote_trace_target: Option<String>,
    pub revision: u64,
    pub capabilities: Value,
    pub tags: Value,
    pub v_major: i32,
    pub v_minor: i32,
    pub v_rev: i32,
    pub v_proto: i32,
}

impl Default for MemberRecord {
    fn default() -> Self {
        Self {
            id: None,
            nwid: None,
            identity: None,
            address: None,
            authorized: false,
            active_bridge: false,
            ip_assignments: Vec::new(),
            no_auto_assign_ips: false,
            sso_exempt: false,
            authentication_expiry_time: 0,
            creation_time: 0,
            last_authorized_time: 0,
            last_deauthorized_time: 0,
            remote_trace_level: 0,
            remote_trace_target: None,
            revision: 0,
            capabilities: json!([]),
            tags: json!([]),
            v_major: -1,
            v_minor: -1,
            v_rev: -1,
            v_proto: -1,
        }
    }
}

impl MemberRecord {
    /// Deserialize and normalize an untyped JSON document. Returns `None`
    /// unless both `id` and `nwid` parse.
    pub fn from_json(v: &Value) -> Option<Self> {
        let rec: Self = serde_json::from_value(sanitize(v, MEMBER_VALUE_FIELDS)).ok()?;
        rec.id?;
        rec.nwid?;
        Some(rec)
    }

    pub fn to_json(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        v["objtype"] = json!("member");
        v
    }
}

const NETWORK_VALUE_FIELDS: &[&str] = &[
    "rules",
    "tags",
    "capabilities",
    "routes",
    "ipAssignmentPools",
];

const MEMBER_VALUE_FIELDS: &[&str] = &["capabilities", "tags", "ipAssignments"];

/// Strip fields whose wire value would make strict deserialization fail.
///
/// Notification payloads come from several producers and occasionally carry
/// `null` where we expect a string or a number, or a string where we expect
/// an array. Dropping the offender lets the serde default take over instead
/// of rejecting an otherwise-valid record.
fn sanitize(v: &Value, array_fields: &[&str]) -> Value {
    let mut v = v.clone();
    if let Some(map) = v.as_object_mut() {
        map.remove("objtype");
        map.retain(|_, val| !val.is_null());
        for field in array_fields {
            if map.get(*field).is_some_and(|val| !val.is_array()) {
                map.remove(*field);
            }
        }
    }
    v
}

/// A record accepted by [`save`](crate::db::ControllerDb::save), tagged the
/// way commit items tag their payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordObject {
    Network(NetworkRecord),
    Member(MemberRecord),
}

impl RecordObject {
    /// Parse a transport-level JSON document by its `objtype` tag.
    pub fn from_json(v: &Value) -> Option<Self> {
        match v.get("objtype").and_then(Value::as_str) {
            Some("network") => NetworkRecord::from_json(v).map(Self::Network),
            Some("member") => MemberRecord::from_json(v).map(Self::Member),
            _ => None,
        }
    }
}

/// One entry on the write-behind commit queue.
///
/// Deletions carry only ids: the commit worker reads the cached record to
/// build the "old" side of the change event after the store mutation lands.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitItem {
    Network(NetworkRecord),
    Member(MemberRecord),
    DeleteNetwork(NetworkId),
    DeleteMember(NetworkId, MemberId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_id_roundtrip() {
        let id = NetworkId::parse("8056c2e21c24673d").unwrap();
        assert_eq!(id.0, 0x8056c2e21c24673d);
        assert_eq!(id.to_string(), "8056c2e21c24673d");
    }

    #[test]
    fn test_network_id_zero_padded() {
        let id = NetworkId(0x1234);
        assert_eq!(id.to_string(), "0000000000001234");
        assert_eq!(NetworkId::parse("0000000000001234"), Some(id));
    }

    #[test]
    fn test_member_id_display_is_ten_digits() {
        assert_eq!(MemberId(0xa10dccea52).to_string(), "a10dccea52");
        assert_eq!(MemberId(0x1).to_string(), "0000000001");
    }

    #[test]
    fn test_id_parse_rejects_zero_and_garbage() {
        assert_eq!(NetworkId::parse("0"), None);
        assert_eq!(NetworkId::parse("not-hex"), None);
        assert_eq!(MemberId::parse(""), None);
    }

    #[test]
    fn test_network_defaults() {
        let rec = NetworkRecord::from_json(&json!({"id": "8056c2e21c24673d"})).unwrap();
        assert_eq!(rec.mtu, 2800);
        assert_eq!(rec.multicast_limit, 64);
        assert!(rec.private);
        assert!(!rec.enable_broadcast);
        assert_eq!(rec.v4_assign_mode, json!({"zt": true}));
        assert_eq!(
            rec.v6_assign_mode,
            json!({"zt": true, "6plane": true, "rfc4193": false})
        );
        assert_eq!(rec.dns, json!({"domain": "", "servers": []}));
        assert_eq!(rec.rules, json!([]));
    }

    #[test]
    fn test_network_without_id_is_rejected() {
        assert!(NetworkRecord::from_json(&json!({"name": "orphan"})).is_none());
        assert!(NetworkRecord::from_json(&json!({"id": "0"})).is_none());
    }

    #[test]
    fn test_network_normalization_is_idempotent() {
        let first = NetworkRecord::from_json(&json!({
            "id": "8056c2e21c24673d",
            "name": "earth",
            "mtu": 1500,
        }))
        .unwrap();
        let second = NetworkRecord::from_json(&first.to_json()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_network_null_fields_fall_back_to_defaults() {
        let rec = NetworkRecord::from_json(&json!({
            "id": "8056c2e21c24673d",
            "name": null,
            "remoteTraceTarget": null,
            "rules": null,
        }))
        .unwrap();
        assert_eq!(rec.name, "");
        assert_eq!(rec.remote_trace_target, None);
        assert_eq!(rec.rules, json!([]));
    }

    #[test]
    fn test_network_empty_assign_modes_get_defaults() {
        let rec = NetworkRecord::from_json(&json!({
            "id": "8056c2e21c24673d",
            "v4AssignMode": {},
            "v6AssignMode": {},
        }))
        .unwrap();
        assert_eq!(rec.v4_assign_mode, json!({"zt": true}));
        assert_eq!(
            rec.v6_assign_mode,
            json!({"zt": true, "6plane": true, "rfc4193": false})
        );
    }

    #[test]
    fn test_member_defaults() {
        let rec = MemberRecord::from_json(&json!({
            "id": "a10dccea52",
            "nwid": "8056c2e21c24673d",
        }))
        .unwrap();
        assert!(!rec.authorized);
        assert!(!rec.active_bridge);
        assert!(!rec.no_auto_assign_ips);
        assert!(!rec.sso_exempt);
        assert!(rec.ip_assignments.is_empty());
        assert_eq!(rec.last_authorized_time, 0);
        assert_eq!(rec.v_major, -1);
        assert_eq!(rec.v_proto, -1);
    }

    #[test]
    fn test_member_requires_both_ids() {
        assert!(MemberRecord::from_json(&json!({"id": "a10dccea52"})).is_none());
        assert!(MemberRecord::from_json(&json!({"nwid": "8056c2e21c24673d"})).is_none());
    }

    #[test]
    fn test_member_ip_assignment_order_preserved() {
        let rec = MemberRecord::from_json(&json!({
            "id": "a10dccea52",
            "nwid": "8056c2e21c24673d",
            "ipAssignments": ["10.121.15.2", "10.121.15.1"],
        }))
        .unwrap();
        assert_eq!(rec.ip_assignments, vec!["10.121.15.2", "10.121.15.1"]);
    }

    #[test]
    fn test_record_object_dispatches_on_objtype() {
        let nw = RecordObject::from_json(&json!({"objtype": "network", "id": "8056c2e21c24673d"}));
        assert!(matches!(nw, Some(RecordObject::Network(_))));

        let member = RecordObject::from_json(&json!({
            "objtype": "member", "id": "a10dccea52", "nwid": "8056c2e21c24673d"
        }));
        assert!(matches!(member, Some(RecordObject::Member(_))));

        assert!(RecordObject::from_json(&json!({"objtype": "bogus"})).is_none());
        assert!(RecordObject::from_json(&json!({"id": "8056c2e21c24673d"})).is_none());
    }

    #[test]
    fn test_field_equality_detects_change() {
        let base = NetworkRecord::from_json(&json!({
            "id": "8056c2e21c24673d", "name": "earth", "revision": 7
        }))
        .unwrap();
        let mut renamed = base.clone();
        renamed.name = "mars".into();
        assert_ne!(base, renamed);

        let same = NetworkRecord::from_json(&json!({
            "id": "8056c2e21c24673d", "name": "earth", "revision": 7
        }))
        .unwrap();
        assert_eq!(base, same);
    }
}
