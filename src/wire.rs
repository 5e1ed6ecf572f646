//! Protobuf wire format for cross-controller change fan-out.
//!
//! The pub/sub transport carries `NetworkChange` / `MemberChange` messages:
//! a pair of optional record snapshots (`old`, `new`), a source discriminator
//! and free-form metadata. Scalar identity fields are promoted to their own
//! protobuf fields so routing code can inspect them without parsing JSON;
//! the full record travels as its canonical JSON document so nothing is lost
//! between controller versions with different field sets.
//!
//! Messages are hand-derived `prost` structs; the schema is small enough
//! that generated code would be more build machinery than message.

use std::collections::HashMap;

use prost::Message;

use crate::record::{MemberRecord, NetworkRecord};

/// Which plane produced a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ChangeSource {
    Cv1 = 0,
    Cv2 = 1,
    Controller = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Network {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(uint64, tag = "3")]
    pub revision: u64,
    /// Canonical JSON document of the full record.
    #[prost(string, tag = "4")]
    pub configuration: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Member {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub network_id: String,
    #[prost(bool, tag = "3")]
    pub authorized: bool,
    #[prost(uint64, tag = "4")]
    pub revision: u64,
    /// Canonical JSON document of the full record.
    #[prost(string, tag = "5")]
    pub configuration: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkChange {
    #[prost(message, optional, tag = "1")]
    pub old: Option<Network>,
    #[prost(message, optional, tag = "2")]
    pub new: Option<Network>,
    #[prost(enumeration = "ChangeSource", tag = "3")]
    pub change_source: i32,
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberChange {
    #[prost(message, optional, tag = "1")]
    pub old: Option<Member>,
    #[prost(message, optional, tag = "2")]
    pub new: Option<Member>,
    #[prost(enumeration = "ChangeSource", tag = "3")]
    pub change_source: i32,
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
}

impl Network {
    pub fn from_record(rec: &NetworkRecord) -> Self {
        Self {
            id: rec.id.map(|i| i.to_string()).unwrap_or_default(),
            name: rec.name.clone(),
            revision: rec.revision,
            configuration: rec.to_json().to_string(),
        }
    }

    /// Normalize back to the internal record shape the local save path uses.
    pub fn to_record(&self) -> Option<NetworkRecord> {
        let cfg: serde_json::Value = serde_json::from_str(&self.configuration).ok()?;
        NetworkRecord::from_json(&cfg)
    }
}

impl Member {
    pub fn from_record(rec: &MemberRecord) -> Self {
        Self {
            id: rec.id.map(|i| i.to_string()).unwrap_or_default(),
            network_id: rec.nwid.map(|n| n.to_string()).unwrap_or_default(),
            authorized: rec.authorized,
            revision: rec.revision,
            configuration: rec.to_json().to_string(),
        }
    }

    pub fn to_record(&self) -> Option<MemberRecord> {
        let cfg: serde_json::Value = serde_json::from_str(&self.configuration).ok()?;
        MemberRecord::from_json(&cfg)
    }
}

impl NetworkChange {
    pub fn from_records(
        old: Option<&NetworkRecord>,
        new: Option<&NetworkRecord>,
        source: ChangeSource,
    ) -> Self {
        Self {
            old: old.map(Network::from_record),
            new: new.map(Network::from_record),
            change_source: source as i32,
            metadata: HashMap::new(),
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        Message::encode_to_vec(self)
    }

    pub fn decode_from(buf: &[u8]) -> Result<Self, prost::DecodeError> {
        Message::decode(buf)
    }
}

impl MemberChange {
    pub fn from_records(
        old: Option<&MemberRecord>,
        new: Option<&MemberRecord>,
        source: ChangeSource,
    ) -> Self {
        Self {
            old: old.map(Member::from_record),
            new: new.map(Member::from_record),
            change_source: source as i32,
            metadata: HashMap::new(),
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        Message::encode_to_vec(self)
    }

    pub fn decode_from(buf: &[u8]) -> Result<Self, prost::DecodeError> {
        Message::decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn network() -> NetworkRecord {
        NetworkRecord::from_json(&json!({
            "id": "8056c2e21c24673d",
            "name": "earth",
            "revision": 7,
            "mtu": 1500,
        }))
        .unwrap()
    }

    fn member() -> MemberRecord {
        MemberRecord::from_json(&json!({
            "id": "a10dccea52",
            "nwid": "8056c2e21c24673d",
            "authorized": true,
            "revision": 3,
            "ipAssignments": ["10.121.15.2"],
        }))
        .unwrap()
    }

    #[test]
    fn test_network_change_roundtrip() {
        let old = network();
        let mut new = old.clone();
        new.name = "mars".into();
        new.revision = 8;

        let change = NetworkChange::from_records(Some(&old), Some(&new), ChangeSource::Controller);
        let bytes = change.encode_to_vec();
        let decoded = NetworkChange::decode_from(&bytes).unwrap();

        assert_eq!(decoded.change_source, ChangeSource::Controller as i32);
        assert_eq!(decoded.old.as_ref().unwrap().to_record().unwrap(), old);
        assert_eq!(decoded.new.as_ref().unwrap().to_record().unwrap(), new);
    }

    #[test]
    fn test_member_change_roundtrip() {
        let rec = member();
        let change = MemberChange::from_records(None, Some(&rec), ChangeSource::Cv2);
        let decoded = MemberChange::decode_from(&change.encode_to_vec()).unwrap();

        assert!(decoded.old.is_none());
        let wire_member = decoded.new.unwrap();
        assert_eq!(wire_member.id, "a10dccea52");
        assert_eq!(wire_member.network_id, "8056c2e21c24673d");
        assert!(wire_member.authorized);
        assert_eq!(wire_member.to_record().unwrap(), rec);
    }

    #[test]
    fn test_deletion_carries_only_old() {
        let rec = member();
        let change = MemberChange::from_records(Some(&rec), None, ChangeSource::Controller);
        let decoded = MemberChange::decode_from(&change.encode_to_vec()).unwrap();
        assert!(decoded.new.is_none());
        assert!(decoded.old.is_some());
    }

    #[test]
    fn test_garbage_configuration_yields_no_record() {
        let wire_network = Network {
            id: "8056c2e21c24673d".into(),
            name: "x".into(),
            revision: 1,
            configuration: "not json".into(),
        };
        assert!(wire_network.to_record().is_none());
    }

    #[test]
    fn test_truncated_buffer_fails_decode() {
        let change = NetworkChange::from_records(Some(&network()), None, ChangeSource::Cv1);
        let bytes = change.encode_to_vec();
        assert!(NetworkChange::decode_from(&bytes[..bytes.len() / 2]).is_err());
    }
}
