use std::sync::Arc;

use archivist_crypto::{CryptoError, CryptoFacade};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::archiver::ArchiverNodeInfo;
use crate::node::{ConsensusNodeInfo, JoinedConsensor};
use crate::{CycleMarker, NodeId, PublicKey};

const MARKER_FIELD: &str = "marker";

/// One epoch's summary as emitted by the network.
///
/// Records form a hash chain: `previous` holds the marker of the record
/// with the preceding counter. Fields this archiver does not interpret are
/// kept in `extra`.
///
/// A decoded record remembers the JSON object it came from. It serializes
/// back to that object, so its marker covers exactly the fields the
/// producer hashed, including which defaulted fields were absent. Fields of
/// a decoded record must not be edited except through [`seal`](Self::seal),
/// which drops the remembered form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", rename_all = "camelCase")]
pub struct CycleRecord {
    pub counter: u64,
    /// Marker of the predecessor record.
    #[serde(default)]
    pub previous: CycleMarker,
    /// Epoch start in seconds.
    #[serde(default)]
    pub start: u64,
    /// Epoch length in seconds.
    #[serde(default)]
    pub duration: u64,

    /// Active node count at the start of this cycle.
    #[serde(default)]
    pub active: u64,
    #[serde(default)]
    pub syncing: u64,
    #[serde(default)]
    pub standby: u64,

    #[serde(default)]
    pub joined_consensors: Vec<JoinedConsensor>,
    #[serde(default)]
    pub activated: Vec<NodeId>,
    #[serde(default)]
    pub activated_public_keys: Vec<PublicKey>,
    #[serde(default)]
    pub refreshed_consensors: Vec<JoinedConsensor>,
    #[serde(default)]
    pub removed: Vec<NodeId>,
    #[serde(default)]
    pub lost: Vec<NodeId>,
    #[serde(default)]
    pub refuted: Vec<NodeId>,
    #[serde(default)]
    pub apoptosized: Vec<NodeId>,
    #[serde(default)]
    pub standby_add: Vec<ConsensusNodeInfo>,
    #[serde(default)]
    pub standby_remove: Vec<PublicKey>,

    #[serde(default)]
    pub joined_archivers: Vec<ArchiverNodeInfo>,
    #[serde(default)]
    pub refreshed_archivers: Vec<ArchiverNodeInfo>,
    #[serde(default)]
    pub leaving_archivers: Vec<ArchiverNodeInfo>,

    #[serde(default)]
    pub safety_mode: bool,
    #[serde(default)]
    pub safety_num: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub marker: CycleMarker,

    #[serde(flatten)]
    pub extra: Map<String, Value>,

    #[serde(skip)]
    wire: WireForm,
}

/// The object a record was decoded from. Never affects equality.
#[derive(Debug, Clone, Default)]
struct WireForm(Option<Arc<Map<String, Value>>>);

impl PartialEq for WireForm {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Serialize for CycleRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(raw) = &self.wire.0 else {
            return CycleRecord::serialize(self, serializer);
        };
        let mut object = (**raw).clone();
        if self.marker.is_empty() {
            object.remove(MARKER_FIELD);
        } else {
            object.insert(MARKER_FIELD.to_string(), Value::String(self.marker.clone()));
        }
        object.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CycleRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        let mut record =
            CycleRecord::deserialize(Value::Object(raw.clone())).map_err(de::Error::custom)?;
        record.wire = WireForm(Some(Arc::new(raw)));
        Ok(record)
    }
}

impl CycleRecord {
    /// A blank record at `counter`, mostly useful for building fixtures.
    pub fn empty(counter: u64) -> Self {
        CycleRecord {
            counter,
            previous: String::new(),
            start: 0,
            duration: 0,
            active: 0,
            syncing: 0,
            standby: 0,
            joined_consensors: Vec::new(),
            activated: Vec::new(),
            activated_public_keys: Vec::new(),
            refreshed_consensors: Vec::new(),
            removed: Vec::new(),
            lost: Vec::new(),
            refuted: Vec::new(),
            apoptosized: Vec::new(),
            standby_add: Vec::new(),
            standby_remove: Vec::new(),
            joined_archivers: Vec::new(),
            refreshed_archivers: Vec::new(),
            leaving_archivers: Vec::new(),
            safety_mode: false,
            safety_num: 0,
            marker: String::new(),
            extra: Map::new(),
            wire: WireForm::default(),
        }
    }

    /// Expected active set size once this record's deltas are applied.
    pub fn active_node_count(&self) -> usize {
        (self.active as usize + self.activated.len())
            .saturating_sub(self.apoptosized.len())
            .saturating_sub(self.removed.len())
            .saturating_sub(self.lost.len())
    }

    /// Expected size of the syncing plus active sets once this record's deltas
    /// are applied. Standby nodes are not counted.
    pub fn total_node_count(&self) -> usize {
        (self.syncing as usize + self.joined_consensors.len() + self.active as usize)
            .saturating_sub(self.apoptosized.len())
            .saturating_sub(self.removed.len())
    }

    /// Recomputes and stores this record's marker from its typed fields.
    pub fn seal(&mut self, crypto: &dyn CryptoFacade) -> Result<(), CryptoError> {
        self.wire = WireForm::default();
        self.marker = compute_marker(crypto, self)?;
        Ok(())
    }
}

/// Hash of `record` with its own `marker` field removed.
pub fn compute_marker(
    crypto: &dyn CryptoFacade,
    record: &CycleRecord,
) -> Result<CycleMarker, CryptoError> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut value {
        map.remove(MARKER_FIELD);
    }
    Ok(crypto.hash_obj(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivist_crypto::{Ed25519Crypto, KeyPair};
    use serde_json::json;

    fn crypto() -> Ed25519Crypto {
        Ed25519Crypto::new(KeyPair::from_seed([7u8; 32]), b"archivist-test".to_vec())
    }

    #[test]
    fn test_marker_ignores_existing_marker_field() {
        let crypto = crypto();
        let mut record = CycleRecord::empty(5);
        let before = compute_marker(&crypto, &record).unwrap();
        record.marker = "something-else".into();
        assert_eq!(compute_marker(&crypto, &record).unwrap(), before);
    }

    #[test]
    fn test_marker_covers_only_received_fields() {
        let crypto = crypto();
        let hashed = json!({"counter": 3, "previous": "aa", "start": 10, "duration": 30});
        let producer_marker = crypto.hash_obj(&hashed);
        let mut sent = hashed.clone();
        sent["marker"] = json!(producer_marker);

        let record: CycleRecord = serde_json::from_value(sent.clone()).unwrap();
        assert_eq!(compute_marker(&crypto, &record).unwrap(), producer_marker);
        assert_eq!(serde_json::to_value(&record).unwrap(), sent);

        // Sealing hashes the typed fields, defaults included.
        let mut resealed = record.clone();
        resealed.seal(&crypto).unwrap();
        assert_ne!(resealed.marker, producer_marker);
        assert_eq!(resealed, record.clone());
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let crypto = crypto();
        let raw = json!({
            "counter": 4,
            "previous": "aa",
            "networkId": "test-net",
            "joinedConsensors": [],
        });
        let record: CycleRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.extra.get("networkId"), Some(&json!("test-net")));

        let mut stripped = raw;
        stripped.as_object_mut().unwrap().remove("networkId");
        let plain: CycleRecord = serde_json::from_value(stripped).unwrap();
        assert_ne!(
            compute_marker(&crypto, &record).unwrap(),
            compute_marker(&crypto, &plain).unwrap()
        );
    }

    #[test]
    fn test_node_counts() {
        let mut record = CycleRecord::empty(10);
        record.active = 9;
        record.syncing = 2;
        record.activated = vec!["a".into()];
        record.removed = vec!["b".into()];
        record.lost = vec!["c".into()];
        assert_eq!(record.active_node_count(), 8);
        assert_eq!(record.total_node_count(), 10);

        let mut tiny = CycleRecord::empty(1);
        tiny.removed = vec!["x".into(), "y".into()];
        assert_eq!(tiny.active_node_count(), 0);
        assert_eq!(tiny.total_node_count(), 0);
    }
}
