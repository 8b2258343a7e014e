//! Typed messages exchanged with peer archivers and consensus nodes.
//!
//! Everything crossing the wire is parsed into one of these shapes before
//! business logic sees it; unknown fields are ignored, missing ones reject
//! the message.

use archivist_core::{ConsensusNodeInfo, CycleRecord, PublicKey, StateMetadataHash};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `GET /cycleinfo/:count` and `GET /cycleinfo?start&end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleInfoResponse {
    pub cycle_info: Vec<CycleRecord>,
}

/// Body of `GET /nodelist`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeListResponse {
    pub node_list: Vec<ConsensusNodeInfo>,
}

/// Reply to an accepted or rejected gossip post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One kind of gossip per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dataType", rename_all = "lowercase")]
pub enum GossipPayload {
    Hashes(StateMetadataHash),
}

impl GossipPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipPayload::Hashes(_) => "hashes",
        }
    }

    /// Peer route the payload is posted to.
    pub fn route(&self) -> String {
        format!("gossip-{}", self.kind())
    }
}

/// Signed wrapper around a gossip payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    pub sender: PublicKey,
    pub payload: GossipPayload,
}

/// Frames on the push socket, one JSON document per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushFrame {
    /// Archiver to node, right after connecting.
    ArchiverPublicKey(PublicKey),
    /// Archiver to node: a `DataRequest` tagged for that node.
    DataRequest(Value),
    /// Archiver to node before hanging up.
    Unsubscribe(PublicKey),
    /// Node to archiver: a tagged `DataResponse`.
    Data(Value),
}

impl PushFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gossip_payload_is_tagged() {
        let payload = GossipPayload::Hashes(StateMetadataHash {
            counter: 9,
            state_hashes: None,
            receipt_hashes: None,
            summary_hashes: None,
        });
        assert_eq!(payload.route(), "gossip-hashes");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"dataType": "hashes", "counter": 9}));
        let back: GossipPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_unknown_gossip_kind_is_rejected() {
        let raw = json!({"sender": "aa", "payload": {"dataType": "receipts", "counter": 1}});
        assert!(serde_json::from_value::<GossipEnvelope>(raw).is_err());
    }

    #[test]
    fn test_push_frame_line_format() {
        let frame = PushFrame::ArchiverPublicKey("abcd".into());
        assert_eq!(
            frame.encode().unwrap(),
            r#"{"event":"ARCHIVER_PUBLIC_KEY","body":"abcd"}"#
        );
        assert_eq!(PushFrame::decode(r#"{"event":"DATA","body":{}}"#).unwrap(), PushFrame::Data(json!({})));
    }

    #[test]
    fn test_cycle_info_ignores_envelope_fields() {
        let raw = json!({
            "cycleInfo": [{"counter": 2, "previous": "p"}],
            "currentTime": 1234,
            "sign": {"owner": "o", "sig": "s"},
        });
        let parsed: CycleInfoResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.cycle_info[0].counter, 2);
    }
}
