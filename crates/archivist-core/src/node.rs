use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CycleMarker, NodeId, PublicKey};

/// Membership status of a consensus node as tracked by the archiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Standby,
    Syncing,
    Active,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Standby => "standby",
            NodeStatus::Syncing => "syncing",
            NodeStatus::Active => "active",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address book entry for a consensus node, as served on `/nodelist`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusNodeInfo {
    pub ip: String,
    pub port: u16,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
}

impl ConsensusNodeInfo {
    /// `ip:port` key used by the registry's address index.
    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A consensor as it appears in a cycle record's join/refresh lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedConsensor {
    pub public_key: PublicKey,
    pub external_ip: String,
    pub external_port: u16,
    #[serde(default)]
    pub internal_ip: String,
    #[serde(default)]
    pub internal_port: u16,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub join_request_timestamp: u64,
    #[serde(default)]
    pub active_timestamp: u64,
    pub id: NodeId,
    /// Marker of the cycle the node joined in.
    #[serde(default)]
    pub cycle_joined: CycleMarker,
    /// Last counter at which the network re-confirmed this node.
    #[serde(default)]
    pub counter_refreshed: u64,
}

impl JoinedConsensor {
    pub fn to_node_info(&self) -> ConsensusNodeInfo {
        ConsensusNodeInfo {
            ip: self.external_ip.clone(),
            port: self.external_port,
            public_key: self.public_key.clone(),
            id: Some(self.id.clone()),
        }
    }
}

/// Partial node change keyed by id, produced when parsing cycle records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_refreshed: Option<u64>,
}

impl NodeUpdate {
    pub fn new(id: impl Into<NodeId>) -> Self {
        NodeUpdate {
            id: id.into(),
            status: None,
            active_timestamp: None,
            counter_refreshed: None,
        }
    }

    /// Fill fields this update leaves unset from an older update for the same id.
    /// Fields already set here are newer and are kept.
    pub fn absorb_older(&mut self, older: &NodeUpdate) {
        debug_assert_eq!(self.id, older.id);
        if self.status.is_none() {
            self.status = older.status;
        }
        if self.active_timestamp.is_none() {
            self.active_timestamp = older.active_timestamp;
        }
        if self.counter_refreshed.is_none() {
            self.counter_refreshed = older.counter_refreshed;
        }
    }
}
