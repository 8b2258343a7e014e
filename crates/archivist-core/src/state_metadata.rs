use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Network-wide account state hash for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHashes {
    pub counter: u64,
    #[serde(default)]
    pub partition_hashes: Value,
    pub network_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptHashes {
    pub counter: u64,
    #[serde(default)]
    pub receipt_map_hashes: Value,
    pub network_receipt_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryHashes {
    pub counter: u64,
    #[serde(default)]
    pub summary_hashes: Value,
    pub network_summary_hash: String,
}

/// One `STATE_METADATA` push item. Each list may span several cycles.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetaData {
    #[serde(default)]
    pub counter: u64,
    #[serde(default)]
    pub state_hashes: Vec<StateHashes>,
    #[serde(default)]
    pub receipt_hashes: Vec<ReceiptHashes>,
    #[serde(default)]
    pub summary_hashes: Vec<SummaryHashes>,
}

/// All metadata hashes for a single counter; the unit archivers gossip and
/// vote on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadataHash {
    pub counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_hashes: Option<StateHashes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_hashes: Option<ReceiptHashes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_hashes: Option<SummaryHashes>,
}

impl StateMetadataHash {
    fn empty(counter: u64) -> Self {
        StateMetadataHash {
            counter,
            state_hashes: None,
            receipt_hashes: None,
            summary_hashes: None,
        }
    }
}

impl StateMetaData {
    /// Splits this item per counter, ascending.
    pub fn to_hash_array(&self) -> Vec<StateMetadataHash> {
        let mut by_counter: BTreeMap<u64, StateMetadataHash> = BTreeMap::new();
        for h in &self.state_hashes {
            by_counter
                .entry(h.counter)
                .or_insert_with(|| StateMetadataHash::empty(h.counter))
                .state_hashes = Some(h.clone());
        }
        for h in &self.receipt_hashes {
            by_counter
                .entry(h.counter)
                .or_insert_with(|| StateMetadataHash::empty(h.counter))
                .receipt_hashes = Some(h.clone());
        }
        for h in &self.summary_hashes {
            by_counter
                .entry(h.counter)
                .or_insert_with(|| StateMetadataHash::empty(h.counter))
                .summary_hashes = Some(h.clone());
        }
        by_counter.into_values().collect()
    }

    /// Rebuilds a single-counter item from a gossiped hash entry.
    pub fn from_hash(hash: &StateMetadataHash) -> Self {
        StateMetaData {
            counter: hash.counter,
            state_hashes: hash.state_hashes.iter().cloned().collect(),
            receipt_hashes: hash.receipt_hashes.iter().cloned().collect(),
            summary_hashes: hash.summary_hashes.iter().cloned().collect(),
        }
    }
}
