use async_trait::async_trait;
use archivist_core::{CycleMarker, CycleRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no archived cycle with marker {0}")]
    UnknownMarker(CycleMarker),

    #[error("record already exists with key {0}")]
    Conflict(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Per-cycle section of the archive filled in from state metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchivedSection {
    Data,
    Receipt,
    Summary,
}

/// A stored cycle together with the metadata hashes attached to it later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedCycle {
    pub cycle_record: CycleRecord,
    pub cycle_marker: CycleMarker,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub receipt: Value,
    #[serde(default)]
    pub summary: Value,
}

impl ArchivedCycle {
    pub fn new(record: CycleRecord) -> Self {
        ArchivedCycle {
            cycle_marker: record.marker.clone(),
            cycle_record: record,
            data: Value::Object(Default::default()),
            receipt: Value::Object(Default::default()),
            summary: Value::Object(Default::default()),
        }
    }

    pub fn section(&self, section: ArchivedSection) -> &Value {
        match section {
            ArchivedSection::Data => &self.data,
            ArchivedSection::Receipt => &self.receipt,
            ArchivedSection::Summary => &self.summary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_id: String,
    pub hash: String,
    pub data: Value,
    pub timestamp: u64,
    pub cycle_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub receipt_id: String,
    pub tx_id: String,
    pub cycle: u64,
    pub timestamp: u64,
    pub data: Value,
}

/// Everything the archiver needs from a store.
///
/// Implementations must treat inserting a cycle whose marker is already
/// stored as a successful no-op.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_cycle(&self, record: &CycleRecord) -> Result<(), StorageError>;

    /// Newest `count` records, newest first.
    async fn query_latest_cycle_records(&self, count: usize) -> Result<Vec<CycleRecord>, StorageError>;

    /// Records with `start <= counter <= end`, oldest first.
    async fn query_cycle_records_between(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<CycleRecord>, StorageError>;

    async fn query_cycle_count(&self) -> Result<u64, StorageError>;

    async fn query_archived_cycle(&self, marker: &str) -> Result<Option<ArchivedCycle>, StorageError>;

    /// Replaces one section of an archived cycle.
    async fn update_archived_cycle(
        &self,
        marker: &str,
        section: ArchivedSection,
        value: Value,
    ) -> Result<(), StorageError>;

    async fn insert_account(&self, account: &Account) -> Result<(), StorageError>;
    async fn update_account(&self, account: &Account) -> Result<(), StorageError>;
    async fn query_account(&self, account_id: &str) -> Result<Option<Account>, StorageError>;

    async fn insert_receipt(&self, receipt: &Receipt) -> Result<(), StorageError>;

    // Generic keyed store.
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StorageError>;
    async fn all(&self, table: &str) -> Result<Vec<(String, Value)>, StorageError>;
    /// Writes `value` under `key`, or deletes the key when `value` is `None`.
    async fn run(&self, table: &str, key: &str, value: Option<Value>) -> Result<(), StorageError>;
}
