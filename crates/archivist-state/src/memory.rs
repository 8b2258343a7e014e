use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use archivist_core::CycleRecord;
use log::debug;
use parking_lot::RwLock;
use serde_json::Value;

use crate::persistence::{
    Account, ArchivedCycle, ArchivedSection, Persistence, Receipt, StorageError,
};

#[derive(Default)]
struct Tables {
    /// counter -> marker
    cycles_by_counter: BTreeMap<u64, String>,
    archived: HashMap<String, ArchivedCycle>,
    accounts: HashMap<String, Account>,
    receipts: HashMap<String, Receipt>,
    generic: HashMap<String, BTreeMap<String, Value>>,
}

/// [`Persistence`] held entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every stored row.
    pub fn clear(&self) {
        *self.tables.write() = Tables::default();
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn insert_cycle(&self, record: &CycleRecord) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        if tables.archived.contains_key(&record.marker) {
            debug!("cycle {} ({}) already stored", record.counter, record.marker);
            return Ok(());
        }
        if let Some(existing) = tables.cycles_by_counter.get(&record.counter) {
            return Err(StorageError::Conflict(format!(
                "counter {} already holds marker {}",
                record.counter, existing
            )));
        }
        tables
            .cycles_by_counter
            .insert(record.counter, record.marker.clone());
        tables
            .archived
            .insert(record.marker.clone(), ArchivedCycle::new(record.clone()));
        Ok(())
    }

    async fn query_latest_cycle_records(&self, count: usize) -> Result<Vec<CycleRecord>, StorageError> {
        let tables = self.tables.read();
        Ok(tables
            .cycles_by_counter
            .values()
            .rev()
            .take(count)
            .filter_map(|marker| tables.archived.get(marker))
            .map(|archived| archived.cycle_record.clone())
            .collect())
    }

    async fn query_cycle_records_between(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<CycleRecord>, StorageError> {
        if start > end {
            return Ok(Vec::new());
        }
        let tables = self.tables.read();
        Ok(tables
            .cycles_by_counter
            .range(start..=end)
            .filter_map(|(_, marker)| tables.archived.get(marker))
            .map(|archived| archived.cycle_record.clone())
            .collect())
    }

    async fn query_cycle_count(&self) -> Result<u64, StorageError> {
        Ok(self.tables.read().cycles_by_counter.len() as u64)
    }

    async fn query_archived_cycle(&self, marker: &str) -> Result<Option<ArchivedCycle>, StorageError> {
        Ok(self.tables.read().archived.get(marker).cloned())
    }

    async fn update_archived_cycle(
        &self,
        marker: &str,
        section: ArchivedSection,
        value: Value,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let archived = tables
            .archived
            .get_mut(marker)
            .ok_or_else(|| StorageError::UnknownMarker(marker.to_string()))?;
        match section {
            ArchivedSection::Data => archived.data = value,
            ArchivedSection::Receipt => archived.receipt = value,
            ArchivedSection::Summary => archived.summary = value,
        }
        Ok(())
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        if tables.accounts.contains_key(&account.account_id) {
            return Err(StorageError::Conflict(account.account_id.clone()));
        }
        tables
            .accounts
            .insert(account.account_id.clone(), account.clone());
        Ok(())
    }

    async fn update_account(&self, account: &Account) -> Result<(), StorageError> {
        self.tables
            .write()
            .accounts
            .insert(account.account_id.clone(), account.clone());
        Ok(())
    }

    async fn query_account(&self, account_id: &str) -> Result<Option<Account>, StorageError> {
        Ok(self.tables.read().accounts.get(account_id).cloned())
    }

    async fn insert_receipt(&self, receipt: &Receipt) -> Result<(), StorageError> {
        self.tables
            .write()
            .receipts
            .entry(receipt.receipt_id.clone())
            .or_insert_with(|| receipt.clone());
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .tables
            .read()
            .generic
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn all(&self, table: &str) -> Result<Vec<(String, Value)>, StorageError> {
        Ok(self
            .tables
            .read()
            .generic
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn run(&self, table: &str, key: &str, value: Option<Value>) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        match value {
            Some(value) => {
                tables
                    .generic
                    .entry(table.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
            None => {
                if let Some(rows) = tables.generic.get_mut(table) {
                    rows.remove(key);
                }
            }
        }
        Ok(())
    }
}
