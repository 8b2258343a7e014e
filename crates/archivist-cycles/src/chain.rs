use std::collections::BTreeMap;

use archivist_core::CycleRecord;

/// Accepted cycle records keyed by counter.
///
/// Live processing only appends past the newest counter; bootstrap replaces
/// the whole chain in one go.
#[derive(Debug, Default, Clone)]
pub struct CycleChain {
    records: BTreeMap<u64, CycleRecord>,
}

impl CycleChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, counter: u64) -> Option<&CycleRecord> {
        self.records.get(&counter)
    }

    pub fn latest(&self) -> Option<&CycleRecord> {
        self.records.values().next_back()
    }

    pub fn latest_counter(&self) -> Option<u64> {
        self.records.keys().next_back().copied()
    }

    /// Appends `record`. Returns false if it does not extend the chain.
    pub fn append(&mut self, record: CycleRecord) -> bool {
        if self.latest_counter().is_some_and(|c| record.counter <= c) {
            return false;
        }
        self.records.insert(record.counter, record);
        true
    }

    /// Replaces the chain with `records`, in any order.
    pub fn replace_all(&mut self, records: impl IntoIterator<Item = CycleRecord>) {
        self.records = records.into_iter().map(|r| (r.counter, r)).collect();
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
