use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use archivist_core::{
    compute_marker, ArchiverNodeInfo, ConsensusNodeInfo, CycleRecord, NodeStatus, PublicKey,
    StateMetaData, StateMetadataHash,
};
use archivist_crypto::CryptoFacade;
use archivist_p2p::{ArchiverList, NodeRegistry};
use archivist_state::{ArchivedSection, Persistence};
use log::{debug, error, info, warn};

use crate::chain::CycleChain;
use crate::change::Change;

/// Counters of locally computed metadata hashes kept for reconciliation.
pub const METADATA_RETENTION: usize = 100;

/// Nodes a single cycle removed or apoptosized.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedNodes {
    pub counter: u64,
    pub nodes: Vec<ConsensusNodeInfo>,
}

/// What one call to [`CycleProcessor::process_cycles`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub accepted: Vec<u64>,
    pub skipped: Vec<u64>,
    pub rejected: Vec<u64>,
    /// Public keys of nodes removed or apoptosized by accepted records.
    pub removed_public_keys: Vec<PublicKey>,
    /// Number of nodes accepted records activated.
    pub activated: usize,
    pub archivers_joined: Vec<ArchiverNodeInfo>,
    pub archivers_left: Vec<PublicKey>,
}

impl CycleReport {
    pub fn advanced(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// Owns the archiver's view of the network: the node directory, the active
/// archiver list and the accepted cycle chain.
pub struct CycleProcessor {
    crypto: Arc<dyn CryptoFacade>,
    registry: NodeRegistry,
    archivers: ArchiverList,
    chain: CycleChain,
    current_duration: Option<Duration>,
    last_processed_metadata: Option<u64>,
    metadata: BTreeMap<u64, StateMetadataHash>,
    removed_nodes: VecDeque<RemovedNodes>,
    removed_history: usize,
}

impl CycleProcessor {
    pub fn new(crypto: Arc<dyn CryptoFacade>, archivers: ArchiverList, removed_history: usize) -> Self {
        CycleProcessor {
            crypto,
            registry: NodeRegistry::new(),
            archivers,
            chain: CycleChain::new(),
            current_duration: None,
            last_processed_metadata: None,
            metadata: BTreeMap::new(),
            removed_nodes: VecDeque::new(),
            removed_history,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn archivers(&self) -> &ArchiverList {
        &self.archivers
    }

    pub fn archivers_mut(&mut self) -> &mut ArchiverList {
        &mut self.archivers
    }

    pub fn chain(&self) -> &CycleChain {
        &self.chain
    }

    pub fn current_counter(&self) -> Option<u64> {
        self.chain.latest_counter()
    }

    /// Duration of the newest cycle, once one has been seen.
    pub fn current_duration(&self) -> Option<Duration> {
        self.current_duration
    }

    pub fn last_processed_metadata(&self) -> Option<u64> {
        self.last_processed_metadata
    }

    /// Advances the metadata pointer; never moves it backwards.
    pub fn mark_metadata_processed(&mut self, counter: u64) {
        if self.last_processed_metadata.map_or(true, |c| c < counter) {
            self.last_processed_metadata = Some(counter);
        }
    }

    pub fn removed_nodes(&self) -> impl Iterator<Item = &RemovedNodes> {
        self.removed_nodes.iter()
    }

    /// Drops all state. The archiver list is kept.
    pub fn reset(&mut self) {
        self.registry.reset();
        self.chain.clear();
        self.current_duration = None;
        self.last_processed_metadata = None;
        self.metadata.clear();
        self.removed_nodes.clear();
    }

    /// Applies pushed records in ascending counter order. Records at or
    /// below the current counter are skipped; records that do not link to
    /// the newest accepted record are rejected.
    pub async fn process_cycles(&mut self, mut cycles: Vec<CycleRecord>, store: &dyn Persistence) -> CycleReport {
        cycles.sort_by_key(|c| c.counter);
        let mut report = CycleReport::default();

        for mut record in cycles {
            if self.current_counter().is_some_and(|c| record.counter <= c) {
                report.skipped.push(record.counter);
                continue;
            }

            let marker = match compute_marker(self.crypto.as_ref(), &record) {
                Ok(marker) => marker,
                Err(e) => {
                    error!("cycle {}: cannot compute marker: {}", record.counter, e);
                    report.rejected.push(record.counter);
                    continue;
                }
            };
            if !record.marker.is_empty() && record.marker != marker {
                error!(
                    "cycle {}: carried marker {} but hashes to {}",
                    record.counter, record.marker, marker
                );
                report.rejected.push(record.counter);
                continue;
            }
            record.marker = marker;

            if let Some(last) = self.chain.latest() {
                if record.previous != last.marker {
                    error!(
                        "cycle {}: previous {} does not match marker {} of cycle {}",
                        record.counter, record.previous, last.marker, last.counter
                    );
                    report.rejected.push(record.counter);
                    continue;
                }
            }

            self.update_node_list(&record, &mut report);
            if let Err(e) = store.insert_cycle(&record).await {
                error!("cycle {} ({}): failed to persist: {}", record.counter, record.marker, e);
            }
            self.current_duration = Some(Duration::from_secs(record.duration));
            debug!("processed cycle {} ({})", record.counter, record.marker);
            report.accepted.push(record.counter);
            self.chain.append(record);
        }
        report
    }

    fn public_keys_for(&self, ids: &[String], out: &mut Vec<ConsensusNodeInfo>) -> Vec<PublicKey> {
        ids.iter()
            .filter_map(|id| self.registry.get_node_info_by_id(id))
            .map(|info| {
                let key = info.public_key.clone();
                out.push(info);
                key
            })
            .collect()
    }

    fn update_node_list(&mut self, record: &CycleRecord, report: &mut CycleReport) {
        // Standby nodes picked to join leave the standby bucket before the
        // joined list is applied.
        let leaving_standby: Vec<PublicKey> = record
            .standby_remove
            .iter()
            .filter(|pk| self.registry.status_of(pk) == Some(NodeStatus::Standby))
            .cloned()
            .collect();
        self.registry.remove_nodes(&leaving_standby);

        let joined: Vec<ConsensusNodeInfo> = record
            .joined_consensors
            .iter()
            .map(|jc| jc.to_node_info())
            .collect();
        self.registry
            .add_nodes(NodeStatus::Syncing, &record.marker, &joined);
        self.registry
            .add_nodes(NodeStatus::Standby, &record.marker, &record.standby_add);

        self.registry
            .set_status(NodeStatus::Active, &record.activated_public_keys);
        report.activated += record.activated_public_keys.len();

        let refreshed: Vec<ConsensusNodeInfo> = record
            .refreshed_consensors
            .iter()
            .map(|jc| jc.to_node_info())
            .collect();
        self.registry
            .refresh_nodes(NodeStatus::Active, &record.marker, &refreshed);
        for jc in &record.refreshed_consensors {
            self.registry.set_counter_refreshed(&jc.id, record.counter);
        }

        // Lost nodes are left alone; they reappear as apoptosized or refuted.
        let mut gone = Vec::new();
        let removed = self.public_keys_for(&record.removed, &mut gone);
        let apoptosized = self.public_keys_for(&record.apoptosized, &mut gone);
        let mut removed_keys = self.registry.remove_nodes(&removed);
        removed_keys.extend(self.registry.remove_nodes(&apoptosized));
        if !gone.is_empty() {
            self.removed_nodes.push_back(RemovedNodes {
                counter: record.counter,
                nodes: gone,
            });
            while self.removed_nodes.len() > self.removed_history {
                self.removed_nodes.pop_front();
            }
        }
        report.removed_public_keys.extend(removed_keys);

        for archiver in record
            .joined_archivers
            .iter()
            .chain(record.refreshed_archivers.iter())
        {
            if self.archivers.add(archiver.clone()) {
                info!("archiver {} joined at cycle {}", archiver.public_key, record.counter);
                report.archivers_joined.push(archiver.clone());
            }
        }
        for archiver in &record.leaving_archivers {
            if self.archivers.remove(&archiver.public_key) {
                info!("archiver {} left at cycle {}", archiver.public_key, record.counter);
                report.archivers_left.push(archiver.public_key.clone());
            }
        }
    }

    /// Installs the result of a bootstrap sync: applies `change` to an empty
    /// directory and persists `records` in counter order.
    pub async fn apply_bootstrap(&mut self, mut records: Vec<CycleRecord>, change: &Change, store: &dyn Persistence) {
        self.registry.reset();
        for joined in &change.added {
            self.registry.add_nodes(
                NodeStatus::Active,
                &joined.cycle_joined,
                &[joined.to_node_info()],
            );
        }
        for update in &change.updated {
            let Some(public_key) = self.registry.get_node_info_by_id(&update.id).map(|n| n.public_key) else {
                warn!("bootstrap update for unknown id {}", update.id);
                continue;
            };
            if let Some(status) = update.status {
                self.registry.set_status(status, &[public_key]);
            }
            if let Some(counter) = update.counter_refreshed {
                self.registry.set_counter_refreshed(&update.id, counter);
            }
        }
        let removed: Vec<PublicKey> = change
            .removed
            .iter()
            .filter_map(|id| self.registry.get_node_info_by_id(id).map(|n| n.public_key))
            .collect();
        self.registry.remove_nodes(&removed);

        records.sort_by_key(|r| r.counter);
        for record in &records {
            debug!("storing bootstrap cycle {} ({})", record.counter, record.marker);
            if let Err(e) = store.insert_cycle(record).await {
                error!("cycle {} ({}): failed to persist: {}", record.counter, record.marker, e);
            }
        }
        if let Some(newest) = records.last() {
            self.current_duration = Some(Duration::from_secs(newest.duration));
        }
        self.chain.replace_all(records);
        info!(
            "bootstrap applied: {} active, {} syncing, chain at {:?}",
            self.registry.active_count(),
            self.registry.get_syncing_list().len(),
            self.current_counter()
        );
    }
}

impl CycleProcessor {
    /// The metadata hash this archiver holds for `counter`.
    pub fn local_hash(&self, counter: u64) -> Option<&StateMetadataHash> {
        self.metadata.get(&counter)
    }

    /// Splits pushed metadata per counter, records it locally and attaches
    /// it to the archived cycle. Returns the per-counter hashes to gossip.
    pub async fn process_state_metadata(
        &mut self,
        items: &[StateMetaData],
        store: &dyn Persistence,
    ) -> Vec<StateMetadataHash> {
        let mut out = Vec::new();
        for item in items {
            for hash in item.to_hash_array() {
                self.attach_to_archive(&hash, store).await;
                self.mark_metadata_processed(hash.counter);
                self.metadata.insert(hash.counter, hash.clone());
                out.push(hash);
            }
        }
        while self.metadata.len() > METADATA_RETENTION {
            self.metadata.pop_first();
        }
        out
    }

    async fn attach_to_archive(&self, hash: &StateMetadataHash, store: &dyn Persistence) {
        let Some(record) = self.chain.get(hash.counter) else {
            debug!("metadata for cycle {} arrived before the cycle", hash.counter);
            return;
        };
        let sections = [
            (ArchivedSection::Data, serde_json::to_value(&hash.state_hashes)),
            (ArchivedSection::Receipt, serde_json::to_value(&hash.receipt_hashes)),
            (ArchivedSection::Summary, serde_json::to_value(&hash.summary_hashes)),
        ];
        for (section, value) in sections {
            let value = match value {
                Ok(serde_json::Value::Null) => continue,
                Ok(value) => value,
                Err(e) => {
                    error!("cycle {}: cannot encode {:?} hashes: {}", hash.counter, section, e);
                    continue;
                }
            };
            if let Err(e) = store.update_archived_cycle(&record.marker, section, value).await {
                error!("cycle {} ({}): failed to store {:?} hashes: {}", hash.counter, record.marker, section, e);
            }
        }
    }
}
