use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use archivist_core::{ConsensusNodeInfo, CycleMarker, NodeId, NodeStatus, PublicKey};
use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;

/// Registry entry for one consensus node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub info: ConsensusNodeInfo,
    pub status: NodeStatus,
    /// Marker of the cycle that introduced this node to us.
    pub cycle_marker_joined: CycleMarker,
    pub counter_refreshed: Option<u64>,
}

/// In-memory directory of consensus nodes.
///
/// Every public key sits in exactly one status bucket. All mutation goes
/// through the methods below; reads hand out copies.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    /// Insertion order of public keys.
    list: Vec<PublicKey>,
    by_public_key: HashMap<PublicKey, NodeEntry>,
    by_ip_port: HashMap<String, PublicKey>,
    by_id: HashMap<NodeId, PublicKey>,

    syncing: HashSet<PublicKey>,
    active: HashSet<PublicKey>,
    standby: HashSet<PublicKey>,
    /// Active nodes ordered by `(id, public key)`.
    active_sorted: Vec<(NodeId, PublicKey)>,

    revision: u64,
    changed_at_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every node and resets the change clock.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Bumped on every mutation that changed the directory.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Wall clock time of the last directory change, in epoch millis.
    pub fn changed_at_ms(&self) -> u64 {
        self.changed_at_ms
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.changed_at_ms = now_ms();
    }

    fn bucket_mut(&mut self, status: NodeStatus) -> &mut HashSet<PublicKey> {
        match status {
            NodeStatus::Standby => &mut self.standby,
            NodeStatus::Syncing => &mut self.syncing,
            NodeStatus::Active => &mut self.active,
        }
    }

    fn sort_key(&self, public_key: &str) -> (NodeId, PublicKey) {
        let id = self
            .by_public_key
            .get(public_key)
            .and_then(|e| e.info.id.clone())
            .unwrap_or_default();
        (id, public_key.to_string())
    }

    fn insert_active_sorted(&mut self, public_key: &str) {
        let key = self.sort_key(public_key);
        if let Err(pos) = self.active_sorted.binary_search(&key) {
            self.active_sorted.insert(pos, key);
        }
    }

    fn remove_active_sorted(&mut self, public_key: &str) {
        self.active_sorted.retain(|(_, pk)| pk != public_key);
    }

    fn insert_missing(&mut self, status: NodeStatus, join_marker: &str, nodes: &[ConsensusNodeInfo]) -> usize {
        let mut inserted = 0;
        for node in nodes {
            let ip_port = node.ip_port();
            let known = self.by_public_key.contains_key(&node.public_key)
                || self.by_ip_port.contains_key(&ip_port);
            if !known {
                debug!("adding {} node {} at {}", status, node.public_key, ip_port);
                self.list.push(node.public_key.clone());
                self.by_ip_port.insert(ip_port, node.public_key.clone());
                self.by_public_key.insert(
                    node.public_key.clone(),
                    NodeEntry {
                        info: node.clone(),
                        status,
                        cycle_marker_joined: join_marker.to_string(),
                        counter_refreshed: None,
                    },
                );
                self.bucket_mut(status).insert(node.public_key.clone());
                if status == NodeStatus::Active {
                    self.insert_active_sorted(&node.public_key);
                }
                inserted += 1;
            }

            if let Some(id) = &node.id {
                self.assign_id(&node.public_key, id);
            }
        }
        inserted
    }

    /// Points `id` at `public_key`. A node that held `id` before loses it.
    fn assign_id(&mut self, public_key: &str, id: &str) {
        let Some(entry) = self.by_public_key.get_mut(public_key) else {
            return;
        };
        let previous = entry.info.id.replace(id.to_string());
        if previous.as_deref() == Some(id) && self.by_id.get(id).is_some_and(|pk| pk == public_key) {
            return;
        }
        if let Some(old) = previous.filter(|old| old != id) {
            if self.by_id.get(&old).is_some_and(|pk| pk == public_key) {
                self.by_id.remove(&old);
            }
        }
        if let Some(owner) = self.by_id.insert(id.to_string(), public_key.to_string()) {
            if owner != public_key {
                warn!("id {} moved from {} to {}", id, owner, public_key);
                if let Some(stale) = self.by_public_key.get_mut(&owner) {
                    stale.info.id = None;
                }
                self.resort_active(&owner);
            }
        }
        self.resort_active(public_key);
    }

    fn resort_active(&mut self, public_key: &str) {
        if self.active.contains(public_key) {
            self.remove_active_sorted(public_key);
            self.insert_active_sorted(public_key);
        }
    }

    /// Inserts nodes whose public key and address are both unknown. Known
    /// nodes are skipped but still pick up the id they carry.
    pub fn add_nodes(&mut self, status: NodeStatus, join_marker: &str, nodes: &[ConsensusNodeInfo]) -> usize {
        let inserted = self.insert_missing(status, join_marker, nodes);
        for node in nodes {
            if let Some(entry) = self.by_public_key.get_mut(&node.public_key) {
                entry.cycle_marker_joined = join_marker.to_string();
            }
        }
        if !nodes.is_empty() {
            self.touch();
        }
        inserted
    }

    /// Like [`add_nodes`](Self::add_nodes) for nodes the chain re-confirmed.
    /// Existing entries keep their join marker and status.
    pub fn refresh_nodes(&mut self, status: NodeStatus, join_marker: &str, nodes: &[ConsensusNodeInfo]) -> usize {
        let inserted = self.insert_missing(status, join_marker, nodes);
        if !nodes.is_empty() {
            self.touch();
        }
        inserted
    }

    /// Removes nodes from every index. Returns the keys actually removed.
    pub fn remove_nodes(&mut self, public_keys: &[PublicKey]) -> Vec<PublicKey> {
        let mut to_delete: HashSet<PublicKey> = HashSet::new();
        let mut removed = Vec::new();
        for key in public_keys {
            let Some(entry) = self.by_public_key.remove(key) else {
                warn!("remove_nodes: public key {} not in node list", key);
                continue;
            };
            self.by_ip_port.remove(&entry.info.ip_port());
            if let Some(id) = &entry.info.id {
                if self.by_id.get(id) == Some(key) {
                    self.by_id.remove(id);
                }
            }
            self.bucket_mut(entry.status).remove(key);
            if to_delete.insert(key.clone()) {
                removed.push(key.clone());
            }
        }

        if !to_delete.is_empty() {
            self.list.retain(|pk| !to_delete.contains(pk));
            self.active_sorted.retain(|(_, pk)| !to_delete.contains(pk));
            self.touch();
        }
        removed
    }

    /// Moves nodes into the `status` bucket.
    pub fn set_status(&mut self, status: NodeStatus, public_keys: &[PublicKey]) {
        for key in public_keys {
            let Some(entry) = self.by_public_key.get_mut(key) else {
                warn!("set_status: public key {} not in node list", key);
                continue;
            };
            let old = entry.status;
            if old == status {
                continue;
            }
            entry.status = status;
            self.bucket_mut(old).remove(key);
            self.bucket_mut(status).insert(key.clone());
            if old == NodeStatus::Active {
                self.remove_active_sorted(key);
            }
            if status == NodeStatus::Active {
                self.insert_active_sorted(key);
            }
        }
        if !public_keys.is_empty() {
            self.touch();
        }
    }

    /// Records the newest counter at which the network confirmed `id`.
    pub fn set_counter_refreshed(&mut self, id: &str, counter: u64) {
        let Some(key) = self.by_id.get(id) else {
            warn!("set_counter_refreshed: id {} not in node list", id);
            return;
        };
        if let Some(entry) = self.by_public_key.get_mut(key) {
            if entry.counter_refreshed.map_or(true, |c| c < counter) {
                entry.counter_refreshed = Some(counter);
            }
        }
    }

    fn infos<'a>(&'a self, keys: impl Iterator<Item = &'a PublicKey>) -> Vec<ConsensusNodeInfo> {
        keys.filter_map(|k| self.by_public_key.get(k))
            .map(|e| e.info.clone())
            .collect()
    }

    /// Active nodes ordered by id.
    pub fn get_active_list(&self) -> Vec<ConsensusNodeInfo> {
        self.infos(self.active_sorted.iter().map(|(_, pk)| pk))
    }

    /// Syncing nodes in the order they were added.
    pub fn get_syncing_list(&self) -> Vec<ConsensusNodeInfo> {
        self.infos(self.list.iter().filter(|pk| self.syncing.contains(*pk)))
    }

    pub fn get_standby_list(&self) -> Vec<ConsensusNodeInfo> {
        self.infos(self.list.iter().filter(|pk| self.standby.contains(*pk)))
    }

    /// Every known node in insertion order.
    pub fn get_list(&self) -> Vec<ConsensusNodeInfo> {
        self.infos(self.list.iter())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, public_key: &str) -> bool {
        self.active.contains(public_key)
    }

    pub fn status_of(&self, public_key: &str) -> Option<NodeStatus> {
        self.by_public_key.get(public_key).map(|e| e.status)
    }

    pub fn get_entry(&self, public_key: &str) -> Option<&NodeEntry> {
        self.by_public_key.get(public_key)
    }

    pub fn get_node_info(&self, public_key: &str) -> Option<ConsensusNodeInfo> {
        self.by_public_key.get(public_key).map(|e| e.info.clone())
    }

    pub fn get_entry_by_id(&self, id: &str) -> Option<&NodeEntry> {
        self.by_id.get(id).and_then(|pk| self.by_public_key.get(pk))
    }

    pub fn get_node_info_by_id(&self, id: &str) -> Option<ConsensusNodeInfo> {
        self.by_id.get(id).and_then(|pk| self.get_node_info(pk))
    }

    /// Uniform sample of active nodes without replacement. `n <= 1` yields
    /// a single node; an empty active set yields nothing.
    pub fn get_random_active_nodes(&self, n: usize) -> Vec<ConsensusNodeInfo> {
        self.get_random_active_nodes_with(&mut rand::thread_rng(), n)
    }

    pub fn get_random_active_nodes_with<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<ConsensusNodeInfo> {
        let active = self.get_active_list();
        if n <= 1 {
            return active.choose(rng).cloned().into_iter().collect();
        }
        active.choose_multiple(rng, n.min(active.len())).cloned().collect()
    }

    #[cfg(test)]
    fn ids_consistent(&self) -> bool {
        let labelled: Vec<(&NodeId, &PublicKey)> = self
            .by_public_key
            .iter()
            .filter_map(|(pk, e)| e.info.id.as_ref().map(|id| (id, pk)))
            .collect();
        labelled.len() == self.by_id.len()
            && labelled
                .iter()
                .all(|(id, pk)| self.by_id.get(*id) == Some(*pk))
    }

    #[cfg(test)]
    fn bucket_count(&self, public_key: &str) -> usize {
        [&self.syncing, &self.active, &self.standby]
            .iter()
            .filter(|b| b.contains(public_key))
            .count()
    }
}
