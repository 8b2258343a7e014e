use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use archivist_core::{ArchiverNodeInfo, PublicKey};
use futures::future::join_all;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::client::ArchiverClient;

/// Default number of cycles a peer may trail us by and still count as up.
pub const DEFAULT_MAX_LAG: u64 = 10;

/// Advisory liveness of a peer archiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reputation {
    Up,
    Down,
}

impl fmt::Display for Reputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reputation::Up => f.write_str("up"),
            Reputation::Down => f.write_str("down"),
        }
    }
}

/// Active archivers known to this node, plus their last observed reputation.
#[derive(Debug, Default, Clone)]
pub struct ArchiverList {
    active: Vec<ArchiverNodeInfo>,
    reputation: HashMap<PublicKey, Reputation>,
}

impl ArchiverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_archivers(archivers: impl IntoIterator<Item = ArchiverNodeInfo>) -> Self {
        let mut list = Self::new();
        for archiver in archivers {
            list.add(archiver);
        }
        list
    }

    /// Adds `archiver` unless its public key is already listed.
    pub fn add(&mut self, archiver: ArchiverNodeInfo) -> bool {
        if self.contains(&archiver.public_key) {
            return false;
        }
        debug!("archiver {} added to active list", archiver.public_key);
        self.active.push(archiver);
        true
    }

    /// Removes the archiver and forgets its reputation.
    pub fn remove(&mut self, public_key: &str) -> bool {
        self.reputation.remove(public_key);
        let before = self.active.len();
        self.active.retain(|a| a.public_key != public_key);
        before != self.active.len()
    }

    pub fn contains(&self, public_key: &str) -> bool {
        self.active.iter().any(|a| a.public_key == public_key)
    }

    pub fn get(&self, public_key: &str) -> Option<&ArchiverNodeInfo> {
        self.active.iter().find(|a| a.public_key == public_key)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn archivers(&self) -> &[ArchiverNodeInfo] {
        &self.active
    }

    /// Archivers not currently marked down, for handing out to clients.
    pub fn up_archivers(&self) -> Vec<ArchiverNodeInfo> {
        self.active
            .iter()
            .filter(|a| self.reputation.get(&a.public_key) != Some(&Reputation::Down))
            .cloned()
            .collect()
    }

    pub fn reputation(&self, public_key: &str) -> Option<Reputation> {
        self.reputation.get(public_key).copied()
    }

    /// Stores poll results. Entries for archivers no longer listed are ignored.
    pub fn record_reputations(&mut self, results: impl IntoIterator<Item = (PublicKey, Reputation)>) {
        for (public_key, reputation) in results {
            if self.contains(&public_key) {
                self.reputation.insert(public_key, reputation);
            }
        }
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.reputation.clear();
    }
}

/// Classifies a peer by how far its newest counter trails ours.
pub fn classify(peer_counter: u64, local_counter: Option<u64>, max_lag: u64) -> Reputation {
    match local_counter {
        Some(local) if local > peer_counter && local - peer_counter > max_lag => Reputation::Down,
        _ => Reputation::Up,
    }
}

/// Asks every archiver for its newest cycle and classifies it.
pub async fn poll_reputations(
    client: &ArchiverClient,
    archivers: &[ArchiverNodeInfo],
    local_counter: Option<u64>,
    max_lag: u64,
    per_request: Duration,
) -> Vec<(PublicKey, Reputation)> {
    let polls = archivers.iter().map(|archiver| async move {
        let reputation = match timeout(per_request, client.newest_cycle(archiver)).await {
            Ok(Ok(record)) => {
                let rep = classify(record.counter, local_counter, max_lag);
                if rep == Reputation::Down {
                    debug!(
                        "archiver {}:{} has fallen behind: counter {} vs ours {:?}",
                        archiver.ip, archiver.port, record.counter, local_counter
                    );
                }
                rep
            }
            Ok(Err(e)) => {
                debug!("archiver {}:{} not responding correctly: {}", archiver.ip, archiver.port, e);
                Reputation::Down
            }
            Err(_) => {
                debug!("archiver {}:{} timed out", archiver.ip, archiver.port);
                Reputation::Down
            }
        };
        (archiver.public_key.clone(), reputation)
    });
    join_all(polls).await
}
