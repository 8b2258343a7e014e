// Bootstrap sync
//
// Establishes a validated cycle chain and the net membership change needed
// to rebuild the node directory from untrusted peer archivers.
//
// INVARIANTS:
// 1. The anchor is the newest record a quorum of archivers agree on.
// 2. Every record prepended to the chain hashes to its successor's `previous`.
// 3. The walk stops once the squashed change covers the anchor's active and
//    total node counts, at genesis, or after `max_rounds` fetches.

use std::collections::VecDeque;
use std::sync::Arc;

use archivist_core::{compute_marker, ArchiverNodeInfo, CycleRecord};
use archivist_crypto::{CryptoError, CryptoFacade};
use archivist_p2p::{
    robust_query, sequential_query, ArchiverClient, NodeRegistry, QueryError, TransportError,
};
use archivist_state::{Persistence, StorageError};
use log::{debug, info, warn};
use thiserror::Error;

use crate::change::{parse_record, Change};
use crate::squasher::ChangeSquasher;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("quorum failure: {0}")]
    Query(#[from] QueryError),

    #[error("no usable records older than cycle {counter}")]
    NoProgress { counter: u64 },

    #[error("membership still incomplete after {rounds} fetch rounds")]
    Exhausted { rounds: usize },

    #[error("local store is at cycle {local} but the network is at {network}")]
    LocalAhead { local: u64, network: u64 },

    #[error("stored cycle {counter} differs from the network's")]
    HistoryMismatch { counter: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl SyncError {
    /// Errors after which the process must not keep serving or persisting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::LocalAhead { .. } | SyncError::HistoryMismatch { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub redundancy: usize,
    pub max_rounds: usize,
    pub history_check_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            redundancy: 3,
            max_rounds: 64,
            history_check_depth: 10,
        }
    }
}

/// A validated chain ending at `anchor` and the change it squashes to.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub anchor: CycleRecord,
    /// Ascending by counter, anchor last.
    pub records: Vec<CycleRecord>,
    pub change: Change,
}

/// Records to walk back from an anchor with `active` nodes.
pub fn cycles_to_get(active: usize) -> u64 {
    2 * isqrt(active as u64) + 2
}

fn isqrt(n: u64) -> u64 {
    let mut root = (n as f64).sqrt() as u64;
    while root * root > n {
        root -= 1;
    }
    while (root + 1) * (root + 1) <= n {
        root += 1;
    }
    root
}

pub struct CycleChainSync {
    client: ArchiverClient,
    crypto: Arc<dyn CryptoFacade>,
    config: SyncConfig,
}

impl CycleChainSync {
    pub fn new(client: ArchiverClient, crypto: Arc<dyn CryptoFacade>, config: SyncConfig) -> Self {
        CycleChainSync {
            client,
            crypto,
            config,
        }
    }

    /// Anchor, local history check, then the backward walk.
    pub async fn run(
        &self,
        archivers: &[ArchiverNodeInfo],
        store: &dyn Persistence,
    ) -> Result<SyncOutcome, SyncError> {
        let anchor = self.fetch_anchor(archivers).await?;
        self.verify_local_history(archivers, &anchor, store).await?;
        self.sync_cycles_and_node_list(archivers, anchor).await
    }

    /// The newest record a quorum of `archivers` agree on, with its marker
    /// recomputed locally.
    pub async fn fetch_anchor(&self, archivers: &[ArchiverNodeInfo]) -> Result<CycleRecord, SyncError> {
        let crypto = self.crypto.as_ref();
        let mut anchor = robust_query(
            archivers,
            |archiver| {
                let client = self.client.clone();
                async move { client.newest_cycle(&archiver).await }
            },
            |a, b| {
                a.counter == b.counter
                    && matches!(
                        (compute_marker(crypto, a), compute_marker(crypto, b)),
                        (Ok(x), Ok(y)) if x == y
                    )
            },
            self.config.redundancy,
            self.client.timeout(),
        )
        .await?;
        anchor.marker = compute_marker(crypto, &anchor)?;
        info!("sync anchor is cycle {} ({})", anchor.counter, anchor.marker);
        Ok(anchor)
    }

    /// Walks back from `anchor` until the squashed change accounts for every
    /// node the anchor reports.
    pub async fn sync_cycles_and_node_list(
        &self,
        archivers: &[ArchiverNodeInfo],
        anchor: CycleRecord,
    ) -> Result<SyncOutcome, SyncError> {
        let active = anchor.active_node_count();
        let total = anchor.total_node_count();
        let window = cycles_to_get(active);
        debug!(
            "sync from cycle {}: {} active, {} total, window {}",
            anchor.counter, active, total, window
        );

        // Bootstrap starts from an empty directory: every refreshed node is new.
        let empty = NodeRegistry::new();
        let mut squasher = ChangeSquasher::new();
        squasher.add_change(&parse_record(&anchor, &empty));

        let mut chain: VecDeque<CycleRecord> = VecDeque::from([anchor.clone()]);
        let mut rounds = 0;

        loop {
            if squasher.updated_len() >= active && squasher.added_len() >= total {
                break;
            }
            let head = match chain.front() {
                Some(head) if head.counter > 0 => head.clone(),
                _ => {
                    info!("sync reached genesis before membership was complete");
                    break;
                }
            };
            if rounds >= self.config.max_rounds {
                return Err(SyncError::Exhausted { rounds });
            }
            rounds += 1;

            let end = head.counter - 1;
            let start = end.saturating_sub(window.saturating_sub(1));
            let answer = sequential_query(
                archivers,
                |archiver| {
                    let client = self.client.clone();
                    async move {
                        let records = client.cycle_range(&archiver, start, end).await?;
                        if records.is_empty() {
                            return Err(TransportError::Malformed {
                                url: archiver.base_url(),
                                reason: format!("no cycles in {}..={}", start, end),
                            });
                        }
                        Ok(records)
                    }
                },
                self.client.bulk_timeout(),
            )
            .await?;

            let mut fetched = answer.value;
            fetched.sort_by(|a, b| b.counter.cmp(&a.counter));

            let mut prepended = 0;
            for mut record in fetched {
                let Some(head) = chain.front() else { break };
                if record.counter >= head.counter {
                    continue;
                }
                let marker = compute_marker(self.crypto.as_ref(), &record)?;
                if head.previous != marker {
                    warn!(
                        "cycle {} from {} does not link to cycle {} ({} != {})",
                        record.counter, answer.peer.public_key, head.counter, marker, head.previous
                    );
                    break;
                }
                record.marker = marker;
                squasher.add_change(&parse_record(&record, &empty));
                chain.push_front(record);
                prepended += 1;
            }

            if prepended == 0 {
                return Err(SyncError::NoProgress {
                    counter: head.counter,
                });
            }
            debug!(
                "sync round {}: prepended {} records, {} added, {} updated",
                rounds,
                prepended,
                squasher.added_len(),
                squasher.updated_len()
            );
        }

        let change = squasher.final_change();
        info!(
            "sync done: {} records back to cycle {}, {} nodes added, {} removed",
            chain.len(),
            chain.front().map_or(anchor.counter, |r| r.counter),
            change.added.len(),
            change.removed.len()
        );
        Ok(SyncOutcome {
            anchor,
            records: chain.into(),
            change,
        })
    }

    /// Fails if the local store is ahead of the network or disagrees with
    /// it on recent history.
    pub async fn verify_local_history(
        &self,
        archivers: &[ArchiverNodeInfo],
        anchor: &CycleRecord,
        store: &dyn Persistence,
    ) -> Result<(), SyncError> {
        let local = store
            .query_latest_cycle_records(self.config.history_check_depth)
            .await?;
        let (Some(newest), Some(oldest)) = (local.first(), local.last()) else {
            return Ok(());
        };
        if newest.counter > anchor.counter {
            return Err(SyncError::LocalAhead {
                local: newest.counter,
                network: anchor.counter,
            });
        }

        let (start, end) = (oldest.counter, newest.counter);
        let answer = sequential_query(
            archivers,
            |archiver| {
                let client = self.client.clone();
                async move { client.cycle_range(&archiver, start, end).await }
            },
            self.client.bulk_timeout(),
        )
        .await?;

        for stored in &local {
            let Some(remote) = answer.value.iter().find(|r| r.counter == stored.counter) else {
                warn!("history check: network did not return cycle {}", stored.counter);
                continue;
            };
            if compute_marker(self.crypto.as_ref(), remote)? != stored.marker {
                return Err(SyncError::HistoryMismatch {
                    counter: stored.counter,
                });
            }
        }
        info!("local history {}..={} matches the network", start, end);
        Ok(())
    }
}
