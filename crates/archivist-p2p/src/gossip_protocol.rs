use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use archivist_core::{ArchiverNodeInfo, PublicKey, StateMetadataHash};
use archivist_crypto::{CryptoError, CryptoFacade, SIGN_FIELD};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::client::ArchiverClient;
use crate::message_protocol::{GossipEnvelope, GossipPayload};

/// Default share of active archivers that must report a counter before it
/// is reconciled.
pub const DEFAULT_QUORUM_RATIO: f64 = 0.3;
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum GossipRejected {
    #[error("gossip is not a JSON object with a valid signature")]
    BadSignature,

    #[error("gossip signed by {signer} but claims sender {sender}")]
    SenderMismatch { signer: String, sender: String },

    #[error("gossip from unknown archiver {0}")]
    UnknownSender(PublicKey),

    #[error("gossip from ourselves")]
    FromSelf,

    #[error("malformed gossip: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct GossipConfig {
    pub quorum_ratio: f64,
    pub debounce: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            quorum_ratio: DEFAULT_QUORUM_RATIO,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// What a reconciliation pass decided for one counter.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Counter was reconciled before; nothing done.
    AlreadyProcessed,
    /// Nothing was collected for the counter.
    NoGossip,
    /// We hold no hashes of our own for the counter.
    NoLocalHashes,
    /// The majority agrees with us.
    Agree,
    /// The majority disagrees; adopt its hashes.
    Override(StateMetadataHash),
}

/// Collects peer hash gossip per counter and votes on it.
///
/// The coordinator never sleeps or sends on its own. [`add_hashes_gossip`]
/// reports when a counter should be reconciled; the owner waits the
/// debounce and then calls [`reconcile`].
///
/// [`add_hashes_gossip`]: GossipCoordinator::add_hashes_gossip
/// [`reconcile`]: GossipCoordinator::reconcile
pub struct GossipCoordinator {
    crypto: Arc<dyn CryptoFacade>,
    config: GossipConfig,
    collector: BTreeMap<u64, HashMap<PublicKey, StateMetadataHash>>,
    scheduled: HashSet<u64>,
    processed: HashSet<u64>,
    /// Highest counter reconciled so far.
    reconciled_up_to: Option<u64>,
}

impl GossipCoordinator {
    pub fn new(crypto: Arc<dyn CryptoFacade>, config: GossipConfig) -> Self {
        GossipCoordinator {
            crypto,
            config,
            collector: BTreeMap::new(),
            scheduled: HashSet::new(),
            processed: HashSet::new(),
            reconciled_up_to: None,
        }
    }

    pub fn config(&self) -> GossipConfig {
        self.config
    }

    /// Signed envelope ready to post to peers.
    pub fn build_envelope(&self, payload: GossipPayload) -> Result<Value, CryptoError> {
        let envelope = GossipEnvelope {
            sender: self.crypto.public_key().to_string(),
            payload,
        };
        self.crypto.sign(serde_json::to_value(envelope)?)
    }

    /// Checks an inbound envelope's signature and sender before parsing it.
    pub fn open_envelope(
        &self,
        raw: &Value,
        is_known_archiver: impl Fn(&str) -> bool,
    ) -> Result<GossipEnvelope, GossipRejected> {
        if !self.crypto.verify(raw) {
            return Err(GossipRejected::BadSignature);
        }
        let envelope: GossipEnvelope = serde_json::from_value(raw.clone())?;
        let signer = raw
            .get(SIGN_FIELD)
            .and_then(|s| s.get("owner"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if signer != envelope.sender {
            return Err(GossipRejected::SenderMismatch {
                signer: signer.to_string(),
                sender: envelope.sender,
            });
        }
        if envelope.sender == self.crypto.public_key() {
            return Err(GossipRejected::FromSelf);
        }
        if !is_known_archiver(&envelope.sender) {
            return Err(GossipRejected::UnknownSender(envelope.sender));
        }
        Ok(envelope)
    }

    /// Records `gossip` from `sender`. Returns the counter when it has just
    /// crossed the reporting threshold and should be reconciled after the
    /// debounce.
    pub fn add_hashes_gossip(
        &mut self,
        sender: &str,
        gossip: StateMetadataHash,
        active_archivers: usize,
    ) -> Option<u64> {
        let counter = gossip.counter;
        let settled = self
            .reconciled_up_to
            .is_some_and(|up_to| counter <= up_to && !self.scheduled.contains(&counter));
        if settled || self.processed.contains(&counter) {
            debug!("gossip for counter {} from {} arrived after reconciliation", counter, sender);
            return None;
        }
        let reports = self.collector.entry(counter).or_default();
        reports.insert(sender.to_string(), gossip);

        let threshold = self.config.quorum_ratio * active_archivers as f64;
        if (reports.len() as f64) > threshold && self.scheduled.insert(counter) {
            debug!(
                "counter {} has {} reports (threshold {:.1}), scheduling reconciliation",
                counter,
                reports.len(),
                threshold
            );
            return Some(counter);
        }
        None
    }

    /// Votes on the hashes collected for `counter`, with `local` counting as
    /// one extra vote. Runs at most once per counter.
    pub fn reconcile(&mut self, counter: u64, local: Option<&StateMetadataHash>) -> Reconciliation {
        self.scheduled.remove(&counter);
        if !self.processed.insert(counter) {
            info!("gossip for counter {} already reconciled", counter);
            return Reconciliation::AlreadyProcessed;
        }
        let reports = self.collector.remove(&counter);
        if self.reconciled_up_to.map_or(true, |up_to| up_to < counter) {
            self.reconciled_up_to = Some(counter);
        }
        self.prune_settled();
        let Some(reports) = reports else {
            return Reconciliation::NoGossip;
        };
        let Some(local) = local else {
            error!("no local state metadata hashes for counter {}", counter);
            return Reconciliation::NoLocalHashes;
        };
        let local_hash = match serde_json::to_value(local) {
            Ok(value) => self.crypto.hash_obj(&value),
            Err(e) => {
                error!("cannot hash local metadata for counter {}: {}", counter, e);
                return Reconciliation::NoLocalHashes;
            }
        };

        let mut votes: BTreeMap<String, (usize, StateMetadataHash)> = BTreeMap::new();
        votes.insert(local_hash.clone(), (1, local.clone()));
        for (sender, gossip) in reports {
            let Ok(value) = serde_json::to_value(&gossip) else {
                warn!("dropping unhashable gossip from {} for counter {}", sender, counter);
                continue;
            };
            votes
                .entry(self.crypto.hash_obj(&value))
                .or_insert((0, gossip))
                .0 += 1;
        }

        let top = votes.values().map(|(n, _)| *n).max().unwrap_or(0);
        let local_votes = votes.get(&local_hash).map(|(n, _)| *n).unwrap_or(0);
        if local_votes == top {
            info!(
                "counter {}: our hashes match the majority ({} votes)",
                counter, top
            );
            return Reconciliation::Agree;
        }

        // BTreeMap iterates in hash order, so ties resolve to the smallest hash.
        let winner = votes
            .into_iter()
            .find(|(_, (n, _))| *n == top)
            .map(|(hash, (_, gossip))| (hash, gossip));
        match winner {
            Some((hash, gossip)) => {
                warn!(
                    "counter {}: our hash {} differs from majority hash {} ({} votes vs {})",
                    counter, local_hash, hash, top, local_votes
                );
                Reconciliation::Override(gossip)
            }
            None => Reconciliation::Agree,
        }
    }

    /// Drops reports for counters at or below the reconciled watermark that
    /// never reached the threshold.
    fn prune_settled(&mut self) {
        let Some(up_to) = self.reconciled_up_to else {
            return;
        };
        let scheduled = &self.scheduled;
        let before = self.collector.len();
        self.collector
            .retain(|counter, _| *counter > up_to || scheduled.contains(counter));
        let dropped = before - self.collector.len();
        if dropped > 0 {
            debug!("dropped gossip for {} counters at or below {}", dropped, up_to);
        }
    }

    /// Counters with reports still waiting for a vote.
    pub fn pending_counters(&self) -> Vec<u64> {
        self.collector.keys().copied().collect()
    }

    /// Clears every collected report and the processed set.
    pub fn reset(&mut self) {
        self.collector.clear();
        self.scheduled.clear();
        self.processed.clear();
        self.reconciled_up_to = None;
    }
}

/// Best-effort fan-out of signed gossip to peer archivers.
#[derive(Clone)]
pub struct GossipSender {
    client: ArchiverClient,
    own_public_key: PublicKey,
}

impl GossipSender {
    pub fn new(client: ArchiverClient, own_public_key: PublicKey) -> Self {
        GossipSender {
            client,
            own_public_key,
        }
    }

    /// Posts `envelope` to every peer except ourselves. Failures are logged
    /// and dropped. Returns how many peers accepted it.
    pub async fn send_gossip(&self, route: &str, envelope: Value, peers: &[ArchiverNodeInfo]) -> usize {
        let targets: Vec<&ArchiverNodeInfo> = peers
            .iter()
            .filter(|p| p.public_key != self.own_public_key)
            .collect();
        let sends = targets.iter().map(|peer| {
            let envelope = envelope.clone();
            async move { (peer, self.client.post_gossip(peer, route, envelope).await) }
        });
        let mut accepted = 0;
        for (peer, outcome) in join_all(sends).await {
            match outcome {
                Ok(ack) if ack.success => accepted += 1,
                Ok(ack) => debug!(
                    "{}:{} refused {}: {:?}",
                    peer.ip, peer.port, route, ack.error
                ),
                Err(e) => warn!("gossip to {}:{} failed: {}", peer.ip, peer.port, e),
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockPeerTransport, TransportError};
    use archivist_core::StateHashes;
    use archivist_crypto::{Ed25519Crypto, KeyPair};
    use serde_json::json;

    const HASH_KEY: &[u8] = b"gossip-tests";

    fn crypto(seed: u8) -> Arc<Ed25519Crypto> {
        Arc::new(Ed25519Crypto::new(KeyPair::from_seed([seed; 32]), HASH_KEY.to_vec()))
    }

    fn hashes(counter: u64, network_hash: &str) -> StateMetadataHash {
        StateMetadataHash {
            counter,
            state_hashes: Some(StateHashes {
                counter,
                partition_hashes: json!({}),
                network_hash: network_hash.into(),
            }),
            receipt_hashes: None,
            summary_hashes: None,
        }
    }

    fn coordinator() -> GossipCoordinator {
        GossipCoordinator::new(crypto(1), GossipConfig::default())
    }

    #[test]
    fn test_threshold_schedules_once() {
        let mut gossip = coordinator();
        // 10 active archivers: more than 3 reports needed.
        for sender in ["a", "b", "c"] {
            assert_eq!(gossip.add_hashes_gossip(sender, hashes(5, "h1"), 10), None);
        }
        assert_eq!(gossip.add_hashes_gossip("d", hashes(5, "h1"), 10), Some(5));
        assert_eq!(gossip.add_hashes_gossip("e", hashes(5, "h1"), 10), None);
    }

    #[test]
    fn test_majority_overrides_local() {
        let mut gossip = coordinator();
        let mut scheduled = None;
        for sender in ["a", "b", "c", "d"] {
            scheduled = scheduled.or(gossip.add_hashes_gossip(sender, hashes(7, "H1"), 5));
        }
        assert_eq!(scheduled, Some(7));
        let local = hashes(7, "H2");
        assert_eq!(
            gossip.reconcile(7, Some(&local)),
            Reconciliation::Override(hashes(7, "H1"))
        );
        assert_eq!(gossip.reconcile(7, Some(&local)), Reconciliation::AlreadyProcessed);
        assert_eq!(gossip.add_hashes_gossip("e", hashes(7, "H1"), 5), None);
    }

    #[test]
    fn test_local_wins_ties_and_agreement() {
        let mut gossip = coordinator();
        gossip.add_hashes_gossip("a", hashes(3, "H1"), 2);
        gossip.add_hashes_gossip("b", hashes(3, "H2"), 2);
        // H2 has 1 + our vote, H1 has 1.
        assert_eq!(gossip.reconcile(3, Some(&hashes(3, "H2"))), Reconciliation::Agree);

        gossip.add_hashes_gossip("a", hashes(4, "H1"), 2);
        // One vote each.
        assert_eq!(gossip.reconcile(4, Some(&hashes(4, "H3"))), Reconciliation::Agree);
    }

    #[test]
    fn test_reconcile_without_local_or_gossip() {
        let mut gossip = coordinator();
        assert_eq!(gossip.reconcile(1, None), Reconciliation::NoGossip);
        gossip.add_hashes_gossip("a", hashes(2, "H1"), 1);
        assert_eq!(gossip.reconcile(2, None), Reconciliation::NoLocalHashes);
    }

    #[test]
    fn test_stragglers_below_reconciled_counter_are_dropped() {
        let mut gossip = coordinator();
        // 10 archivers: counters 3 and 4 stay under the threshold.
        gossip.add_hashes_gossip("a", hashes(3, "H1"), 10);
        gossip.add_hashes_gossip("a", hashes(4, "H1"), 10);
        let mut scheduled = None;
        for sender in ["a", "b", "c", "d"] {
            scheduled = scheduled.or(gossip.add_hashes_gossip(sender, hashes(6, "H1"), 10));
        }
        assert_eq!(scheduled, Some(6));
        gossip.add_hashes_gossip("a", hashes(8, "H1"), 10);
        assert_eq!(gossip.pending_counters(), vec![3, 4, 6, 8]);

        assert_eq!(gossip.reconcile(6, Some(&hashes(6, "H1"))), Reconciliation::Agree);
        assert_eq!(gossip.pending_counters(), vec![8]);
        assert_eq!(gossip.add_hashes_gossip("b", hashes(4, "H1"), 10), None);
        assert_eq!(gossip.pending_counters(), vec![8]);
    }

    #[test]
    fn test_scheduled_counter_survives_later_reconciliation() {
        let mut gossip = coordinator();
        assert_eq!(gossip.add_hashes_gossip("a", hashes(2, "H1"), 1), Some(2));
        assert_eq!(gossip.add_hashes_gossip("b", hashes(2, "H1"), 1), None);
        assert_eq!(gossip.add_hashes_gossip("a", hashes(5, "H1"), 1), Some(5));
        assert_eq!(gossip.reconcile(5, Some(&hashes(5, "H1"))), Reconciliation::Agree);
        assert_eq!(gossip.pending_counters(), vec![2]);
        assert_eq!(
            gossip.reconcile(2, Some(&hashes(2, "H2"))),
            Reconciliation::Override(hashes(2, "H1"))
        );
    }

    #[test]
    fn test_envelope_checks() {
        let me = coordinator();
        let peer = GossipCoordinator::new(crypto(2), GossipConfig::default());
        let peer_key = crypto(2).public_key().to_string();

        let envelope = peer
            .build_envelope(GossipPayload::Hashes(hashes(9, "h")))
            .unwrap();
        let opened = me.open_envelope(&envelope, |pk| pk == peer_key).unwrap();
        assert_eq!(opened.sender, peer_key);

        assert!(matches!(
            me.open_envelope(&envelope, |_| false),
            Err(GossipRejected::UnknownSender(_))
        ));

        let mut tampered = envelope.clone();
        tampered["payload"]["counter"] = json!(10);
        assert!(matches!(
            me.open_envelope(&tampered, |_| true),
            Err(GossipRejected::BadSignature)
        ));

        let own = me.build_envelope(GossipPayload::Hashes(hashes(9, "h"))).unwrap();
        assert!(matches!(
            me.open_envelope(&own, |_| true),
            Err(GossipRejected::FromSelf)
        ));

        // Peer signs an envelope that claims to come from someone else.
        let spoofed = crypto(2)
            .sign(json!({
                "sender": "someone-else",
                "payload": {"dataType": "hashes", "counter": 9},
            }))
            .unwrap();
        assert!(matches!(
            me.open_envelope(&spoofed, |_| true),
            Err(GossipRejected::SenderMismatch { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_send_gossip_skips_self_and_survives_failures() {
        let me = crypto(1);
        let peers: Vec<ArchiverNodeInfo> = (1..=3u16)
            .map(|n| ArchiverNodeInfo {
                public_key: crypto(n as u8).public_key().to_string(),
                ip: "127.0.0.1".into(),
                port: 5000 + n,
                curve_pk: None,
            })
            .collect();

        let mut transport = MockPeerTransport::new();
        transport
            .expect_post_json()
            .times(2)
            .returning(|url, _, _| {
                assert!(!url.contains(":5001/"));
                if url.contains(":5002/") {
                    Ok(json!({"success": true}))
                } else {
                    Err(TransportError::Timeout(url.to_string()))
                }
            });
        let client = ArchiverClient::new(
            Arc::new(transport),
            me.clone(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let sender = GossipSender::new(client, me.public_key().to_string());
        let accepted = sender
            .send_gossip("gossip-hashes", json!({"payload": {}}), &peers)
            .await;
        assert_eq!(accepted, 1);
    }
}
