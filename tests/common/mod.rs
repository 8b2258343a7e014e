//! In-process stand-ins for peer archivers and consensus nodes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use archivist::{Archiver, ArchiverConfig, ArchiverHandle, ArchiverStatus};
use archivist_core::{ArchiverNodeInfo, ConsensusNodeInfo, CycleRecord, JoinedConsensor, PublicKey};
use archivist_crypto::{CryptoFacade, Ed25519Crypto, KeyPair};
use archivist_data::{ConnectionId, PushConnector, PushEvent, PushHandle, SenderError};
use archivist_p2p::{PeerTransport, PushFrame, TransportError};
use archivist_state::MemoryStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const HASH_KEY: &[u8] = b"integration-hash-key";
pub const ARCHIVER_SEED: u8 = 50;
pub const CYCLE_SECONDS: u64 = 30;

pub fn crypto(seed: u8) -> Arc<Ed25519Crypto> {
    Arc::new(Ed25519Crypto::new(KeyPair::from_seed([seed; 32]), HASH_KEY.to_vec()))
}

pub fn consensor(node: &Ed25519Crypto, index: usize) -> JoinedConsensor {
    JoinedConsensor {
        public_key: node.public_key().to_string(),
        external_ip: "10.0.0.1".into(),
        external_port: 9001 + index as u16,
        internal_ip: "10.0.0.1".into(),
        internal_port: 10001 + index as u16,
        address: String::new(),
        join_request_timestamp: 1_700_000_000,
        active_timestamp: 0,
        id: format!("node-{}", index),
        cycle_joined: "genesis".into(),
        counter_refreshed: 0,
    }
}

/// Appends a record linked to the tip of `chain`, edited before sealing.
pub fn extend(chain: &mut Vec<CycleRecord>, edit: impl FnOnce(&mut CycleRecord)) {
    let counter = chain.last().map_or(0, |r| r.counter + 1);
    let mut record = CycleRecord::empty(counter);
    record.start = 1_700_000_000 + counter * CYCLE_SECONDS;
    record.duration = CYCLE_SECONDS;
    if let Some(prev) = chain.last() {
        record.previous = prev.marker.clone();
        record.active = prev.active_node_count() as u64;
    }
    edit(&mut record);
    record.seal(crypto(200).as_ref()).expect("seal fixture record");
    chain.push(record);
}

/// `len` records; every node joins and activates in the first one.
pub fn network_chain(nodes: &[Arc<Ed25519Crypto>], len: u64) -> Vec<CycleRecord> {
    let mut chain = Vec::new();
    extend(&mut chain, |r| {
        r.joined_consensors = nodes.iter().enumerate().map(|(i, n)| consensor(n, i)).collect();
        r.activated = r.joined_consensors.iter().map(|c| c.id.clone()).collect();
    });
    for _ in 1..len {
        extend(&mut chain, |_| {});
    }
    chain
}

pub struct Peer {
    pub info: ArchiverNodeInfo,
    pub crypto: Arc<Ed25519Crypto>,
}

/// Peer archivers that all serve the same signed chain.
pub struct Cluster {
    pub peers: Vec<Peer>,
    pub chain: Mutex<Vec<CycleRecord>>,
    pub gossip_posts: Mutex<Vec<(String, Value)>>,
    /// Join and leave requests posted to consensus nodes.
    pub node_posts: Mutex<Vec<(String, Value)>>,
    /// Peers that refuse every connection.
    pub offline: Mutex<Vec<PublicKey>>,
}

impl Cluster {
    pub fn new(peer_count: u8, chain: Vec<CycleRecord>) -> Arc<Self> {
        let peers = (1..=peer_count)
            .map(|seed| {
                let crypto = crypto(seed);
                Peer {
                    info: ArchiverNodeInfo {
                        public_key: crypto.public_key().to_string(),
                        ip: "127.0.0.1".into(),
                        port: 4100 + u16::from(seed),
                        curve_pk: None,
                    },
                    crypto,
                }
            })
            .collect();
        Arc::new(Cluster {
            peers,
            chain: Mutex::new(chain),
            gossip_posts: Mutex::new(Vec::new()),
            node_posts: Mutex::new(Vec::new()),
            offline: Mutex::new(Vec::new()),
        })
    }

    /// Node posts whose url ends with `/route`.
    pub fn posts_to(&self, route: &str) -> Vec<Value> {
        let suffix = format!("/{}", route);
        self.node_posts
            .lock()
            .iter()
            .filter(|(url, _)| url.ends_with(&suffix))
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn archivers(&self) -> Vec<ArchiverNodeInfo> {
        self.peers.iter().map(|p| p.info.clone()).collect()
    }

    fn peer_for(&self, url: &str) -> Result<&Peer, TransportError> {
        let offline = self.offline.lock();
        self.peers
            .iter()
            .filter(|p| !offline.contains(&p.info.public_key))
            .find(|p| url.starts_with(&p.info.base_url()))
            .ok_or_else(|| TransportError::Request {
                url: url.to_string(),
                reason: "connection refused".into(),
            })
    }
}

fn query_param(query: &str, name: &str) -> Option<u64> {
    query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == name)
        .and_then(|(_, v)| v.parse().ok())
}

#[async_trait]
impl PeerTransport for Cluster {
    async fn get_json(&self, url: &str, _timeout: Duration) -> Result<Value, TransportError> {
        let peer = self.peer_for(url)?;
        let path = &url[peer.info.base_url().len()..];
        let chain = self.chain.lock().clone();
        let body = if let Some(query) = path.strip_prefix("/cycleinfo?") {
            let start = query_param(query, "start").unwrap_or(0);
            let end = query_param(query, "end").unwrap_or(u64::MAX);
            let records: Vec<&CycleRecord> = chain
                .iter()
                .filter(|r| r.counter >= start && r.counter <= end)
                .collect();
            json!({ "cycleInfo": records })
        } else if let Some(count) = path.strip_prefix("/cycleinfo/") {
            let count: usize = count.parse().unwrap_or(1);
            let records: Vec<&CycleRecord> = chain.iter().rev().take(count).collect();
            json!({ "cycleInfo": records })
        } else if path == "/nodelist" {
            json!({ "nodeList": Vec::<ConsensusNodeInfo>::new() })
        } else {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: 404,
            });
        };
        Ok(peer.crypto.sign(body).expect("sign fixture response"))
    }

    async fn post_json(&self, url: &str, body: Value, _timeout: Duration) -> Result<Value, TransportError> {
        if url.ends_with("/joinarchiver") || url.ends_with("/leavingarchivers") {
            self.node_posts.lock().push((url.to_string(), body));
            return Ok(json!({ "success": true }));
        }
        self.peer_for(url)?;
        self.gossip_posts.lock().push((url.to_string(), body));
        Ok(json!({ "success": true }))
    }
}

/// Consensus nodes reachable over fake push sockets.
#[derive(Default)]
pub struct Nodes {
    links: Mutex<HashMap<PublicKey, mpsc::UnboundedReceiver<PushFrame>>>,
    events: Mutex<Option<mpsc::UnboundedSender<PushEvent>>>,
}

impl Nodes {
    /// Frames the archiver has sent to `public_key` since the last call.
    pub fn frames(&self, public_key: &str) -> Vec<PushFrame> {
        let mut links = self.links.lock();
        let mut out = Vec::new();
        if let Some(rx) = links.get_mut(public_key) {
            while let Ok(frame) = rx.try_recv() {
                out.push(frame);
            }
        }
        out
    }

    /// Delivers a `DATA` push from `node`, tagged for `archiver`.
    pub fn push(&self, node: &Ed25519Crypto, archiver: &str, responses: Value) {
        let body = node
            .tag(json!({ "responses": responses, "recipient": archiver }), archiver)
            .expect("tag fixture push");
        let events = self.events.lock();
        let events = events.as_ref().expect("no push socket opened yet");
        events
            .send(PushEvent::Data {
                from: node.public_key().to_string(),
                body,
            })
            .expect("archiver dropped its push channel");
    }
}

#[async_trait]
impl PushConnector for Nodes {
    async fn connect(
        &self,
        node: &ConsensusNodeInfo,
        _archiver_key: &str,
        connection: ConnectionId,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Result<PushHandle, SenderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().insert(node.public_key.clone(), rx);
        *self.events.lock() = Some(events);
        Ok(PushHandle::new(node.public_key.clone(), connection, tx))
    }
}

pub struct Harness {
    pub crypto: Arc<Ed25519Crypto>,
    pub store: Arc<MemoryStore>,
    pub nodes: Arc<Nodes>,
    pub handle: ArchiverHandle,
}

/// Bootstraps an archiver against `cluster` and starts its reactor.
pub async fn start(cluster: Arc<Cluster>, edit: impl FnOnce(&mut ArchiverConfig)) -> Harness {
    let crypto = crypto(ARCHIVER_SEED);
    let store = Arc::new(MemoryStore::new());
    let nodes = Arc::new(Nodes::default());
    let mut config = ArchiverConfig {
        bootstrap_archivers: cluster.archivers(),
        join_network: false,
        ..ArchiverConfig::default()
    };
    edit(&mut config);

    let (mut archiver, handle) = Archiver::new(
        config,
        crypto.clone(),
        store.clone(),
        cluster,
        nodes.clone(),
    );
    archiver.bootstrap().await.expect("bootstrap");
    tokio::spawn(archiver.run());
    Harness {
        crypto,
        store,
        nodes,
        handle,
    }
}

/// Polls the reactor until `done` holds for its status.
pub async fn wait_for(handle: &ArchiverHandle, done: impl Fn(&ArchiverStatus) -> bool) -> ArchiverStatus {
    for _ in 0..200 {
        let status = handle.status().await.expect("archiver stopped");
        if done(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("archiver never reached the expected state");
}
