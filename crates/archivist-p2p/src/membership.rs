//! Joining and leaving the archiver set.
//!
//! Consensus nodes admit archivers through the cycle they are listed in. An
//! archiver posts a signed join request to a few active nodes at the start
//! of a cycle (the first quarter), then watches the chain for its key in
//! `joinedArchivers` or `refreshedArchivers`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use archivist_core::{ArchiverNodeInfo, ConsensusNodeInfo, CycleRecord};
use archivist_crypto::{CryptoError, CryptoFacade};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::client::ArchiverClient;
use crate::transport::TransportError;

/// Most nodes one join request is sent to.
pub const JOIN_FANOUT: usize = 5;
/// Margin after the start of the first quarter before a join is posted.
pub const Q1_MARGIN: Duration = Duration::from_millis(500);

pub const JOIN_ROUTE: &str = "joinarchiver";
pub const LEAVE_ROUTE: &str = "leavingarchivers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Join,
    Leave,
}

/// Body of a join or leave request, signed before sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRequest {
    pub node_info: ArchiverNodeInfo,
    pub request_type: RequestType,
    /// Milliseconds since the epoch.
    pub request_timestamp: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Time from `now_ms` until the first quarter of the next cycle begins,
/// plus [`Q1_MARGIN`]. `latest` gives the cycle phase.
pub fn until_next_q1(latest: &CycleRecord, now_ms: u64) -> Duration {
    let cycle_ms = latest.duration * 1000;
    let q1_ms = (latest.start + latest.duration) * 1000;
    let wait_ms = if now_ms <= q1_ms {
        q1_ms - now_ms
    } else if cycle_ms == 0 {
        0
    } else {
        let into = (now_ms - q1_ms) % cycle_ms;
        if into == 0 {
            0
        } else {
            cycle_ms - into
        }
    };
    Duration::from_millis(wait_ms) + Q1_MARGIN
}

/// True if `record` admits or refreshes the archiver with `public_key`.
pub fn lists_archiver(record: &CycleRecord, public_key: &str) -> bool {
    record
        .joined_archivers
        .iter()
        .chain(&record.refreshed_archivers)
        .any(|a| a.public_key == public_key)
}

#[derive(Clone)]
pub struct Membership {
    client: ArchiverClient,
    crypto: Arc<dyn CryptoFacade>,
    node_info: ArchiverNodeInfo,
}

impl Membership {
    pub fn new(client: ArchiverClient, crypto: Arc<dyn CryptoFacade>, node_info: ArchiverNodeInfo) -> Self {
        Membership {
            client,
            crypto,
            node_info,
        }
    }

    pub fn node_info(&self) -> &ArchiverNodeInfo {
        &self.node_info
    }

    pub fn request(&self, request_type: RequestType) -> Result<Value, CryptoError> {
        let request = MembershipRequest {
            node_info: self.node_info.clone(),
            request_type,
            request_timestamp: now_ms(),
        };
        self.crypto.sign(serde_json::to_value(request)?)
    }

    /// Posts a join request to up to [`JOIN_FANOUT`] random `nodes`.
    /// Returns how many accepted the post.
    pub async fn submit_join(&self, nodes: &[ConsensusNodeInfo]) -> Result<usize, CryptoError> {
        let request = self.request(RequestType::Join)?;
        let chosen: Vec<&ConsensusNodeInfo> = nodes
            .choose_multiple(&mut rand::thread_rng(), nodes.len().min(JOIN_FANOUT))
            .collect();
        let mut delivered = 0;
        for node in chosen {
            match self.client.post_to_node(node, JOIN_ROUTE, request.clone()).await {
                Ok(reply) => {
                    debug!("join request to {}: {}", node.ip_port(), reply);
                    delivered += 1;
                }
                Err(e) => warn!("join request to {} failed: {}", node.ip_port(), e),
            }
        }
        info!("join request delivered to {} node(s)", delivered);
        Ok(delivered)
    }

    /// Asks a random archiver whether its newest cycle lists us.
    pub async fn check_join_status(&self, archivers: &[ArchiverNodeInfo]) -> Result<bool, TransportError> {
        let Some(archiver) = archivers.choose(&mut rand::thread_rng()) else {
            return Ok(false);
        };
        let newest = self.client.newest_cycle(archiver).await?;
        let joined = lists_archiver(&newest, &self.node_info.public_key);
        debug!(
            "cycle {} from {} {} us",
            newest.counter,
            archiver.public_key,
            if joined { "lists" } else { "does not list" }
        );
        Ok(joined)
    }

    /// Tells `node` this archiver is leaving.
    pub async fn send_leave(&self, node: &ConsensusNodeInfo) -> Result<(), LeaveError> {
        let request = self.request(RequestType::Leave)?;
        let reply = self.client.post_to_node(node, LEAVE_ROUTE, request).await?;
        info!("leave request sent to {}: {}", node.ip_port(), reply);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LeaveError {
    #[error("cannot sign leave request: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockPeerTransport;
    use archivist_crypto::{Ed25519Crypto, KeyPair};
    use serde_json::json;

    const HASH_KEY: &[u8] = b"membership-tests";

    fn crypto(seed: u8) -> Ed25519Crypto {
        Ed25519Crypto::new(KeyPair::from_seed([seed; 32]), HASH_KEY.to_vec())
    }

    fn node(i: u16) -> ConsensusNodeInfo {
        ConsensusNodeInfo {
            ip: "10.0.0.1".into(),
            port: 9000 + i,
            public_key: format!("node{}", i),
            id: None,
        }
    }

    fn membership(transport: MockPeerTransport) -> (Membership, Arc<Ed25519Crypto>) {
        let local = Arc::new(crypto(1));
        let client = ArchiverClient::new(
            Arc::new(transport),
            local.clone(),
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        let info = ArchiverNodeInfo {
            public_key: local.public_key().to_string(),
            ip: "127.0.0.1".into(),
            port: 4000,
            curve_pk: None,
        };
        (Membership::new(client, local.clone(), info), local)
    }

    #[test]
    fn test_wait_lands_on_next_first_quarter() {
        let mut latest = CycleRecord::empty(10);
        latest.start = 1000;
        latest.duration = 30;
        // The next cycle starts at 1030s.
        assert_eq!(until_next_q1(&latest, 1_020_000), Duration::from_millis(10_500));
        assert_eq!(until_next_q1(&latest, 1_030_000), Duration::from_millis(500));
        assert_eq!(until_next_q1(&latest, 1_031_000), Duration::from_millis(29_500));
        assert_eq!(until_next_q1(&latest, 1_090_000), Duration::from_millis(500));

        latest.duration = 0;
        assert_eq!(until_next_q1(&latest, 5_000_000), Q1_MARGIN);
    }

    #[tokio::test]
    async fn test_join_goes_to_at_most_five_nodes() {
        let mut transport = MockPeerTransport::new();
        transport
            .expect_post_json()
            .times(JOIN_FANOUT)
            .withf(|url, body, _| {
                url.ends_with("/joinarchiver") && body["requestType"] == json!("JOIN")
            })
            .returning(|_, _, _| Ok(json!({ "success": true })));
        let (membership, local) = membership(transport);

        let nodes: Vec<ConsensusNodeInfo> = (0..8).map(node).collect();
        assert_eq!(membership.submit_join(&nodes).await.unwrap(), JOIN_FANOUT);

        let request = membership.request(RequestType::Join).unwrap();
        assert!(local.verify(&request));
        assert_eq!(request["nodeInfo"]["port"], json!(4000));
    }

    #[tokio::test]
    async fn test_join_status_reads_newest_cycle() {
        let peer = crypto(2);
        let archiver = ArchiverNodeInfo {
            public_key: peer.public_key().to_string(),
            ip: "127.0.0.1".into(),
            port: 4002,
            curve_pk: None,
        };
        let own = crypto(1).public_key().to_string();
        let not_yet = peer
            .sign(json!({"cycleInfo": [{"counter": 5, "joinedArchivers": []}]}))
            .unwrap();
        let listed = peer
            .sign(json!({"cycleInfo": [{"counter": 6, "refreshedArchivers": [
                {"publicKey": own, "ip": "127.0.0.1", "port": 4000}
            ]}]}))
            .unwrap();
        let mut replies = vec![listed, not_yet];
        let mut transport = MockPeerTransport::new();
        transport
            .expect_get_json()
            .times(2)
            .returning(move |_, _| Ok(replies.pop().unwrap()));
        let (membership, _) = membership(transport);

        let archivers = vec![archiver];
        assert!(!membership.check_join_status(&archivers).await.unwrap());
        assert!(membership.check_join_status(&archivers).await.unwrap());
        assert!(!membership.check_join_status(&[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_leave_is_signed_and_posted() {
        let mut transport = MockPeerTransport::new();
        transport
            .expect_post_json()
            .withf(|url, body, _| {
                url == "http://10.0.0.1:9003/leavingarchivers" && body["requestType"] == json!("LEAVE")
            })
            .return_once(|_, _, _| Ok(json!({ "success": true })));
        let (membership, _) = membership(transport);
        membership.send_leave(&node(3)).await.unwrap();
    }
}
