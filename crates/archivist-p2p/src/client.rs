use std::sync::Arc;
use std::time::Duration;

use archivist_core::{ArchiverNodeInfo, ConsensusNodeInfo, CycleRecord};
use archivist_crypto::{CryptoFacade, SIGN_FIELD};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::message_protocol::{CycleInfoResponse, GossipAck, NodeListResponse};
use crate::transport::{PeerTransport, TransportError};

/// Typed, signature-checked calls against peer archivers.
#[derive(Clone)]
pub struct ArchiverClient {
    transport: Arc<dyn PeerTransport>,
    crypto: Arc<dyn CryptoFacade>,
    timeout: Duration,
    bulk_timeout: Duration,
}

impl ArchiverClient {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        crypto: Arc<dyn CryptoFacade>,
        timeout: Duration,
        bulk_timeout: Duration,
    ) -> Self {
        ArchiverClient {
            transport,
            crypto,
            timeout,
            bulk_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn bulk_timeout(&self) -> Duration {
        self.bulk_timeout
    }

    /// Parses `value` after checking it was signed by `archiver`.
    fn signed<T: DeserializeOwned>(
        &self,
        archiver: &ArchiverNodeInfo,
        url: &str,
        value: Value,
    ) -> Result<T, TransportError> {
        let owner = value
            .get(SIGN_FIELD)
            .and_then(|s| s.get("owner"))
            .and_then(Value::as_str);
        if owner != Some(archiver.public_key.as_str()) || !self.crypto.verify(&value) {
            return Err(TransportError::BadSignature {
                url: url.to_string(),
                expected: archiver.public_key.clone(),
            });
        }
        serde_json::from_value(value).map_err(|e| TransportError::Malformed {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// GETs `path` from `archiver` with the bulk timeout and checks the
    /// reply's signature.
    pub async fn get_signed<T: DeserializeOwned>(
        &self,
        archiver: &ArchiverNodeInfo,
        path: &str,
    ) -> Result<T, TransportError> {
        let url = format!("{}{}", archiver.base_url(), path);
        let raw = self.transport.get_json(&url, self.bulk_timeout).await?;
        self.signed(archiver, &url, raw)
    }

    /// The newest cycle the archiver holds.
    pub async fn newest_cycle(&self, archiver: &ArchiverNodeInfo) -> Result<CycleRecord, TransportError> {
        let url = format!("{}/cycleinfo/1", archiver.base_url());
        let raw = self.transport.get_json(&url, self.timeout).await?;
        let response: CycleInfoResponse = self.signed(archiver, &url, raw)?;
        response
            .cycle_info
            .into_iter()
            .max_by_key(|c| c.counter)
            .ok_or(TransportError::Malformed {
                url,
                reason: "empty cycleInfo".to_string(),
            })
    }

    /// Records with counters in `start..=end`, in whatever order the peer sent them.
    pub async fn cycle_range(
        &self,
        archiver: &ArchiverNodeInfo,
        start: u64,
        end: u64,
    ) -> Result<Vec<CycleRecord>, TransportError> {
        let url = format!("{}/cycleinfo?start={}&end={}", archiver.base_url(), start, end);
        let raw = self.transport.get_json(&url, self.bulk_timeout).await?;
        let response: CycleInfoResponse = self.signed(archiver, &url, raw)?;
        Ok(response
            .cycle_info
            .into_iter()
            .filter(|c| c.counter >= start && c.counter <= end)
            .collect())
    }

    pub async fn node_list(&self, archiver: &ArchiverNodeInfo) -> Result<Vec<ConsensusNodeInfo>, TransportError> {
        let url = format!("{}/nodelist", archiver.base_url());
        let raw = self.transport.get_json(&url, self.timeout).await?;
        let response: NodeListResponse = self.signed(archiver, &url, raw)?;
        Ok(response.node_list)
    }

    /// Posts `body` to `route` on a consensus node and returns its reply.
    pub async fn post_to_node(
        &self,
        node: &ConsensusNodeInfo,
        route: &str,
        body: Value,
    ) -> Result<Value, TransportError> {
        let url = format!("http://{}/{}", node.ip_port(), route);
        self.transport.post_json(&url, body, self.timeout).await
    }

    /// Posts a signed gossip envelope to `route` on `archiver`.
    pub async fn post_gossip(
        &self,
        archiver: &ArchiverNodeInfo,
        route: &str,
        envelope: Value,
    ) -> Result<GossipAck, TransportError> {
        let url = format!("{}/{}", archiver.base_url(), route);
        let raw = self.transport.post_json(&url, envelope, self.timeout).await?;
        serde_json::from_value(raw).map_err(|e| TransportError::Malformed {
            url,
            reason: e.to_string(),
        })
    }
}
