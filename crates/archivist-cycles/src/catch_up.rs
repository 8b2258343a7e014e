//! Startup catch-up of state metadata from a peer archiver.
//!
//! After bootstrap the local chain holds cycle records but the archive
//! sections are empty. Each record may carry the network-wide hashes of
//! earlier cycles (`networkDataHash`, `networkReceiptHash`,
//! `networkSummaryHash`, each a list of `{cycle, hash}`). Sections downloaded
//! from a peer are stored only when their network hash matches those lists.

use std::collections::HashMap;

use archivist_core::{ArchiverNodeInfo, CycleRecord};
use archivist_p2p::{ArchiverClient, TransportError};
use archivist_state::{ArchivedCycle, ArchivedSection, Persistence, StorageError};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Archived cycles requested per `/full-archive` call.
pub const ARCHIVE_BATCH: u64 = 5;

const SECTIONS: [ArchivedSection; 3] = [
    ArchivedSection::Data,
    ArchivedSection::Receipt,
    ArchivedSection::Summary,
];

#[derive(Debug, Error)]
pub enum CatchUpError {
    #[error("no peer archiver to catch up from")]
    NoArchivers,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Body of `GET /full-archive?start&end`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullArchiveResponse {
    archived_cycles: Vec<ArchivedCycle>,
}

fn record_field(section: ArchivedSection) -> &'static str {
    match section {
        ArchivedSection::Data => "networkDataHash",
        ArchivedSection::Receipt => "networkReceiptHash",
        ArchivedSection::Summary => "networkSummaryHash",
    }
}

/// Network hash carried by a stored section, under its own field name or
/// the generic `networkHash`.
pub fn section_network_hash(section: ArchivedSection, value: &Value) -> Option<&str> {
    let own = match section {
        ArchivedSection::Data => "networkHash",
        ArchivedSection::Receipt => "networkReceiptHash",
        ArchivedSection::Summary => "networkSummaryHash",
    };
    value
        .get(own)
        .or_else(|| value.get("networkHash"))
        .and_then(Value::as_str)
}

#[derive(Deserialize)]
struct CycleHash {
    cycle: u64,
    hash: String,
}

/// Network hashes announced by cycle records, by section and counter.
#[derive(Debug, Default)]
pub struct NetworkHashes {
    by_section: HashMap<(ArchivedSection, u64), String>,
}

impl NetworkHashes {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CycleRecord>) -> Self {
        let mut by_section = HashMap::new();
        for record in records {
            for section in SECTIONS {
                let Some(list) = record.extra.get(record_field(section)) else {
                    continue;
                };
                match serde_json::from_value::<Vec<CycleHash>>(list.clone()) {
                    Ok(hashes) => {
                        for CycleHash { cycle, hash } in hashes {
                            by_section.insert((section, cycle), hash);
                        }
                    }
                    Err(e) => warn!(
                        "cycle {}: malformed {}: {}",
                        record.counter,
                        record_field(section),
                        e
                    ),
                }
            }
        }
        NetworkHashes { by_section }
    }

    pub fn get(&self, section: ArchivedSection, counter: u64) -> Option<&str> {
        self.by_section.get(&(section, counter)).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_section.is_empty()
    }
}

pub struct MetadataCatchUp {
    client: ArchiverClient,
}

impl MetadataCatchUp {
    pub fn new(client: ArchiverClient) -> Self {
        MetadataCatchUp { client }
    }

    /// Archived cycles `from..=up_to` from `archiver`, in batches, stopping
    /// at the first short or failed batch.
    pub async fn download(&self, archiver: &ArchiverNodeInfo, from: u64, up_to: u64) -> Vec<ArchivedCycle> {
        let mut collected = Vec::new();
        let mut start = from;
        while start <= up_to {
            let end = (start + ARCHIVE_BATCH - 1).min(up_to);
            let path = format!("/full-archive?start={}&end={}", start, end);
            let batch: Result<FullArchiveResponse, TransportError> = self.client.get_signed(archiver, &path).await;
            match batch {
                Ok(response) => {
                    let short = (response.archived_cycles.len() as u64) < end - start + 1;
                    collected.extend(response.archived_cycles);
                    if short {
                        break;
                    }
                }
                Err(e) => {
                    warn!("cannot download archive {}..={} from {}: {}", start, end, archiver.public_key, e);
                    break;
                }
            }
            start = end + 1;
        }
        debug!("downloaded {} archived cycles from {}", collected.len(), archiver.public_key);
        collected
    }

    /// Fills local archive sections from a random archiver in `archivers`.
    /// Returns the newest counter whose three sections all verified.
    pub async fn run(
        &self,
        archivers: &[ArchiverNodeInfo],
        store: &dyn Persistence,
    ) -> Result<Option<u64>, CatchUpError> {
        let archiver = archivers
            .choose(&mut rand::thread_rng())
            .ok_or(CatchUpError::NoArchivers)?;
        let Some(latest) = store.query_latest_cycle_records(1).await?.pop() else {
            return Ok(None);
        };
        let records = store.query_cycle_records_between(0, latest.counter).await?;
        let expected = NetworkHashes::from_records(&records);
        if expected.is_empty() {
            debug!("local records announce no network hashes, nothing to catch up");
            return Ok(None);
        }

        let mut synced_up_to = None;
        for archived in self.download(archiver, 0, latest.counter).await {
            let counter = archived.cycle_record.counter;
            let marker = archived.cycle_marker.as_str();
            if store.query_archived_cycle(marker).await?.is_none() {
                warn!("archived cycle {} ({}) is not on our chain", counter, marker);
                continue;
            }
            let mut verified = 0;
            for section in SECTIONS {
                let value = archived.section(section);
                let hash = section_network_hash(section, value);
                if hash.is_none() || hash != expected.get(section, counter) {
                    debug!("cycle {}: {:?} section does not match the network hash", counter, section);
                    continue;
                }
                store.update_archived_cycle(marker, section, value.clone()).await?;
                verified += 1;
            }
            if verified == SECTIONS.len() {
                synced_up_to = synced_up_to.max(Some(counter));
            }
        }
        if let Some(counter) = synced_up_to {
            info!("state metadata caught up to cycle {} from {}", counter, archiver.public_key);
        }
        Ok(synced_up_to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{crypto, linked_chain};
    use archivist_crypto::{CryptoFacade, Ed25519Crypto};
    use archivist_p2p::PeerTransport;
    use archivist_state::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// One archiver serving `/full-archive` from a fixed list.
    struct ArchivePeer {
        info: ArchiverNodeInfo,
        crypto: Ed25519Crypto,
        archive: Vec<ArchivedCycle>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerTransport for ArchivePeer {
        async fn get_json(&self, url: &str, _timeout: Duration) -> Result<Value, TransportError> {
            self.requests.lock().unwrap().push(url.to_string());
            let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
            let param = |name: &str| {
                query
                    .split('&')
                    .filter_map(|kv| kv.split_once('='))
                    .find(|(k, _)| *k == name)
                    .and_then(|(_, v)| v.parse::<u64>().ok())
                    .unwrap_or(0)
            };
            let (start, end) = (param("start"), param("end"));
            let archived: Vec<&ArchivedCycle> = self
                .archive
                .iter()
                .filter(|a| a.cycle_record.counter >= start && a.cycle_record.counter <= end)
                .collect();
            Ok(self.crypto.sign(json!({ "archivedCycles": archived })).unwrap())
        }

        async fn post_json(&self, url: &str, _body: Value, _timeout: Duration) -> Result<Value, TransportError> {
            Err(TransportError::Timeout(url.to_string()))
        }
    }

    fn sections(counter: u64, tag: &str) -> (Value, Value, Value) {
        (
            json!({"counter": counter, "partitionHashes": {}, "networkHash": format!("d{}{}", counter, tag)}),
            json!({"counter": counter, "receiptMapHashes": {}, "networkReceiptHash": format!("r{}{}", counter, tag)}),
            json!({"counter": counter, "summaryHashes": {}, "networkSummaryHash": format!("s{}{}", counter, tag)}),
        )
    }

    #[tokio::test]
    async fn test_catch_up_stores_only_verified_sections() {
        let signer = crypto(1);
        // Record n announces the hashes of cycle n - 1.
        let chain = linked_chain(&signer, 8, |r| {
            if r.counter == 0 {
                return;
            }
            let prev = r.counter - 1;
            r.extra.insert("networkDataHash".into(), json!([{"cycle": prev, "hash": format!("d{}", prev)}]));
            r.extra.insert("networkReceiptHash".into(), json!([{"cycle": prev, "hash": format!("r{}", prev)}]));
            r.extra.insert("networkSummaryHash".into(), json!([{"cycle": prev, "hash": format!("s{}", prev)}]));
        });
        let store = MemoryStore::new();
        for record in &chain {
            store.insert_cycle(record).await.unwrap();
        }

        let archive: Vec<ArchivedCycle> = chain
            .iter()
            .map(|record| {
                let mut archived = ArchivedCycle::new(record.clone());
                // Cycle 4's receipt section disagrees with the network.
                let tag = if record.counter == 4 { "x" } else { "" };
                let (data, _, summary) = sections(record.counter, "");
                let (_, receipt, _) = sections(record.counter, tag);
                archived.data = data;
                archived.receipt = receipt;
                archived.summary = summary;
                archived
            })
            .collect();
        let peer_crypto = crypto(2);
        let info = ArchiverNodeInfo {
            public_key: peer_crypto.public_key().to_string(),
            ip: "127.0.0.1".into(),
            port: 4002,
            curve_pk: None,
        };
        let peer = Arc::new(ArchivePeer {
            info: info.clone(),
            crypto: peer_crypto,
            archive,
            requests: Mutex::new(Vec::new()),
        });
        let client = ArchiverClient::new(
            peer.clone(),
            Arc::new(crypto(3)),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        let synced = MetadataCatchUp::new(client).run(&[info], &store).await.unwrap();
        // Cycle 7 has no announced hashes yet; cycle 6 is the newest verified.
        assert_eq!(synced, Some(6));

        let requests = peer.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].ends_with("/full-archive?start=0&end=4"));
        assert!(requests[1].ends_with("/full-archive?start=5&end=7"));

        let three = store.query_archived_cycle(&chain[3].marker).await.unwrap().unwrap();
        assert_eq!(three.receipt["networkReceiptHash"], json!("r3"));
        let four = store.query_archived_cycle(&chain[4].marker).await.unwrap().unwrap();
        assert_eq!(four.data["networkHash"], json!("d4"));
        assert_eq!(four.receipt, json!({}));
        let seven = store.query_archived_cycle(&chain[7].marker).await.unwrap().unwrap();
        assert_eq!(seven.data, json!({}));
    }

    #[tokio::test]
    async fn test_no_archivers_is_an_error() {
        let client = ArchiverClient::new(
            Arc::new(ArchivePeer {
                info: ArchiverNodeInfo {
                    public_key: "x".into(),
                    ip: "127.0.0.1".into(),
                    port: 1,
                    curve_pk: None,
                },
                crypto: crypto(2),
                archive: Vec::new(),
                requests: Mutex::new(Vec::new()),
            }),
            Arc::new(crypto(3)),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let store = MemoryStore::new();
        assert!(matches!(
            MetadataCatchUp::new(client).run(&[], &store).await,
            Err(CatchUpError::NoArchivers)
        ));
    }
}
