//! Archiver configuration: an optional file layered under `ARCHIVER_*`
//! environment variables, every field defaulted.

use std::path::Path;
use std::time::Duration;

use archivist_core::ArchiverNodeInfo;
use archivist_crypto::{CryptoError, KeyPair};
use archivist_cycles::SyncConfig;
use archivist_data::SenderConfig;
use archivist_p2p::GossipConfig;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("secret_key is not a valid ed25519 secret: {0}")]
    SecretKey(#[from] CryptoError),

    #[error("hash_key is not valid hex: {0}")]
    HashKey(#[from] hex::FromHexError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    pub ip: String,
    pub port: u16,
    /// Hex ed25519 seed. A fresh identity is generated when empty.
    pub secret_key: String,
    /// Hex key every node on the network hashes with.
    pub hash_key: String,
    pub bootstrap_archivers: Vec<ArchiverNodeInfo>,

    pub contact_timeout_padding_ms: u64,
    pub default_cycle_duration_ms: u64,
    pub replace_timeout_ms: u64,
    pub subscribe_to_more_consensors: bool,
    pub extra_consensors_to_subscribe: usize,
    pub sender_retry_ms: u64,

    /// Ask the network to admit this archiver once the reactor starts.
    pub join_network: bool,
    /// Join attempts before giving up; 0 keeps trying.
    pub max_join_attempts: u32,
    /// Fill archive sections from a peer archiver during bootstrap.
    pub metadata_catch_up: bool,

    pub gossip_quorum_ratio: f64,
    pub gossip_debounce_ms: u64,

    pub reputation_max_lag: u64,
    pub reputation_timeout_ms: u64,

    pub robust_query_redundancy: usize,
    pub query_timeout_ms: u64,
    pub bulk_query_timeout_ms: u64,

    pub max_sync_rounds: usize,
    pub history_check_depth: usize,
    pub removed_nodes_history: usize,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        ArchiverConfig {
            ip: "127.0.0.1".into(),
            port: 4000,
            secret_key: String::new(),
            hash_key: hex::encode(b"archivist-hash-key"),
            bootstrap_archivers: Vec::new(),
            contact_timeout_padding_ms: 1000,
            default_cycle_duration_ms: 30_000,
            replace_timeout_ms: 3_600_000,
            subscribe_to_more_consensors: false,
            extra_consensors_to_subscribe: 1,
            sender_retry_ms: 10_000,
            join_network: true,
            max_join_attempts: 0,
            metadata_catch_up: true,
            gossip_quorum_ratio: 0.3,
            gossip_debounce_ms: 500,
            reputation_max_lag: 10,
            reputation_timeout_ms: 5000,
            robust_query_redundancy: 3,
            query_timeout_ms: 5000,
            bulk_query_timeout_ms: 20_000,
            max_sync_rounds: 64,
            history_check_depth: 10,
            removed_nodes_history: 10,
        }
    }
}

impl ArchiverConfig {
    /// Reads `path` (format by extension) if given, then `ARCHIVER_*`
    /// variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(Environment::with_prefix("ARCHIVER").try_parsing(true))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn key_pair(&self) -> Result<KeyPair, ConfigError> {
        if self.secret_key.is_empty() {
            return Ok(KeyPair::generate());
        }
        Ok(KeyPair::from_secret_hex(&self.secret_key)?)
    }

    pub fn hash_key_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(hex::decode(&self.hash_key)?)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn bulk_query_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_query_timeout_ms)
    }

    pub fn reputation_timeout(&self) -> Duration {
        Duration::from_millis(self.reputation_timeout_ms)
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            contact_padding: Duration::from_millis(self.contact_timeout_padding_ms),
            default_cycle_duration: Duration::from_millis(self.default_cycle_duration_ms),
            replace_timeout: Duration::from_millis(self.replace_timeout_ms),
            subscribe_to_more: self.subscribe_to_more_consensors,
            extra_senders: self.extra_consensors_to_subscribe,
            retry_interval: Duration::from_millis(self.sender_retry_ms),
        }
    }

    pub fn default_cycle_duration(&self) -> Duration {
        Duration::from_millis(self.default_cycle_duration_ms)
    }

    /// How peers and consensus nodes reach this archiver.
    pub fn node_info(&self, public_key: &str) -> ArchiverNodeInfo {
        ArchiverNodeInfo {
            public_key: public_key.to_string(),
            ip: self.ip.clone(),
            port: self.port,
            curve_pk: None,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            redundancy: self.robust_query_redundancy,
            max_rounds: self.max_sync_rounds,
            history_check_depth: self.history_check_depth,
        }
    }

    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            quorum_ratio: self.gossip_quorum_ratio,
            debounce: Duration::from_millis(self.gossip_debounce_ms),
        }
    }
}
