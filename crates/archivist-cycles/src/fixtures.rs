//! Builders shared by the unit tests in this crate.

use archivist_core::{CycleRecord, JoinedConsensor};
use archivist_crypto::{CryptoFacade, Ed25519Crypto, KeyPair};

pub const HASH_KEY: &[u8] = b"cycles-tests";

pub fn crypto(seed: u8) -> Ed25519Crypto {
    Ed25519Crypto::new(KeyPair::from_seed([seed; 32]), HASH_KEY.to_vec())
}

pub fn consensor(id: &str, joined_at: u64) -> JoinedConsensor {
    JoinedConsensor {
        public_key: format!("pk-{}", id),
        external_ip: "10.1.0.1".into(),
        external_port: 9000 + joined_at as u16,
        internal_ip: "10.1.0.1".into(),
        internal_port: 10000 + joined_at as u16,
        address: String::new(),
        join_request_timestamp: joined_at,
        active_timestamp: 0,
        id: id.into(),
        cycle_joined: format!("m{}", joined_at),
        counter_refreshed: 0,
    }
}

/// Builds a linked chain `0..len`, letting `edit` fill in each record
/// before it is sealed.
pub fn linked_chain(
    crypto: &dyn CryptoFacade,
    len: u64,
    mut edit: impl FnMut(&mut CycleRecord),
) -> Vec<CycleRecord> {
    let mut out: Vec<CycleRecord> = Vec::new();
    for counter in 0..len {
        let mut record = CycleRecord::empty(counter);
        record.start = 1_000 + counter * 30;
        record.duration = 30;
        if let Some(prev) = out.last() {
            record.previous = prev.marker.clone();
        }
        edit(&mut record);
        if let Err(e) = record.seal(crypto) {
            panic!("cannot seal fixture record {}: {}", counter, e);
        }
        out.push(record);
    }
    out
}
