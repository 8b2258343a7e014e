use std::collections::HashMap;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signature, Signer, Verifier};
use hmac::{Hmac, Mac};
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::Sha256;
use thiserror::Error;

use crate::canonical::stringify;
use crate::keys::{parse_public_key, KeyPair};
use crate::{PUBLIC_KEY_FIELD, SIGN_FIELD, TAG_FIELD};

type Blake2b256 = Blake2b<U32>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("only JSON objects can be signed or tagged")]
    NotAnObject,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Sign/verify/hash/HMAC primitives the archiver consumes.
///
/// Objects are hashed over their canonical JSON form (see [`stringify`]), so two
/// peers that agree on a value agree on its hash regardless of field order.
pub trait CryptoFacade: Send + Sync {
    /// Hex public key this archiver signs and tags with.
    fn public_key(&self) -> &str;

    /// Hex digest of the canonical JSON form of `value`.
    fn hash_obj(&self, value: &Value) -> String;

    /// Returns `value` with a `sign: {owner, sig}` field attached.
    fn sign(&self, value: Value) -> Result<Value, CryptoError>;

    /// Checks the `sign` field of a signed object against its `owner`.
    fn verify(&self, value: &Value) -> bool;

    /// Returns `value` with `publicKey` and an HMAC `tag` keyed for `recipient`.
    fn tag(&self, value: Value, recipient: &str) -> Result<Value, CryptoError>;

    /// Checks the HMAC `tag` of a message tagged for us by its `publicKey`.
    fn authenticate(&self, value: &Value) -> bool;
}

pub fn hash_serializable<T: Serialize>(
    crypto: &dyn CryptoFacade,
    obj: &T,
) -> Result<String, CryptoError> {
    Ok(crypto.hash_obj(&serde_json::to_value(obj)?))
}

pub fn sign_serializable<T: Serialize>(
    crypto: &dyn CryptoFacade,
    obj: &T,
) -> Result<Value, CryptoError> {
    crypto.sign(serde_json::to_value(obj)?)
}

/// ed25519 signatures, keyed Blake2b-256 hashing and HMAC-SHA256 tags.
///
/// The HMAC key for a peer is the SHA-256 of the x25519 shared secret obtained
/// by mapping both ed25519 keys onto the Montgomery curve, so either side can
/// derive it from its own secret and the other's public key.
pub struct Ed25519Crypto {
    keys: KeyPair,
    hash_key: Vec<u8>,
    shared_keys: Mutex<HashMap<String, [u8; 32]>>,
}

impl Ed25519Crypto {
    pub fn new(keys: KeyPair, hash_key: Vec<u8>) -> Self {
        Ed25519Crypto {
            keys,
            hash_key,
            shared_keys: Mutex::new(HashMap::new()),
        }
    }

    fn digest(&self, value: &Value) -> [u8; 32] {
        let mut hasher = Blake2b256::new();
        hasher.update(&self.hash_key);
        hasher.update(stringify(value).as_bytes());
        hasher.finalize().into()
    }

    fn shared_key(&self, their_public_key: &str) -> Result<[u8; 32], CryptoError> {
        if let Some(key) = self.shared_keys.lock().get(their_public_key) {
            return Ok(*key);
        }
        let theirs = parse_public_key(their_public_key)?;
        let secret = theirs
            .to_montgomery()
            .mul_clamped(self.keys.signing_key().to_scalar_bytes());
        let key: [u8; 32] = Sha256::digest(secret.to_bytes()).into();
        self.shared_keys
            .lock()
            .insert(their_public_key.to_string(), key);
        Ok(key)
    }

    fn mac_for(&self, body: &Value, peer: &str) -> Result<HmacSha256, CryptoError> {
        let key = self.shared_key(peer)?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        mac.update(stringify(body).as_bytes());
        Ok(mac)
    }
}

fn without_field(value: &Value, field: &str) -> Option<(Map<String, Value>, Option<Value>)> {
    let mut map = value.as_object()?.clone();
    let removed = map.remove(field);
    Some((map, removed))
}

impl CryptoFacade for Ed25519Crypto {
    fn public_key(&self) -> &str {
        self.keys.public_key()
    }

    fn hash_obj(&self, value: &Value) -> String {
        hex::encode(self.digest(value))
    }

    fn sign(&self, value: Value) -> Result<Value, CryptoError> {
        let (body, _) = without_field(&value, SIGN_FIELD).ok_or(CryptoError::NotAnObject)?;
        let body = Value::Object(body);
        let signature = self.keys.signing_key().sign(&self.digest(&body));
        let mut signed = match body {
            Value::Object(map) => map,
            _ => return Err(CryptoError::NotAnObject),
        };
        signed.insert(
            SIGN_FIELD.to_string(),
            json!({
                "owner": self.keys.public_key(),
                "sig": hex::encode(signature.to_bytes()),
            }),
        );
        Ok(Value::Object(signed))
    }

    fn verify(&self, value: &Value) -> bool {
        let Some((body, Some(sign))) = without_field(value, SIGN_FIELD) else {
            return false;
        };
        let (Some(owner), Some(sig)) = (
            sign.get("owner").and_then(Value::as_str),
            sign.get("sig").and_then(Value::as_str),
        ) else {
            return false;
        };
        let Ok(key) = parse_public_key(owner) else {
            debug!("verify: unparseable owner key {}", owner);
            return false;
        };
        let Ok(sig_bytes) = hex::decode(sig) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        key.verify(&self.digest(&Value::Object(body)), &signature).is_ok()
    }

    fn tag(&self, value: Value, recipient: &str) -> Result<Value, CryptoError> {
        let (mut body, _) = without_field(&value, TAG_FIELD).ok_or(CryptoError::NotAnObject)?;
        body.insert(
            PUBLIC_KEY_FIELD.to_string(),
            Value::String(self.keys.public_key().to_string()),
        );
        let body = Value::Object(body);
        let tag = self.mac_for(&body, recipient)?.finalize().into_bytes();
        let mut tagged = match body {
            Value::Object(map) => map,
            _ => return Err(CryptoError::NotAnObject),
        };
        tagged.insert(TAG_FIELD.to_string(), Value::String(hex::encode(tag)));
        Ok(Value::Object(tagged))
    }

    fn authenticate(&self, value: &Value) -> bool {
        let Some((body, Some(tag))) = without_field(value, TAG_FIELD) else {
            return false;
        };
        let Some(sender) = body.get(PUBLIC_KEY_FIELD).and_then(Value::as_str) else {
            return false;
        };
        let Some(tag_bytes) = tag.as_str().and_then(|t| hex::decode(t).ok()) else {
            return false;
        };
        let sender = sender.to_string();
        match self.mac_for(&Value::Object(body), &sender) {
            Ok(mac) => mac.verify_slice(&tag_bytes).is_ok(),
            Err(e) => {
                debug!("authenticate: cannot derive shared key for {}: {}", sender, e);
                false
            }
        }
    }
}
