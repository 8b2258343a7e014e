//! Hashing, signing and HMAC tagging for archivist.
//!
//! The rest of the workspace only ever talks to [`CryptoFacade`]; the
//! ed25519-backed [`Ed25519Crypto`] is the implementation the binary wires in.

pub mod canonical;
pub mod facade;
pub mod keys;

pub use canonical::stringify;
pub use facade::{hash_serializable, sign_serializable, CryptoError, CryptoFacade, Ed25519Crypto};
pub use keys::KeyPair;

/// Field carrying the `{owner, sig}` signature on a signed envelope.
pub const SIGN_FIELD: &str = "sign";
/// Field carrying the hex HMAC tag on a tagged message.
pub const TAG_FIELD: &str = "tag";
/// Field carrying the sender's public key on a tagged message.
pub const PUBLIC_KEY_FIELD: &str = "publicKey";
