use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::facade::CryptoError;

/// An ed25519 identity. Public keys travel as lowercase hex everywhere.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    public_hex: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Rebuild a key pair from a hex-encoded 32 byte seed.
    pub fn from_secret_hex(secret: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("secret key must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let public_hex = hex::encode(signing.verifying_key().to_bytes());
        KeyPair { signing, public_hex }
    }

    pub fn public_key(&self) -> &str {
        &self.public_hex
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("public_key", &self.public_hex).finish()
    }
}

pub(crate) fn parse_public_key(public_key: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(public_key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("public key {} is not 32 bytes", public_key)))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}
