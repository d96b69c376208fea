//! Per-user signing keys
//!
//! Ed25519 key pairs for protocols that sign on behalf of bridged users.
//! Generation is CPU-bound, so async callers go through [`generate_off_thread`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::db::schemas::KeyMaterial;
use crate::types::{BridgeError, Result};

/// Generate a new Ed25519 keypair
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Generate key material for storage on a user
pub fn generate_key_material() -> KeyMaterial {
    let (signing_key, verifying_key) = generate_keypair();
    KeyMaterial {
        public_key: BASE64.encode(verifying_key.to_bytes()),
        private_key: BASE64.encode(signing_key.to_bytes()),
    }
}

/// Generate key material on the blocking pool
pub async fn generate_off_thread() -> Result<KeyMaterial> {
    Ok(tokio::task::spawn_blocking(generate_key_material).await?)
}

impl KeyMaterial {
    pub fn signing_key(&self) -> Result<SigningKey> {
        let bytes: [u8; 32] = BASE64
            .decode(&self.private_key)
            .map_err(|e| BridgeError::Internal(format!("Invalid private key encoding: {}", e)))?
            .try_into()
            .map_err(|_| BridgeError::Internal("Private key must be 32 bytes".into()))?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let bytes: [u8; 32] = BASE64
            .decode(&self.public_key)
            .map_err(|e| BridgeError::Internal(format!("Invalid public key encoding: {}", e)))?
            .try_into()
            .map_err(|_| BridgeError::Internal("Public key must be 32 bytes".into()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| BridgeError::Internal(format!("Invalid public key: {}", e)))
    }

    /// Sign a payload with this user's key
    pub fn sign(&self, payload: &[u8]) -> Result<Signature> {
        Ok(self.signing_key()?.sign(payload))
    }

    pub fn verify(&self, payload: &[u8], signature: &Signature) -> bool {
        self.verifying_key()
            .map(|key| key.verify(payload, signature).is_ok())
            .unwrap_or(false)
    }
}
