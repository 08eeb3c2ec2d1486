//! Cryptographic operations for the ledger
//!
//! This module provides:
//! - SHA-256 content and node hashing
//! - The signing capability injected into the sealing service
//! - Ed25519 key pairs and a key ring resolving verifiers by key id

use crate::types::{Digest, Signature};
use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest::from_bytes(hasher.finalize().into())
}

/// Hash a pair of digests: H(left || right)
pub fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Digest::from_bytes(hasher.finalize().into())
}

/// Verification half of the signing capability
pub trait SealVerifier: Send + Sync {
    /// Key identifier recorded on seals
    fn key_id(&self) -> &str;

    /// Check a signature over a digest
    fn verify(&self, digest: &Digest, signature: &Signature) -> bool;
}

/// Signing capability injected into the sealing service
///
/// Key storage and rotation live behind this trait; the ledger only
/// ever asks for a signature over a 32-byte state hash.
pub trait SealSigner: SealVerifier {
    /// Sign a digest
    fn sign(&self, digest: &Digest) -> Result<Signature>;

    /// Public key bytes
    fn public_key(&self) -> [u8; 32];
}

/// Ed25519 key pair for signing
pub struct KeyPair {
    key_id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self::from_seed(key_id, &rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(key_id: impl Into<String>, seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            key_id: key_id.into(),
            signing_key,
            verifying_key,
        }
    }

    /// Load from a file holding a hex-encoded 32-byte seed
    pub fn from_seed_file(key_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let bytes = hex::decode(content.trim())
            .map_err(|e| Error::Config(format!("Signing key file is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            Error::Config(format!("Signing key seed must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_seed(key_id, &seed))
    }

    /// Public half, for distribution to external verifiers
    pub fn public(&self) -> PublicKey {
        PublicKey {
            key_id: self.key_id.clone(),
            verifying_key: self.verifying_key,
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .field("public_key", &hex::encode(self.verifying_key.to_bytes()))
            .finish()
    }
}

impl SealVerifier for KeyPair {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn verify(&self, digest: &Digest, signature: &Signature) -> bool {
        let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
        self.verifying_key
            .verify(digest.as_bytes(), &dalek_sig)
            .is_ok()
    }
}

impl SealSigner for KeyPair {
    fn sign(&self, digest: &Digest) -> Result<Signature> {
        let signature = self.signing_key.sign(digest.as_bytes());
        Ok(Signature::from_bytes(signature.to_bytes()))
    }

    fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }
}

/// Ed25519 public key that can only verify
#[derive(Debug, Clone)]
pub struct PublicKey {
    key_id: String,
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Parse from raw bytes
    pub fn from_bytes(key_id: impl Into<String>, bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| Error::SignatureError(format!("Invalid public key: {}", e)))?;
        Ok(Self {
            key_id: key_id.into(),
            verifying_key,
        })
    }

    /// Parse from 64 hex characters
    pub fn from_hex(key_id: impl Into<String>, text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| Error::Config(format!("Verifier key is not hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            Error::Config(format!("Verifier key must be 32 bytes, got {}", bytes.len()))
        })?;
        Self::from_bytes(key_id, &bytes)
    }

    /// Raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }
}

impl SealVerifier for PublicKey {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn verify(&self, digest: &Digest, signature: &Signature) -> bool {
        let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
        self.verifying_key
            .verify(digest.as_bytes(), &dalek_sig)
            .is_ok()
    }
}

/// Signing keys resolvable by key id
///
/// At most one signer is active; verifiers for retired keys stay
/// registered so older seals keep verifying.
#[derive(Clone, Default)]
pub struct KeyRing {
    active: Option<Arc<dyn SealSigner>>,
    verifiers: HashMap<String, Arc<dyn SealVerifier>>,
}

impl KeyRing {
    /// Empty key ring (sealing unavailable)
    pub fn new() -> Self {
        Self::default()
    }

    /// Key ring with one active signer
    pub fn with_signer<S: SealSigner + 'static>(signer: S) -> Self {
        let mut ring = Self::new();
        ring.install_signer(signer);
        ring
    }

    /// Make `signer` the active key, keeping previous verifiers
    pub fn install_signer<S: SealSigner + 'static>(&mut self, signer: S) {
        let signer = Arc::new(signer);
        self.verifiers
            .insert(signer.key_id().to_string(), signer.clone());
        self.active = Some(signer);
    }

    /// Register a verify-only key
    pub fn add_verifier<V: SealVerifier + 'static>(&mut self, verifier: V) {
        self.verifiers
            .insert(verifier.key_id().to_string(), Arc::new(verifier));
    }

    /// Active signer, if any
    pub fn active_signer(&self) -> Option<&Arc<dyn SealSigner>> {
        self.active.as_ref()
    }

    /// Verifier for a key id
    pub fn verifier(&self, key_id: &str) -> Option<&Arc<dyn SealVerifier>> {
        self.verifiers.get(key_id)
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("active", &self.active.as_ref().map(|s| s.key_id().to_string()))
            .field("verifiers", &self.verifiers.keys().collect::<Vec<_>>())
            .finish()
    }
}
