//! Node identities.
//!
//! Every node owns an Ed25519 keypair. The public key rides in announce
//! payloads and is what destination hashes bind to; the private half signs
//! announces and signed replies. Shared secrets for payload encryption come
//! from an X25519 exchange over the same keys.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::traits::{MeshError, MeshResult, RandomSource};

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// A remote node's identity: its Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub_key: [u8; Identity::PUB_KEY_LEN],
}

impl Identity {
    pub const PUB_KEY_LEN: usize = 32;

    pub fn from_bytes(pub_key: [u8; Self::PUB_KEY_LEN]) -> Self {
        Self { pub_key }
    }

    pub fn from_hex(s: &str) -> MeshResult<Self> {
        let bytes = hex::decode(s)?;
        let pub_key = bytes.try_into().map_err(|_| MeshError::InvalidKey)?;
        Ok(Self { pub_key })
    }

    pub fn as_bytes(&self) -> &[u8; Self::PUB_KEY_LEN] {
        &self.pub_key
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.pub_key)
    }

    /// Verify `signature` over `message`.
    ///
    /// Anything that does not parse as a valid key or signature verifies
    /// false; wire data never panics here.
    pub fn verify(&self, signature: &[u8], message: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.pub_key) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}

/// This node's identity: the full Ed25519 keypair.
#[derive(Clone)]
pub struct LocalIdentity {
    signing: SigningKey,
}

impl LocalIdentity {
    pub const SEED_LEN: usize = 32;
    pub const PRV_KEY_LEN: usize = 64;

    /// Generate a fresh identity from `rng`.
    pub fn generate(rng: &mut dyn RandomSource) -> Self {
        let mut seed = [0u8; Self::SEED_LEN];
        rng.fill(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; Self::SEED_LEN]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Restore an identity from the 64-byte keypair encoding.
    pub fn from_keypair_bytes(bytes: &[u8; Self::PRV_KEY_LEN]) -> MeshResult<Self> {
        let signing = SigningKey::from_keypair_bytes(bytes).map_err(|_| MeshError::InvalidKey)?;
        Ok(Self { signing })
    }

    pub fn to_keypair_bytes(&self) -> [u8; Self::PRV_KEY_LEN] {
        self.signing.to_keypair_bytes()
    }

    pub fn from_hex(s: &str) -> MeshResult<Self> {
        let bytes = hex::decode(s)?;
        let keypair: [u8; Self::PRV_KEY_LEN] =
            bytes.try_into().map_err(|_| MeshError::InvalidKey)?;
        Self::from_keypair_bytes(&keypair)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_keypair_bytes())
    }

    /// The public half.
    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    /// X25519 shared secret with `peer`, derived from the Ed25519 keys.
    ///
    /// Both sides compute the same 32 bytes. Feeds the encrypt-then-MAC
    /// envelope in [`crate::crypto`].
    pub fn shared_secret(&self, peer: &Identity) -> MeshResult<[u8; 32]> {
        let peer_key =
            VerifyingKey::from_bytes(peer.as_bytes()).map_err(|_| MeshError::InvalidKey)?;
        let shared = x25519_dalek::x25519(
            self.signing.to_scalar_bytes(),
            peer_key.to_montgomery().to_bytes(),
        );
        Ok(shared)
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print private key material.
        write!(f, "LocalIdentity(pub {})", self.identity().to_hex())
    }
}
