//! Identity derivations, signing keys and device certificates
//!
//! All hash derivations use BLAKE3 with domain separation prefixes.

use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for DeviceId derivation
pub const DOMAIN_DEVICE_ID: &[u8] = b"device-id";
/// Domain prefix for PeerIdentity derivation
pub const DOMAIN_PEER_ID: &[u8] = b"peer-id";
/// Domain prefix for device certificate signatures
pub const DOMAIN_DEVICE_CERT: &[u8] = b"devlink-device-cert";

// =============================================================================
// IDENTITIES
// =============================================================================

/// `DeviceId = BLAKE3("device-id" || device_public_key)`
pub fn derive_device_id(device_public_key: &[u8; 32]) -> DeviceId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_DEVICE_ID);
    hasher.update(device_public_key);
    DeviceId(*hasher.finalize().as_bytes())
}

/// `PeerIdentity = BLAKE3("peer-id" || account_public_key)`
pub fn derive_peer_identity(account_public_key: &[u8; 32]) -> PeerIdentity {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_PEER_ID);
    hasher.update(account_public_key);
    PeerIdentity(*hasher.finalize().as_bytes())
}

/// `SignalingKey = BLAKE3("peer:" || hex(device_id))`
pub fn derive_signaling_key(device: &DeviceId) -> SignalingKey {
    let mut hasher = Hasher::new();
    hasher.update(PeerConnectionRequest::KEY_PREFIX.as_bytes());
    hasher.update(device.to_hex().as_bytes());
    SignalingKey(*hasher.finalize().as_bytes())
}

// =============================================================================
// KEYS
// =============================================================================

/// Ed25519 keypair for accounts and devices
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic recovery and testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes this keypair can be recreated from
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature
    pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        let signature: [u8; 64] = signature.try_into().map_err(|_| Error::InvalidSignature)?;
        let sig = Signature::from_bytes(&signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| Error::InvalidSignature)
    }
}

// =============================================================================
// DEVICE CERTIFICATES
// =============================================================================

/// A device key signed by the account that owns it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceCertificate {
    pub device_public_key: [u8; 32],
    pub issuer_public_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl DeviceCertificate {
    /// Issue a certificate for `device_public_key` signed by `account`
    pub fn issue(account: &KeyPair, device_public_key: [u8; 32]) -> Self {
        let issuer_public_key = account.public_key();
        let signature = account
            .sign(&Self::sign_bytes(&device_public_key, &issuer_public_key))
            .to_vec();
        Self {
            device_public_key,
            issuer_public_key,
            signature,
        }
    }

    /// `sign_bytes = "devlink-device-cert" || device_public_key || issuer_public_key`
    fn sign_bytes(device_public_key: &[u8; 32], issuer_public_key: &[u8; 32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DOMAIN_DEVICE_CERT.len() + 64);
        bytes.extend_from_slice(DOMAIN_DEVICE_CERT);
        bytes.extend_from_slice(device_public_key);
        bytes.extend_from_slice(issuer_public_key);
        bytes
    }

    pub fn device_id(&self) -> DeviceId {
        derive_device_id(&self.device_public_key)
    }

    pub fn issuer_id(&self) -> PeerIdentity {
        derive_peer_identity(&self.issuer_public_key)
    }

    /// Check the chain: a device certificate can't be self-signed and must
    /// carry a valid issuer signature.
    pub fn verify(&self) -> Result<()> {
        if self.device_public_key == self.issuer_public_key {
            return Err(Error::SelfIssued(self.device_id().to_string()));
        }
        KeyPair::verify(
            &self.issuer_public_key,
            &Self::sign_bytes(&self.device_public_key, &self.issuer_public_key),
            &self.signature,
        )
    }
}
