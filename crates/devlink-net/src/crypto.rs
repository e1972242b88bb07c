//! Session cryptography for the loopback secure transport
//!
//! Provides ephemeral ECDH, session key derivation and the record
//! sealing/opening halves used by [`crate::mock::LoopbackHandshaker`].

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};

/// Session crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

const LOW_TO_HIGH: &[u8] = b"/low-to-high";
const HIGH_TO_LOW: &[u8] = b"/high-to-low";

/// Directional keys of one secured session
pub struct SessionKeys {
    encrypt_key: [u8; 32],
    decrypt_key: [u8; 32],
}

fn expand_key(hkdf: &Hkdf<Sha256>, context: &[u8], direction: &[u8]) -> Result<[u8; 32], CryptoError> {
    let info = [context, direction].concat();
    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}

impl SessionKeys {
    /// Derive both directions from the X25519 secret.
    ///
    /// Directions are named after the byte order of the two public keys, so
    /// both sides agree without knowing who dialed.
    pub fn derive(
        shared_secret: &SharedSecret,
        our_public: &X25519Public,
        their_public: &X25519Public,
        context: &[u8],
    ) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(context), shared_secret.as_bytes());
        let low_to_high = expand_key(&hkdf, context, LOW_TO_HIGH)?;
        let high_to_low = expand_key(&hkdf, context, HIGH_TO_LOW)?;
        let (encrypt_key, decrypt_key) = if our_public.as_bytes() < their_public.as_bytes() {
            (low_to_high, high_to_low)
        } else {
            (high_to_low, low_to_high)
        };
        Ok(Self {
            encrypt_key,
            decrypt_key,
        })
    }

    /// Split into independent write and read halves
    pub fn split(self) -> Result<(SealingKey, OpeningKey), CryptoError> {
        let sealing = ChaCha20Poly1305::new_from_slice(&self.encrypt_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let opening = ChaCha20Poly1305::new_from_slice(&self.decrypt_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok((
            SealingKey {
                cipher: sealing,
                nonce_counter: 0,
            },
            OpeningKey {
                cipher: opening,
                nonce_counter: 0,
            },
        ))
    }
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce_bytes
}

/// Outgoing half: seals records with an implicit, increasing nonce
pub struct SealingKey {
    cipher: ChaCha20Poly1305,
    nonce_counter: u64,
}

impl SealingKey {
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = nonce_for(self.nonce_counter);
        self.nonce_counter += 1;
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }
}

/// Incoming half: records must be opened in the order they were sealed
pub struct OpeningKey {
    cipher: ChaCha20Poly1305,
    nonce_counter: u64,
}

impl OpeningKey {
    pub fn open(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = nonce_for(self.nonce_counter);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        self.nonce_counter += 1;
        Ok(plaintext)
    }
}

/// X25519 ephemeral key exchange
pub struct EphemeralKeyExchange {
    secret: EphemeralSecret,
    public: X25519Public,
}

impl EphemeralKeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Consume the secret and compute the shared one
    pub fn exchange(self, their_public: &[u8; 32]) -> SharedSecret {
        let their_public = X25519Public::from(*their_public);
        self.secret.diffie_hellman(&their_public)
    }
}

impl Default for EphemeralKeyExchange {
    fn default() -> Self {
        Self::new()
    }
}
