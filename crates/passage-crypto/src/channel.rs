//! Secure channel codec for tunneled payloads.
//!
//! Wraps and unwraps message payloads with ChaCha20-Poly1305 AEAD under a
//! handshake-derived session key. Nonces are unique per channel: a 4-byte
//! monotonic counter plus an 8-byte random prefix chosen at construction.

use std::sync::atomic::{AtomicU32, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// A 32-byte symmetric session key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

impl SessionKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding for persisted session snapshots.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a key from its hex encoding.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)
            .map_err(|e| CryptoError::KeyDerivationFailed(format!("invalid hex key: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: b.len(),
            })?;
        Ok(Self(arr))
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        bool::from(self.0.ct_eq(&other.0))
    }
}
impl Eq for SessionKey {}

/// The wire representation of one tunneled payload.
///
/// Constructed fresh per message, never persisted. The authentication tag
/// is appended to the ciphertext by the AEAD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// 12-byte nonce used for this encryption.
    pub nonce: Vec<u8>,
    /// ChaCha20-Poly1305 ciphertext (includes 16-byte auth tag).
    pub ciphertext: Vec<u8>,
}

/// A secure channel holding the symmetric session key.
///
/// Provides AEAD sealing/opening with unique-nonce discipline. Counter
/// exhaustion surfaces `NonceExhausted` rather than wrapping.
pub struct SecureChannel {
    cipher: ChaCha20Poly1305,
    /// Random prefix for nonces (set once per channel).
    nonce_prefix: [u8; 8],
    /// Monotonic counter for nonce uniqueness.
    nonce_counter: AtomicU32,
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.nonce_prefix.zeroize();
    }
}

impl SecureChannel {
    /// Create a channel from a derived session key.
    pub fn new(key: &SessionKey) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

        let mut nonce_prefix = [0u8; 8];
        OsRng.fill_bytes(&mut nonce_prefix);

        Self {
            cipher,
            nonce_prefix,
            nonce_counter: AtomicU32::new(0),
        }
    }

    /// Encrypt a plaintext payload into an [`Envelope`] under a fresh nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        let nonce_bytes = self.next_nonce()?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(Envelope {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt an envelope.
    ///
    /// Fails closed: any tag mismatch is `AuthenticationFailed` with no
    /// plaintext exposed. Callers treat that as session corruption and
    /// invalidate the session rather than retrying with the same key.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        if envelope.nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: envelope.nonce.len(),
            });
        }
        let nonce = Nonce::from_slice(&envelope.nonce);
        self.cipher
            .decrypt(nonce, envelope.ciphertext.as_ref())
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Generate the next unique nonce.
    ///
    /// Layout: [4-byte counter (big-endian)] [8-byte random prefix]
    ///
    /// Uses compare-and-swap to prevent counter wrapping under concurrent
    /// access. Returns `NonceExhausted` once the counter reaches `u32::MAX`,
    /// meaning the session must be re-established.
    ///
    /// `Ordering::Relaxed` is sufficient: the counter only needs to produce
    /// unique values, and `cipher`/`nonce_prefix` are set once at
    /// construction and never modified.
    fn next_nonce(&self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        loop {
            let current = self.nonce_counter.load(Ordering::Relaxed);
            if current == u32::MAX {
                return Err(CryptoError::NonceExhausted);
            }
            if let Ok(prev) = self.nonce_counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                let mut nonce = [0u8; NONCE_SIZE];
                nonce[..4].copy_from_slice(&prev.to_be_bytes());
                nonce[4..].copy_from_slice(&self.nonce_prefix);
                return Ok(nonce);
            }
        }
    }

    /// Get the current nonce counter value (for testing).
    #[cfg(any(test, feature = "test-utils"))]
    pub fn nonce_counter(&self) -> u32 {
        self.nonce_counter.load(Ordering::Relaxed)
    }

    /// Force the counter to the exhaustion point (for testing).
    #[cfg(any(test, feature = "test-utils"))]
    pub fn exhaust_nonces(&self) {
        self.nonce_counter.store(u32::MAX, Ordering::Relaxed);
    }
}
