//! X25519 key material.
//!
//! An `EphemeralKeyPair` lives for exactly one handshake attempt and is
//! consumed by shared-secret derivation so the private scalar never outlives
//! the exchange. A `StaticKeyPair` is a provider's long-lived identity key,
//! used by the responder side and certified to clients.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{CryptoError, HandshakeError};

/// Length of X25519 public and secret keys in bytes.
pub const KEY_SIZE: usize = 32;

/// An ephemeral X25519 keypair, generated fresh per handshake attempt.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl EphemeralKeyPair {
    /// Generate a fresh keypair from the OS random source.
    ///
    /// `OsRng` failures panic inside the RNG; failing to obtain randomness
    /// is fatal and never retried.
    pub fn generate() -> Self {
        // The ntor construction needs DH against both the peer's ephemeral
        // and static keys, so the client ephemeral is a StaticSecret rather
        // than x25519_dalek's single-use EphemeralSecret.
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Our public key as raw bytes, to send to the peer.
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// X25519 ECDH against a peer public key.
    ///
    /// Fails with `InvalidPeerKey` if the peer value is the wrong length or
    /// a low-order point (non-contributory shared secret).
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<[u8; KEY_SIZE], HandshakeError> {
        let peer = parse_public_key(peer_public)?;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(HandshakeError::InvalidPeerKey);
        }
        Ok(*shared.as_bytes())
    }
}

/// A long-lived X25519 identity keypair for a service provider.
pub struct StaticKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for StaticKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl StaticKeyPair {
    /// Generate a new random identity keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        arr.zeroize();
        Ok(Self { secret, public })
    }

    /// Get the public key as raw bytes.
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// X25519 ECDH against a peer public key, with the same validity rules
    /// as [`EphemeralKeyPair::diffie_hellman`].
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<[u8; KEY_SIZE], HandshakeError> {
        let peer = parse_public_key(peer_public)?;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(HandshakeError::InvalidPeerKey);
        }
        Ok(*shared.as_bytes())
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, HandshakeError> {
    let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| HandshakeError::InvalidPeerKey)?;
    Ok(PublicKey::from(arr))
}
