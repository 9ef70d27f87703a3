//! Passage tunnel cryptography.
//!
//! Primitives for the client↔provider encrypted tunnel, with the forwarding
//! proxy unable to see request or response content.
//!
//! ## Crypto primitives
//!
//! - **Keys**: ephemeral X25519 keypair per handshake attempt; static X25519
//!   identity per provider
//! - **Handshake**: ntor-flavoured authenticated ECDH → transcript-bound
//!   HKDF-SHA256 → symmetric session key
//! - **Channel**: ChaCha20-Poly1305 AEAD, 12-byte nonce (4-byte counter +
//!   8-byte random prefix)

pub mod certs;
pub mod channel;
pub mod error;
pub mod handshake;
pub mod keys;

pub use certs::{Certificate, ExpectedPeer, verify_certificate};
pub use channel::{Envelope, NONCE_SIZE, SecureChannel, SessionKey};
pub use error::{CryptoError, HandshakeError};
#[cfg(any(test, feature = "test-utils"))]
pub use handshake::perform_handshake;
pub use handshake::{
    HandshakeState, InitRequest, InitResponse, Initiator, Responder, ResponderSession,
};
pub use keys::{EphemeralKeyPair, KEY_SIZE, StaticKeyPair};
