//! Provider certificates.
//!
//! A certificate binds a service provider id to its static X25519 public
//! key. Verification compares against the identity the registry expects for
//! that provider; there is no issuance chain, the expected key is pinned at
//! registration time.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::HandshakeError;
use crate::keys::KEY_SIZE;

/// A service provider's certificate: its identity plus static public key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificate {
    /// Owner identity (service provider id).
    pub provider_id: String,
    /// Static X25519 public key of the provider.
    pub public_key: Vec<u8>,
}

/// The identity a client expects a provider to present.
#[derive(Debug, Clone)]
pub struct ExpectedPeer {
    pub provider_id: String,
    pub static_public_key: [u8; KEY_SIZE],
}

/// Verify a certificate against the expected identity for a provider.
///
/// Both the static key and the claimed identity are compared in constant
/// time. A mismatch aborts the handshake with `UntrustedPeer`; there is no
/// fallback to an unauthenticated channel.
pub fn verify_certificate(cert: &Certificate, expected: &ExpectedPeer) -> Result<(), HandshakeError> {
    let key_ok = cert.public_key.ct_eq(&expected.static_public_key);
    let id_ok = cert
        .provider_id
        .as_bytes()
        .ct_eq(expected.provider_id.as_bytes());

    if bool::from(key_ok & id_ok) {
        Ok(())
    } else {
        Err(HandshakeError::UntrustedPeer)
    }
}
