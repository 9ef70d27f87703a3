//! Crypto and handshake error types.

/// Errors from cryptographic operations.
///
/// `Clone` so a single failure can be broadcast to every caller coalesced
/// onto the same handshake attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// The envelope's authentication tag did not verify. No plaintext is
    /// ever returned, not even partially.
    #[error("Envelope authentication failed")]
    AuthenticationFailed,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Nonce counter exhausted — session must be rekeyed")]
    NonceExhausted,
}

/// Errors from a handshake attempt. All variants are terminal for that
/// attempt; the engine never retries on its own.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    /// The peer's public value is not a usable X25519 element (wrong length
    /// or a low-order point yielding a non-contributory shared secret).
    #[error("Peer public key is not a valid X25519 element")]
    InvalidPeerKey,

    /// The certificate does not match the expected identity for this
    /// provider, or the transcript hash does not bind to this exchange.
    /// Never downgraded to an unauthenticated channel.
    #[error("Peer certificate does not match the expected identity")]
    UntrustedPeer,

    #[error("Malformed handshake response: {0}")]
    MalformedResponse(String),

    #[error("Network failure during handshake: {0}")]
    NetworkFailure(String),

    #[error("Handshake invoked in invalid state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl HandshakeError {
    /// Whether retrying the handshake may help. Trust failures are
    /// deliberately non-retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure(_))
    }
}
