//! Tunnel client error types.

use passage_crypto::{CryptoError, HandshakeError};

/// Errors surfaced by the tunnel client.
///
/// `Clone` so concurrent callers coalesced onto one handshake attempt all
/// receive the same failure. Tunnel-layer failures are reported distinctly
/// from backend errors: a backend HTTP error status travels inside a normal
/// [`TunnelResponse`](crate::response::TunnelResponse), never as a variant
/// here.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The secure channel rejected an envelope. Authentication failures
    /// invalidate the session; the next dispatch re-handshakes.
    #[error("Secure channel failure: {0}")]
    Channel(#[from] CryptoError),

    /// The forwarding proxy itself rejected the call (status >= 400).
    #[error("Forwarding proxy returned {status}: {body}")]
    Proxy { status: u16, body: String },

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A provider with this origin is already registered; registry entries
    /// are immutable for their lifetime.
    #[error("Provider already registered for origin {0}")]
    DuplicateProvider(String),

    #[error("Unknown provider handle: {0}")]
    UnknownProvider(String),
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl TunnelError {
    /// Whether re-dispatching may help. Trust failures never are, and a
    /// proxy 4xx rejection will not change on a retry.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Handshake(e) => e.is_retryable(),
            Self::Channel(CryptoError::AuthenticationFailed | CryptoError::NonceExhausted)
            | Self::Network(_) => true,
            Self::Proxy { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
