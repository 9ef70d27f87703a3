//! Authenticated key-exchange protocol.
//!
//! ntor-flavoured handshake: the client sends a fresh ephemeral X25519
//! public key; the provider answers with its own ephemeral public key, a
//! transcript hash, and its certificate. Both sides derive the session key
//! from two DH outputs (ephemeral-ephemeral and ephemeral-static) through
//! HKDF-SHA256 keyed to the transcript, binding the key to this exact
//! exchange and to the provider's certified identity.
//!
//! The [`Initiator`] walks the per-attempt state machine
//! `Idle → KeySent → AwaitingResponse → Verifying → Established | Failed`.
//! Every failure is terminal for the attempt; retry policy belongs to the
//! caller.

use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::certs::{Certificate, ExpectedPeer, verify_certificate};
use crate::channel::SessionKey;
use crate::error::{CryptoError, HandshakeError};
use crate::keys::{EphemeralKeyPair, StaticKeyPair};

/// Domain separation label for the handshake transcript.
const TRANSCRIPT_LABEL: &[u8] = b"passage-handshake-v1";

/// HKDF salt for domain separation (recommended by RFC 5869).
const HKDF_SALT: &[u8] = b"passage-hkdf-salt-v1";

/// HKDF info prefix; the transcript hash is appended per exchange.
const HKDF_INFO: &[u8] = b"passage-session-v1";

/// First handshake message: client → initiation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    /// Client ephemeral X25519 public key.
    pub public_key: Vec<u8>,
    /// Optional client-chosen session metadata, opaque to the protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Second handshake message: provider → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    /// Provider-assigned session identifier, echoed on tunneled calls.
    pub session_id: String,
    /// Provider ephemeral X25519 public key.
    pub ephemeral_public_key: Vec<u8>,
    /// Provider's view of the handshake transcript.
    pub transcript_hash: Vec<u8>,
    /// Provider certificate: identity plus static public key.
    pub certificate: Certificate,
}

/// States of one handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    KeySent,
    AwaitingResponse,
    Verifying,
    Established,
    Failed,
}

/// Hash of the ordered handshake transcript.
///
/// `SHA-256(label || client_pub || server_ephemeral_pub || server_static_pub
/// || provider_id)`.
fn transcript_hash(client_public: &[u8], server_ephemeral: &[u8], cert: &Certificate) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_LABEL);
    hasher.update(client_public);
    hasher.update(server_ephemeral);
    hasher.update(&cert.public_key);
    hasher.update(cert.provider_id.as_bytes());
    hasher.finalize().into()
}

/// Derive the symmetric session key from both DH outputs and the transcript.
///
/// The input key material is zeroized before returning.
fn derive_session_key(
    mut dh_ephemeral: [u8; 32],
    mut dh_static: [u8; 32],
    transcript: &[u8; 32],
) -> Result<SessionKey, CryptoError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(&dh_ephemeral);
    ikm[32..].copy_from_slice(&dh_static);
    dh_ephemeral.zeroize();
    dh_static.zeroize();

    let mut info = Vec::with_capacity(HKDF_INFO.len() + transcript.len());
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(transcript);

    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &ikm);
    let mut key = [0u8; 32];
    let expand = hk.expand(&info, &mut key);
    ikm.zeroize();
    expand.map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    let session_key = SessionKey::from_bytes(key);
    key.zeroize();
    Ok(session_key)
}

/// Client side of the handshake.
pub struct Initiator {
    state: HandshakeState,
    /// Ephemeral keypair for this attempt; consumed on key derivation so
    /// the private scalar never outlives the exchange.
    keypair: Option<EphemeralKeyPair>,
    expected: ExpectedPeer,
    metadata: Option<serde_json::Value>,
}

impl Initiator {
    /// Start a handshake attempt toward a provider with a pinned identity.
    pub const fn new(expected: ExpectedPeer) -> Self {
        Self {
            state: HandshakeState::Idle,
            keypair: None,
            expected,
            metadata: None,
        }
    }

    /// Attach client-chosen session metadata to the init request.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Generate the ephemeral keypair and produce the init request.
    ///
    /// Transitions `Idle → KeySent`.
    pub fn initiate(&mut self) -> Result<InitRequest, HandshakeError> {
        if self.state != HandshakeState::Idle {
            return Err(HandshakeError::InvalidState("initiate requires Idle"));
        }
        let keypair = EphemeralKeyPair::generate();
        let request = InitRequest {
            public_key: keypair.public_bytes().to_vec(),
            metadata: self.metadata.clone(),
        };
        self.keypair = Some(keypair);
        self.state = HandshakeState::KeySent;
        Ok(request)
    }

    /// Mark the init request as in flight. This is the sole suspension
    /// point of the handshake; the caller awaits the network here.
    pub fn sent(&mut self) {
        if self.state == HandshakeState::KeySent {
            self.state = HandshakeState::AwaitingResponse;
        }
    }

    /// Record a network-level failure while awaiting the response.
    ///
    /// Terminal; the engine does not auto-retry.
    pub fn fail_network(&mut self, reason: impl Into<String>) -> HandshakeError {
        self.state = HandshakeState::Failed;
        self.keypair = None;
        HandshakeError::NetworkFailure(reason.into())
    }

    /// Verify the provider's response and derive the session key.
    ///
    /// Transitions through `Verifying` to `Established`, or to `Failed` on
    /// certificate mismatch, transcript mismatch, or a malformed response.
    pub fn complete(&mut self, response: &InitResponse) -> Result<SessionKey, HandshakeError> {
        if !matches!(
            self.state,
            HandshakeState::KeySent | HandshakeState::AwaitingResponse
        ) {
            return Err(HandshakeError::InvalidState(
                "complete requires an in-flight attempt",
            ));
        }
        self.state = HandshakeState::Verifying;

        match self.verify_and_derive(response) {
            Ok(key) => {
                self.state = HandshakeState::Established;
                Ok(key)
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    fn verify_and_derive(&mut self, response: &InitResponse) -> Result<SessionKey, HandshakeError> {
        let keypair = self
            .keypair
            .take()
            .ok_or(HandshakeError::InvalidState("ephemeral key already consumed"))?;

        if response.session_id.is_empty() {
            return Err(HandshakeError::MalformedResponse(
                "response carries no session id".to_string(),
            ));
        }

        verify_certificate(&response.certificate, &self.expected)?;

        let client_public = keypair.public_bytes();
        let transcript = transcript_hash(
            &client_public,
            &response.ephemeral_public_key,
            &response.certificate,
        );
        // The provider proves it saw this exact exchange; a mismatch means
        // the response cannot be bound to our init request.
        if !bool::from(response.transcript_hash.ct_eq(&transcript)) {
            return Err(HandshakeError::UntrustedPeer);
        }

        let dh_ephemeral = keypair.diffie_hellman(&response.ephemeral_public_key)?;
        // Pinned static key; equal to the certificate's key after verification.
        let dh_static = keypair.diffie_hellman(&self.expected.static_public_key)?;

        Ok(derive_session_key(dh_ephemeral, dh_static, &transcript)?)
        // `keypair` drops here; the private scalar is discarded.
    }
}

/// Session state handed out by a [`Responder`] on handshake success.
pub struct ResponderSession {
    pub session_id: String,
    pub key: SessionKey,
}

/// Provider side of the handshake.
///
/// Production deployments run this behind the forwarding proxy; in this
/// workspace it also backs the in-memory transport used by the tunnel tests.
pub struct Responder {
    identity: StaticKeyPair,
    provider_id: String,
}

impl Responder {
    /// Create a responder with a freshly generated static identity.
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            identity: StaticKeyPair::generate(),
            provider_id: provider_id.into(),
        }
    }

    /// Create a responder around an existing identity keypair.
    pub fn with_identity(provider_id: impl Into<String>, identity: StaticKeyPair) -> Self {
        Self {
            identity,
            provider_id: provider_id.into(),
        }
    }

    /// The certificate this responder presents during handshakes.
    pub fn certificate(&self) -> Certificate {
        Certificate {
            provider_id: self.provider_id.clone(),
            public_key: self.identity.public_bytes().to_vec(),
        }
    }

    /// The static public key clients should pin for this provider.
    pub fn static_public_key(&self) -> [u8; 32] {
        self.identity.public_bytes()
    }

    /// Accept an init request: derive the session key and build the
    /// response carrying our ephemeral key, transcript hash and certificate.
    pub fn respond(
        &self,
        request: &InitRequest,
    ) -> Result<(InitResponse, ResponderSession), HandshakeError> {
        let ephemeral = EphemeralKeyPair::generate();

        let dh_ephemeral = ephemeral.diffie_hellman(&request.public_key)?;
        let dh_static = self.identity.diffie_hellman(&request.public_key)?;

        let certificate = self.certificate();
        let transcript = transcript_hash(
            &request.public_key,
            &ephemeral.public_bytes(),
            &certificate,
        );
        let key = derive_session_key(dh_ephemeral, dh_static, &transcript)?;

        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let session_id = hex::encode(id_bytes);

        let response = InitResponse {
            session_id: session_id.clone(),
            ephemeral_public_key: ephemeral.public_bytes().to_vec(),
            transcript_hash: transcript.to_vec(),
            certificate,
        };

        Ok((response, ResponderSession { session_id, key }))
    }
}

/// Run a complete in-process handshake between a fresh initiator and the
/// given responder. Returns both derived keys for equality assertions.
#[cfg(any(test, feature = "test-utils"))]
pub fn perform_handshake(
    responder: &Responder,
) -> Result<(SessionKey, ResponderSession), HandshakeError> {
    let expected = ExpectedPeer {
        provider_id: responder.provider_id.clone(),
        static_public_key: responder.static_public_key(),
    };
    let mut initiator = Initiator::new(expected);
    let request = initiator.initiate()?;
    initiator.sent();
    let (response, server_session) = responder.respond(&request)?;
    let client_key = initiator.complete(&response)?;
    Ok((client_key, server_session))
}
