//! In-memory transport double.
//!
//! Plays the forwarding proxy, the provider's handshake responder, and the
//! backend in one process, with no sockets. Tests drive the real client,
//! real handshake, and real AEAD codec against it, plus fault injection for
//! the failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use passage_crypto::{
    Envelope, HandshakeError, InitRequest, InitResponse, Responder, SecureChannel,
    ExpectedPeer,
};

use crate::error::TunnelError;
use crate::request::TunnelRequest;
use crate::response::TunnelResponse;
use crate::transport::{ProxyTransport, RelayCall};

type BackendFn = dyn Fn(&TunnelRequest) -> TunnelResponse + Send + Sync;

struct Inner {
    responder: Responder,
    backend: Box<BackendFn>,
    sessions: Mutex<HashMap<String, SecureChannel>>,
    init_calls: AtomicUsize,
    relay_calls: AtomicUsize,
    forward_calls: AtomicUsize,
    fail_next_init: AtomicBool,
    corrupt_next_relay: AtomicBool,
    init_delay: Mutex<Option<Duration>>,
    saw_empty_body_marker: AtomicBool,
}

/// A [`ProxyTransport`] that terminates the tunnel in process.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    /// Create a transport whose provider answers as `provider_id` and whose
    /// backend is the given handler.
    pub fn new<F>(provider_id: impl Into<String>, backend: F) -> Self
    where
        F: Fn(&TunnelRequest) -> TunnelResponse + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                responder: Responder::new(provider_id),
                backend: Box::new(backend),
                sessions: Mutex::new(HashMap::new()),
                init_calls: AtomicUsize::new(0),
                relay_calls: AtomicUsize::new(0),
                forward_calls: AtomicUsize::new(0),
                fail_next_init: AtomicBool::new(false),
                corrupt_next_relay: AtomicBool::new(false),
                init_delay: Mutex::new(None),
                saw_empty_body_marker: AtomicBool::new(false),
            }),
        }
    }

    /// A transport whose backend echoes the request body with status 200.
    pub fn echo(provider_id: impl Into<String>) -> Self {
        Self::new(provider_id, |request| TunnelResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
            body: request.body.clone(),
        })
    }

    /// The identity clients should pin when registering this provider.
    pub fn expected_peer(&self) -> ExpectedPeer {
        ExpectedPeer {
            provider_id: self.inner.responder.certificate().provider_id,
            static_public_key: self.inner.responder.static_public_key(),
        }
    }

    pub fn init_calls(&self) -> usize {
        self.inner.init_calls.load(Ordering::SeqCst)
    }

    pub fn relay_calls(&self) -> usize {
        self.inner.relay_calls.load(Ordering::SeqCst)
    }

    pub fn forward_calls(&self) -> usize {
        self.inner.forward_calls.load(Ordering::SeqCst)
    }

    /// Make the next handshake attempt fail at the network layer.
    pub fn fail_next_init(&self) {
        self.inner.fail_next_init.store(true, Ordering::SeqCst);
    }

    /// Corrupt one ciphertext byte of the next relay response.
    pub fn corrupt_next_relay(&self) {
        self.inner.corrupt_next_relay.store(true, Ordering::SeqCst);
    }

    /// Delay handshake responses, to widen coalescing windows in tests.
    pub fn set_init_delay(&self, delay: Duration) {
        *self
            .inner
            .init_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Whether any relay carried the empty-body marker.
    pub fn saw_empty_body_marker(&self) -> bool {
        self.inner.saw_empty_body_marker.load(Ordering::SeqCst)
    }
}

impl ProxyTransport for InMemoryTransport {
    async fn init_tunnel(
        &self,
        _proxy_url: &str,
        _backend_origin: &str,
        request: &InitRequest,
    ) -> Result<InitResponse, HandshakeError> {
        self.inner.init_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self
            .inner
            .init_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.fail_next_init.swap(false, Ordering::SeqCst) {
            return Err(HandshakeError::NetworkFailure(
                "injected connection failure".to_string(),
            ));
        }

        let (response, session) = self.inner.responder.respond(request)?;
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.session_id, SecureChannel::new(&session.key));
        Ok(response)
    }

    async fn relay(
        &self,
        _proxy_url: &str,
        call: RelayCall<'_>,
    ) -> Result<Envelope, TunnelError> {
        self.inner.relay_calls.fetch_add(1, Ordering::SeqCst);
        if call.empty_body {
            self.inner
                .saw_empty_body_marker
                .store(true, Ordering::SeqCst);
        }

        let sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let channel = sessions.get(call.session_id).ok_or(TunnelError::Proxy {
            status: 401,
            body: "unknown session".to_string(),
        })?;

        let plaintext = channel.open(call.envelope).map_err(|e| TunnelError::Proxy {
            status: 400,
            body: format!("undecryptable request: {e}"),
        })?;
        let request: TunnelRequest = serde_json::from_slice(&plaintext)?;
        let response = (self.inner.backend)(&request);

        let mut envelope = channel.seal(&serde_json::to_vec(&response)?)?;
        drop(sessions);

        if self.inner.corrupt_next_relay.swap(false, Ordering::SeqCst) {
            if let Some(byte) = envelope.ciphertext.first_mut() {
                *byte ^= 0xFF;
            }
        }
        Ok(envelope)
    }

    async fn forward(&self, request: &TunnelRequest) -> Result<TunnelResponse, TunnelError> {
        self.inner.forward_calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.inner.backend)(request))
    }
}
