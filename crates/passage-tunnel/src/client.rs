//! Tunnel client: the interception layer.
//!
//! [`TunnelClient::dispatch`] is the drop-in request entry point. URLs that
//! resolve to a registered provider are serialized, sealed, and relayed
//! through the forwarding proxy over an established session; everything else
//! is forwarded untouched. Session establishment is lazy, coalesced, and
//! invisible to callers beyond latency.

use std::sync::Arc;
use std::time::Duration;

use passage_core::TunnelConfig;
use passage_crypto::{CryptoError, HandshakeError, Initiator};

use crate::error::TunnelError;
use crate::provider::{ProviderId, ProviderRegistry, ServiceProvider};
use crate::request::{Resource, TunnelRequest};
use crate::response::TunnelResponse;
use crate::snapshot::{SessionSnapshot, SnapshotStore};
use crate::store::{SessionStatus, SessionStore, TunnelSession};
use crate::transport::{HttpTransport, ProxyTransport, RelayCall};

/// Encrypted-tunnel client, generic over its proxy transport.
pub struct TunnelClient<T: ProxyTransport = HttpTransport> {
    registry: ProviderRegistry,
    store: Arc<SessionStore>,
    transport: T,
    config: TunnelConfig,
}

impl TunnelClient<HttpTransport> {
    /// A client speaking HTTP to the forwarding proxy named in `config`.
    pub fn new(config: TunnelConfig) -> Self {
        Self::with_transport(config, HttpTransport::new())
    }
}

impl<T: ProxyTransport> TunnelClient<T> {
    /// A client over a custom transport.
    pub fn with_transport(config: TunnelConfig, transport: T) -> Self {
        Self {
            registry: ProviderRegistry::new(),
            store: Arc::new(SessionStore::new()),
            transport,
            config,
        }
    }

    pub const fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Register a backend for tunneling. No traffic flows yet; the session
    /// is established on first dispatch (or by [`init_tunnel`]).
    ///
    /// [`init_tunnel`]: Self::init_tunnel
    pub fn register_provider(&self, provider: ServiceProvider) -> Result<ProviderId, TunnelError> {
        let id = self.registry.register(provider)?;
        tracing::debug!(%id, "provider registered");
        Ok(id)
    }

    /// Whether a URL would be tunneled by [`dispatch`](Self::dispatch).
    pub fn is_tunneled(&self, url: &str) -> bool {
        self.registry.resolve(url).is_some()
    }

    /// Session state for a provider.
    pub fn session_status(&self, id: ProviderId) -> SessionStatus {
        self.store.check(id)
    }

    /// Drop the session for a provider; the next dispatch re-handshakes.
    pub fn invalidate(&self, id: ProviderId) {
        self.store.invalidate(id);
    }

    /// The live session for a provider (for testing).
    #[cfg(any(test, feature = "test-utils"))]
    pub fn session(&self, id: ProviderId) -> Option<Arc<TunnelSession>> {
        self.store.session(id)
    }

    /// Pre-warm the tunnel for a provider, e.g. at startup.
    pub async fn init_tunnel(&self, id: ProviderId) -> Result<(), TunnelError> {
        self.establish_session(id).await.map(|_| ())
    }

    /// Send a request, tunneling it when its origin matches a registered
    /// provider and forwarding it untouched otherwise.
    ///
    /// Backend HTTP errors come back as ordinary responses; only
    /// tunnel-layer failures surface as `Err`.
    pub async fn dispatch(
        &self,
        resource: impl Into<Resource>,
    ) -> Result<TunnelResponse, TunnelError> {
        let resource = resource.into();
        match self.registry.resolve(resource.target()) {
            Some(id) => self.tunneled_dispatch(id, resource.into_request()).await,
            None => {
                tracing::debug!(url = resource.target(), "no provider match, passing through");
                self.transport.forward(&resource.into_request()).await
            }
        }
    }

    /// [`dispatch`](Self::dispatch) with retries on transient failures.
    ///
    /// Trust failures are never retried. A decrypt failure invalidates the
    /// session first, so the retry handshakes afresh.
    pub async fn dispatch_with_retry(
        &self,
        resource: impl Into<Resource>,
    ) -> Result<TunnelResponse, TunnelError> {
        let resource = resource.into();
        let attempts = self.config.dispatch_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dispatch(resource.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(error = %e, attempt, "dispatch failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn tunneled_dispatch(
        &self,
        id: ProviderId,
        request: TunnelRequest,
    ) -> Result<TunnelResponse, TunnelError> {
        let session = self.establish_session(id).await?;
        let provider = self
            .registry
            .get(id)
            .ok_or_else(|| TunnelError::UnknownProvider(id.to_string()))?;

        let empty_body = request.body.is_empty();
        let plaintext = serde_json::to_vec(&request)?;
        let envelope = match session.seal(&plaintext) {
            Ok(envelope) => envelope,
            Err(e) => {
                if matches!(e, CryptoError::NonceExhausted) {
                    self.store.invalidate(id);
                }
                return Err(e.into());
            }
        };

        let reply = self
            .transport
            .relay(
                &self.config.forward_proxy_url,
                RelayCall {
                    session_id: session.session_id(),
                    provider_origin: &provider.origin,
                    envelope: &envelope,
                    empty_body,
                },
            )
            .await?;

        let opened = match session.open(&reply) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                // The session key no longer matches what the provider uses;
                // drop it so the next attempt handshakes afresh.
                tracing::warn!(%id, error = %e, "response failed authentication, invalidating session");
                self.store.invalidate(id);
                return Err(e.into());
            }
        };

        Ok(serde_json::from_slice(&opened)?)
    }

    async fn establish_session(&self, id: ProviderId) -> Result<Arc<TunnelSession>, TunnelError> {
        let provider = self
            .registry
            .get(id)
            .ok_or_else(|| TunnelError::UnknownProvider(id.to_string()))?;
        let transport = self.transport.clone();
        let proxy_url = self.config.forward_proxy_url.clone();
        let ttl = self.config.session_ttl();
        self.store
            .get_or_establish(id, move || {
                perform_establish(transport, proxy_url, id, provider, ttl)
            })
            .await
    }

    /// Rebuild sessions from a snapshot store for every registered provider
    /// with a persisted entry. Returns how many sessions were restored.
    pub fn hydrate_snapshots(&self, snapshots: &SnapshotStore) -> usize {
        let mut restored = 0;
        for (id, origin) in self.registry.entries() {
            let Some(snapshot) = snapshots.get(&origin) else {
                continue;
            };
            match snapshot.hydrate(id, self.config.session_ttl()) {
                Ok(session) => {
                    self.store.insert(session);
                    restored += 1;
                }
                Err(e) => {
                    tracing::warn!(%origin, error = %e, "discarding unusable session snapshot");
                }
            }
        }
        restored
    }

    /// Export every live session for persistence.
    pub fn export_snapshots(&self) -> SnapshotStore {
        let mut snapshots = SnapshotStore::new();
        for (id, origin) in self.registry.entries() {
            if let Some(session) = self.store.session(id) {
                snapshots.insert(origin, SessionSnapshot::of(&session));
            }
        }
        snapshots
    }
}

async fn perform_establish<T: ProxyTransport>(
    transport: T,
    proxy_url: String,
    id: ProviderId,
    provider: ServiceProvider,
    ttl: Option<Duration>,
) -> Result<Arc<TunnelSession>, TunnelError> {
    tracing::debug!(origin = %provider.origin, "establishing tunnel session");

    let mut initiator = Initiator::new(provider.expected);
    let request = initiator.initiate()?;
    initiator.sent();

    let response = match transport
        .init_tunnel(&proxy_url, &provider.origin, &request)
        .await
    {
        Ok(response) => response,
        Err(HandshakeError::NetworkFailure(reason)) => {
            return Err(initiator.fail_network(reason).into());
        }
        Err(e) => return Err(e.into()),
    };

    let key = initiator.complete(&response)?;
    tracing::info!(
        origin = %provider.origin,
        session = %response.session_id,
        "tunnel session established"
    );
    Ok(Arc::new(TunnelSession::new(response.session_id, id, key, ttl)))
}
