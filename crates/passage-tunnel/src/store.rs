//! Session store with coalesced establishment.
//!
//! One live session per provider. Concurrent callers that find no session
//! coalesce onto a single handshake attempt instead of racing: the first
//! caller installs an in-flight marker and spawns the establishment future;
//! everyone else subscribes to its result over a watch channel. The spawned
//! task clears its own marker, so a caller that gives up waiting cannot
//! strand the slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

use passage_crypto::{CryptoError, Envelope, SecureChannel, SessionKey};

use crate::error::TunnelError;
use crate::provider::ProviderId;

/// An established tunnel session: identifier, channel, and lifetime.
pub struct TunnelSession {
    session_id: String,
    provider: ProviderId,
    /// Retained alongside the channel so the session can be exported to a
    /// snapshot.
    key: SessionKey,
    channel: SecureChannel,
    created_at: SystemTime,
    ttl: Option<Duration>,
}

impl TunnelSession {
    pub fn new(
        session_id: String,
        provider: ProviderId,
        key: SessionKey,
        ttl: Option<Duration>,
    ) -> Self {
        Self::with_created_at(session_id, provider, key, ttl, SystemTime::now())
    }

    /// Rebuild a session from persisted state, keeping its original epoch so
    /// TTL accounting survives a restart.
    pub fn with_created_at(
        session_id: String,
        provider: ProviderId,
        key: SessionKey,
        ttl: Option<Duration>,
        created_at: SystemTime,
    ) -> Self {
        let channel = SecureChannel::new(&key);
        Self {
            session_id,
            provider,
            key,
            channel,
            created_at,
            ttl,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub const fn provider(&self) -> ProviderId {
        self.provider
    }

    pub const fn session_key(&self) -> &SessionKey {
        &self.key
    }

    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
        self.channel.seal(plaintext)
    }

    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        self.channel.open(envelope)
    }

    /// Force the channel's nonce counter to the exhaustion point (for
    /// testing).
    #[cfg(any(test, feature = "test-utils"))]
    pub fn exhaust_nonces(&self) {
        self.channel.exhaust_nonces();
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.ttl {
            Some(ttl) => now
                .duration_since(self.created_at)
                .map(|age| age >= ttl)
                .unwrap_or(false),
            None => false,
        }
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("session_id", &self.session_id)
            .field("provider", &self.provider)
            .field("created_at", &self.created_at)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Observable session state for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// A live session exists.
    Valid,
    /// No session, or one is still being established.
    Absent,
    /// A session exists but its TTL has elapsed; the next dispatch will
    /// re-handshake.
    Expired,
}

type EstablishResult = Result<Arc<TunnelSession>, TunnelError>;

enum Slot {
    /// A handshake is in flight; subscribe for its outcome.
    InFlight(watch::Receiver<Option<EstablishResult>>),
    Ready(Arc<TunnelSession>),
}

/// Per-provider session map with single-flight establishment.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<ProviderId, Slot>>,
}

/// Removes an in-flight marker if the establishment task unwinds before
/// recording an outcome, so the provider stays establishable.
struct SlotGuard {
    store: Arc<SessionStore>,
    provider: ProviderId,
    armed: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut sessions = self
            .store
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(sessions.get(&self.provider), Some(Slot::InFlight(_))) {
            sessions.remove(&self.provider);
        }
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live session for `provider`, establishing one if needed.
    ///
    /// At most one establishment future runs per provider at a time; every
    /// concurrent caller receives the same outcome. An expired session is
    /// treated as absent.
    pub async fn get_or_establish<F, Fut>(
        self: &Arc<Self>,
        provider: ProviderId,
        establish: F,
    ) -> EstablishResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EstablishResult> + Send + 'static,
    {
        // Awaiting inside the guard's scope would make this future !Send,
        // so every path exits the labeled block (dropping the lock) before
        // awaiting the outcome.
        let mut rx = 'subscribe: {
            let mut sessions = self
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            match sessions.get(&provider) {
                Some(Slot::Ready(session)) if !session.is_expired(SystemTime::now()) => {
                    return Ok(Arc::clone(session));
                }
                Some(Slot::Ready(_)) => {
                    tracing::debug!(%provider, "session expired, re-establishing");
                    sessions.remove(&provider);
                }
                Some(Slot::InFlight(rx)) => {
                    break 'subscribe rx.clone();
                }
                None => {}
            }

            let (tx, rx) = watch::channel(None);
            sessions.insert(provider, Slot::InFlight(rx.clone()));

            let store = Arc::clone(self);
            let fut = establish();
            // The task owns slot cleanup, so an abandoned caller cannot
            // leave the in-flight marker behind. The guard covers the case
            // where the establishment future itself panics.
            tokio::spawn(async move {
                let mut guard = SlotGuard {
                    store,
                    provider,
                    armed: true,
                };
                let outcome = fut.await;
                {
                    let mut sessions = guard
                        .store
                        .sessions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    match &outcome {
                        Ok(session) => {
                            sessions.insert(provider, Slot::Ready(Arc::clone(session)));
                        }
                        Err(_) => {
                            sessions.remove(&provider);
                        }
                    }
                    guard.armed = false;
                }
                // Receivers may all be gone; that is fine.
                let _ = tx.send(Some(outcome));
            });

            rx
        };

        Self::await_outcome_ref(&mut rx).await
    }

    async fn await_outcome(mut rx: watch::Receiver<Option<EstablishResult>>) -> EstablishResult {
        Self::await_outcome_ref(&mut rx).await
    }

    async fn await_outcome_ref(
        rx: &mut watch::Receiver<Option<EstablishResult>>,
    ) -> EstablishResult {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            rx.changed()
                .await
                .map_err(|_| TunnelError::Network("handshake task aborted".to_string()))?;
        }
    }

    /// Session state for a provider as of now.
    pub fn check(&self, provider: ProviderId) -> SessionStatus {
        self.check_at(provider, SystemTime::now())
    }

    pub fn check_at(&self, provider: ProviderId, now: SystemTime) -> SessionStatus {
        match self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider)
        {
            Some(Slot::Ready(session)) if session.is_expired(now) => SessionStatus::Expired,
            Some(Slot::Ready(_)) => SessionStatus::Valid,
            Some(Slot::InFlight(_)) | None => SessionStatus::Absent,
        }
    }

    /// The live session for a provider, if one exists and is unexpired.
    pub fn session(&self, provider: ProviderId) -> Option<Arc<TunnelSession>> {
        match self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider)
        {
            Some(Slot::Ready(session)) if !session.is_expired(SystemTime::now()) => {
                Some(Arc::clone(session))
            }
            _ => None,
        }
    }

    /// Drop the session for a provider. An in-flight establishment is left
    /// alone; its own task will record the outcome.
    pub fn invalidate(&self, provider: ProviderId) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(sessions.get(&provider), Some(Slot::Ready(_))) {
            sessions.remove(&provider);
        }
    }

    /// Install a session directly, e.g. when hydrating from a snapshot.
    pub fn insert(&self, session: TunnelSession) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.provider(), Slot::Ready(Arc::new(session)));
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SessionStore")
            .field("len", &sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::provider::{ProviderRegistry, ServiceProvider};
    use passage_crypto::ExpectedPeer;

    fn provider_id() -> ProviderId {
        let registry = ProviderRegistry::new();
        registry
            .register(ServiceProvider::new(
                "https://backend.example",
                ExpectedPeer {
                    provider_id: "backend.example".to_string(),
                    static_public_key: [1u8; 32],
                },
            ))
            .unwrap()
    }

    fn session(provider: ProviderId, ttl: Option<Duration>) -> TunnelSession {
        TunnelSession::new(
            "abc123".to_string(),
            provider,
            SessionKey::from_bytes([9u8; 32]),
            ttl,
        )
    }

    #[tokio::test]
    async fn establishes_once_and_reuses() {
        let store = Arc::new(SessionStore::new());
        let provider = provider_id();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let got = store
                .get_or_establish(provider, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(session(provider, None)))
                })
                .await
                .unwrap();
            assert_eq!(got.session_id(), "abc123");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.check(provider), SessionStatus::Valid);
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce() {
        let store = Arc::new(SessionStore::new());
        let provider = provider_id();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                store
                    .get_or_establish(provider, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Arc::new(session(provider, None)))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_clears_slot() {
        let store = Arc::new(SessionStore::new());
        let provider = provider_id();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .get_or_establish(provider, move || async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(TunnelError::Network("refused".to_string()))
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, TunnelError::Network(_)));
        }
        // Failed attempt leaves no slot behind; next call re-establishes.
        assert_eq!(store.check(provider), SessionStatus::Absent);
        let got = store
            .get_or_establish(provider, move || async move {
                Ok(Arc::new(session(provider, None)))
            })
            .await;
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn panicked_establishment_clears_the_slot() {
        let store = Arc::new(SessionStore::new());
        let provider = provider_id();

        let err = store
            .get_or_establish(provider, move || async move {
                panic!("establishment blew up")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Network(_)));
        assert_eq!(store.check(provider), SessionStatus::Absent);

        // The slot is free again; a later attempt runs and succeeds.
        let got = store
            .get_or_establish(provider, move || async move {
                Ok(Arc::new(session(provider, None)))
            })
            .await;
        assert!(got.is_ok());
        assert_eq!(store.check(provider), SessionStatus::Valid);
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_strand_the_slot() {
        let store = Arc::new(SessionStore::new());
        let provider = provider_id();

        let attempt = {
            let store = Arc::clone(&store);
            tokio::time::timeout(
                Duration::from_millis(10),
                store.get_or_establish(provider, move || async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Arc::new(session(provider, None)))
                }),
            )
            .await
        };
        assert!(attempt.is_err(), "first caller should time out");

        // The spawned task still completes and records the session.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.check(provider), SessionStatus::Valid);
    }

    #[tokio::test]
    async fn expired_session_is_reestablished() {
        let store = Arc::new(SessionStore::new());
        let provider = provider_id();
        store.insert(session(provider, Some(Duration::ZERO)));
        assert_eq!(store.check(provider), SessionStatus::Expired);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        store
            .get_or_establish(provider, move || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(session(provider, None)))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.check(provider), SessionStatus::Valid);
    }

    #[tokio::test]
    async fn invalidate_removes_ready_session() {
        let store = Arc::new(SessionStore::new());
        let provider = provider_id();
        store.insert(session(provider, None));
        assert_eq!(store.check(provider), SessionStatus::Valid);

        store.invalidate(provider);
        assert_eq!(store.check(provider), SessionStatus::Absent);
        assert!(store.session(provider).is_none());
    }

    #[test]
    fn ttl_accounting_uses_creation_epoch() {
        let provider = provider_id();
        let created = SystemTime::now() - Duration::from_secs(100);
        let session = TunnelSession::with_created_at(
            "abc".to_string(),
            provider,
            SessionKey::from_bytes([3u8; 32]),
            Some(Duration::from_secs(60)),
            created,
        );
        assert!(session.is_expired(SystemTime::now()));
        assert!(!session.is_expired(created + Duration::from_secs(30)));
    }

    #[test]
    fn session_without_ttl_never_expires() {
        let provider = provider_id();
        let session = session(provider, None);
        assert!(!session.is_expired(SystemTime::now() + Duration::from_secs(1_000_000)));
    }

    #[test]
    fn session_seal_open_roundtrip() {
        let provider = provider_id();
        let session = session(provider, None);
        let peer = TunnelSession::new(
            "abc123".to_string(),
            provider,
            SessionKey::from_bytes([9u8; 32]),
            None,
        );
        let envelope = session.seal(b"payload").unwrap();
        assert_eq!(peer.open(&envelope).unwrap(), b"payload");
    }
}
