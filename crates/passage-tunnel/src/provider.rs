//! Service provider registry.
//!
//! Maps logical backend identities to tunnel configuration: the backend
//! origin and the certificate identity the provider is expected to present.
//! Registration happens before any traffic can be tunneled; entries are
//! immutable for their lifetime.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

use passage_crypto::ExpectedPeer;

use crate::error::TunnelError;

/// Opaque handle to a registered service provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(Uuid);

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A backend eligible for tunneling.
#[derive(Debug, Clone)]
pub struct ServiceProvider {
    /// Normalized backend origin (`scheme://host[:port]`).
    pub origin: String,
    /// The certificate identity this provider must present.
    pub expected: ExpectedPeer,
}

impl ServiceProvider {
    pub fn new(origin: impl Into<String>, expected: ExpectedPeer) -> Self {
        Self {
            origin: origin.into(),
            expected,
        }
    }
}

/// Registry of service providers, keyed by normalized origin.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<Uuid, ServiceProvider>>,
    by_origin: RwLock<HashMap<String, ProviderId>>,
}

/// Normalize a URL down to its origin: `scheme://host[:port]`, default
/// ports omitted. This is the single matching rule used by [`resolve`].
///
/// [`resolve`]: ProviderRegistry::resolve
pub fn origin_of(raw: &str) -> Result<String, TunnelError> {
    let parsed = url::Url::parse(raw).map_err(|e| TunnelError::InvalidUrl(format!("{raw}: {e}")))?;
    let origin = parsed.origin();
    if !matches!(origin, url::Origin::Tuple(..)) {
        return Err(TunnelError::InvalidUrl(format!("{raw}: opaque origin")));
    }
    Ok(origin.ascii_serialization())
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider and return its opaque handle.
    ///
    /// The origin is normalized before insertion. Registering a second
    /// provider for the same origin is rejected.
    pub fn register(&self, provider: ServiceProvider) -> Result<ProviderId, TunnelError> {
        let origin = origin_of(&provider.origin)?;

        let mut by_origin = self
            .by_origin
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if by_origin.contains_key(&origin) {
            return Err(TunnelError::DuplicateProvider(origin));
        }

        let id = ProviderId(Uuid::new_v4());
        let entry = ServiceProvider {
            origin: origin.clone(),
            expected: provider.expected,
        };
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.0, entry);
        by_origin.insert(origin, id);
        Ok(id)
    }

    /// Resolve a request URL to a registered provider.
    ///
    /// Matching is by exact origin: the URL's `scheme://host[:port]` must
    /// equal a registered provider's normalized origin. Unmatched URLs are
    /// `None` — the documented pass-through signal, not an error.
    pub fn resolve(&self, request_url: &str) -> Option<ProviderId> {
        let origin = origin_of(request_url).ok()?;
        self.by_origin
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&origin)
            .copied()
    }

    /// Look up a provider by handle.
    pub fn get(&self, id: ProviderId) -> Option<ServiceProvider> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id.0)
            .cloned()
    }

    /// All registered provider handles with their origins.
    pub fn entries(&self) -> Vec<(ProviderId, String)> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, p)| (ProviderId(*id), p.origin.clone()))
            .collect()
    }

    /// Find a provider handle by its normalized origin.
    pub fn find_by_origin(&self, origin: &str) -> Option<ProviderId> {
        let normalized = origin_of(origin).ok()?;
        self.by_origin
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalized)
            .copied()
    }
}
