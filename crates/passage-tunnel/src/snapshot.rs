//! Persisted session snapshots.
//!
//! Long-lived clients can export established sessions to disk and hydrate
//! them on the next start, skipping the handshake while the provider still
//! honors the session id. Snapshots keep the original creation epoch so TTL
//! accounting carries across restarts.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use passage_crypto::SessionKey;

use crate::error::TunnelError;
use crate::provider::ProviderId;
use crate::store::TunnelSession;

/// One exported session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    /// Hex-encoded session key.
    pub session_key: String,
    /// Creation time as seconds since the Unix epoch.
    pub created_at: u64,
}

impl SessionSnapshot {
    /// Capture a live session.
    pub fn of(session: &TunnelSession) -> Self {
        let created_at = session
            .created_at()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            session_id: session.session_id().to_string(),
            session_key: session.session_key().to_hex(),
            created_at,
        }
    }

    /// Rebuild a live session for `provider` with the given TTL policy.
    pub fn hydrate(
        &self,
        provider: ProviderId,
        ttl: Option<Duration>,
    ) -> Result<TunnelSession, TunnelError> {
        let key = SessionKey::from_hex(&self.session_key)?;
        let created_at = UNIX_EPOCH + Duration::from_secs(self.created_at);
        Ok(TunnelSession::with_created_at(
            self.session_id.clone(),
            provider,
            key,
            ttl,
            created_at,
        ))
    }
}

/// On-disk snapshot file: provider origin to exported session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotStore {
    #[serde(default)]
    providers: HashMap<String, SessionSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot file. A missing file is an empty store.
    pub fn load(path: &Path) -> passage_core::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the store to disk, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> passage_core::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn insert(&mut self, origin: impl Into<String>, snapshot: SessionSnapshot) {
        self.providers.insert(origin.into(), snapshot);
    }

    pub fn get(&self, origin: &str) -> Option<&SessionSnapshot> {
        self.providers.get(origin)
    }

    pub fn remove(&mut self, origin: &str) -> Option<SessionSnapshot> {
        self.providers.remove(origin)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &SessionSnapshot)> {
        self.providers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
