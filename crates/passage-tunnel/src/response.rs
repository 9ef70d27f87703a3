//! Response model.
//!
//! A [`TunnelResponse`] is the decrypted view of whatever the backend
//! returned, HTTP error statuses included. Only tunnel-layer failures become
//! [`TunnelError`](crate::error::TunnelError)s; a backend 500 is a normal
//! response with `status == 500`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// A backend response carried through (or around) the tunnel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TunnelResponse {
    /// Whether the backend answered with a 2xx status.
    pub const fn is_ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Body as bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, TunnelError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
