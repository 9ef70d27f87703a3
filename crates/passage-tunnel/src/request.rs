//! Request model for the interception layer.
//!
//! `dispatch` is polymorphic over a bare target URL and a structured
//! request; both normalize into a [`TunnelRequest`], which is also the
//! plaintext serialized into the tunnel envelope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// A request body, tagged by shape.
///
/// Call sites keep the flexibility of passing text, raw bytes, JSON or form
/// pairs; conversion to wire bytes and the implied `Content-Type` happens in
/// one place.
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
    /// URL-encoded form pairs.
    Form(Vec<(String, String)>),
}

impl Body {
    /// Convert into raw bytes plus the content type the shape implies.
    fn into_bytes(self) -> Result<(Vec<u8>, Option<&'static str>), TunnelError> {
        match self {
            Self::Empty => Ok((Vec::new(), None)),
            Self::Bytes(bytes) => Ok((bytes, None)),
            Self::Text(text) => Ok((text.into_bytes(), Some("text/plain; charset=utf-8"))),
            Self::Json(value) => Ok((serde_json::to_vec(&value)?, Some("application/json"))),
            Self::Form(pairs) => {
                let encoded = pairs
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}={}",
                            url::form_urlencoded::byte_serialize(k.as_bytes()).collect::<String>(),
                            url::form_urlencoded::byte_serialize(v.as_bytes()).collect::<String>(),
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("&");
                Ok((
                    encoded.into_bytes(),
                    Some("application/x-www-form-urlencoded"),
                ))
            }
        }
    }
}

/// A serializable outbound request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub uri: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TunnelRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: method.into().trim().to_uppercase(),
            ..Self::default()
        }
    }

    /// A GET request for a bare URL.
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri)
    }

    /// A POST request carrying the given body.
    pub fn post(uri: impl Into<String>, body: Body) -> Result<Self, TunnelError> {
        Self::new("POST", uri).with_body(body)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a body, setting the implied `Content-Type` unless the caller
    /// already provided one.
    pub fn with_body(mut self, body: Body) -> Result<Self, TunnelError> {
        let (bytes, content_type) = body.into_bytes()?;
        self.body = bytes;
        if let Some(ct) = content_type {
            let has_content_type = self
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-type"));
            if !has_content_type {
                self.headers.insert("content-type".to_string(), ct.to_string());
            }
        }
        Ok(self)
    }
}

/// The polymorphic input to `dispatch`: a bare URL or a structured request.
#[derive(Debug, Clone)]
pub enum Resource {
    /// A bare target URL, fetched with GET and no body.
    Url(String),
    Request(TunnelRequest),
}

impl Resource {
    /// The target URL this resource points at.
    pub fn target(&self) -> &str {
        match self {
            Self::Url(url) => url,
            Self::Request(req) => &req.uri,
        }
    }

    /// Normalize into a full request.
    pub fn into_request(self) -> TunnelRequest {
        match self {
            Self::Url(url) => TunnelRequest::get(url),
            Self::Request(req) => req,
        }
    }
}

impl From<&str> for Resource {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for Resource {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<TunnelRequest> for Resource {
    fn from(req: TunnelRequest) -> Self {
        Self::Request(req)
    }
}
