//! Transport seam between the tunnel engine and the forwarding proxy.
//!
//! The engine never talks HTTP directly; everything crosses the
//! [`ProxyTransport`] trait. Production uses [`HttpTransport`] over
//! `reqwest`; tests substitute the in-memory transport from
//! [`testing`](crate::testing).

use std::collections::HashMap;

use passage_crypto::{Envelope, HandshakeError, InitRequest, InitResponse};

use crate::error::TunnelError;
use crate::request::TunnelRequest;
use crate::response::TunnelResponse;

/// Session header echoed on every tunneled call.
pub const SESSION_HEADER: &str = "x-passage-session";
/// Header naming the backend origin the proxy should relay to.
pub const PROVIDER_HEADER: &str = "x-passage-provider";
/// Marker header distinguishing an intentionally empty body from an absent
/// one once the request is wrapped in an envelope.
pub const EMPTY_BODY_HEADER: &str = "x-empty-body";

/// One tunneled relay call.
#[derive(Debug)]
pub struct RelayCall<'a> {
    /// Provider-assigned session identifier from the handshake.
    pub session_id: &'a str,
    /// Normalized backend origin the proxy relays to.
    pub provider_origin: &'a str,
    /// Sealed request payload.
    pub envelope: &'a Envelope,
    /// Whether the plaintext request body was intentionally empty.
    pub empty_body: bool,
}

/// Carrier for handshake and tunneled traffic toward the forwarding proxy.
pub trait ProxyTransport: Clone + Send + Sync + 'static {
    /// POST the handshake init request to the proxy's initiation endpoint.
    fn init_tunnel(
        &self,
        proxy_url: &str,
        backend_origin: &str,
        request: &InitRequest,
    ) -> impl Future<Output = Result<InitResponse, HandshakeError>> + Send;

    /// Relay one sealed request and return the sealed response.
    fn relay(
        &self,
        proxy_url: &str,
        call: RelayCall<'_>,
    ) -> impl Future<Output = Result<Envelope, TunnelError>> + Send;

    /// Send a request directly to its target, bypassing the tunnel. Used for
    /// URLs that resolve to no registered provider.
    fn forward(
        &self,
        request: &TunnelRequest,
    ) -> impl Future<Output = Result<TunnelResponse, TunnelError>> + Send;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn init_endpoint(proxy_url: &str, backend_origin: &str) -> Result<url::Url, HandshakeError> {
    let mut endpoint = url::Url::parse(proxy_url)
        .and_then(|u| u.join("init-tunnel"))
        .map_err(|e| HandshakeError::MalformedResponse(format!("bad proxy url {proxy_url}: {e}")))?;
    endpoint
        .query_pairs_mut()
        .append_pair("backend_url", backend_origin);
    Ok(endpoint)
}

fn relay_endpoint(proxy_url: &str) -> Result<url::Url, TunnelError> {
    url::Url::parse(proxy_url)
        .and_then(|u| u.join("proxy"))
        .map_err(|e| TunnelError::InvalidUrl(format!("{proxy_url}: {e}")))
}

impl ProxyTransport for HttpTransport {
    async fn init_tunnel(
        &self,
        proxy_url: &str,
        backend_origin: &str,
        request: &InitRequest,
    ) -> Result<InitResponse, HandshakeError> {
        let endpoint = init_endpoint(proxy_url, backend_origin)?;

        let response = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| HandshakeError::NetworkFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HandshakeError::NetworkFailure(format!(
                "initiation endpoint returned {status}"
            )));
        }

        response
            .json::<InitResponse>()
            .await
            .map_err(|e| HandshakeError::MalformedResponse(e.to_string()))
    }

    async fn relay(
        &self,
        proxy_url: &str,
        call: RelayCall<'_>,
    ) -> Result<Envelope, TunnelError> {
        let endpoint = relay_endpoint(proxy_url)?;

        let mut builder = self
            .client
            .post(endpoint)
            .header(SESSION_HEADER, call.session_id)
            .header(PROVIDER_HEADER, call.provider_origin)
            .json(call.envelope);
        if call.empty_body {
            builder = builder.header(EMPTY_BODY_HEADER, "true");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TunnelError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TunnelError::Proxy {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<Envelope>().await.map_err(|e| {
            TunnelError::Serialization(format!("proxy returned invalid envelope: {e}"))
        })?)
    }

    async fn forward(&self, request: &TunnelRequest) -> Result<TunnelResponse, TunnelError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TunnelError::InvalidRequest(format!("bad method {}", request.method)))?;

        let mut builder = self.client.request(method, &request.uri);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TunnelError::Network(e.to_string()))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TunnelError::Network(e.to_string()))?;

        Ok(TunnelResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: body.to_vec(),
        })
    }
}
