//! End-to-end tunnel scenarios over the in-memory transport.
//!
//! These run the real client, handshake, and AEAD codec; only the HTTP hop
//! is replaced.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use passage_core::TunnelConfig;
use passage_crypto::{CryptoError, ExpectedPeer, HandshakeError};
use passage_tunnel::testing::InMemoryTransport;
use passage_tunnel::{
    Body, ProviderId, ServiceProvider, SessionStatus, TunnelClient, TunnelError, TunnelRequest,
    TunnelResponse,
};

const BACKEND: &str = "https://backend.example";

fn backend_transport() -> InMemoryTransport {
    InMemoryTransport::new("backend.example", |request| {
        match (request.method.as_str(), request.uri.as_str()) {
            ("POST", "https://backend.example/login") => {
                let creds: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
                if creds["username"] == "tester" {
                    json_response(200, serde_json::json!({"token": "session-token-1"}))
                } else {
                    json_response(401, serde_json::json!({"error": "bad credentials"}))
                }
            }
            ("GET", "https://backend.example/profile") => {
                json_response(200, serde_json::json!({"name": "tester"}))
            }
            ("GET", "https://backend.example/broken") => {
                json_response(500, serde_json::json!({"error": "internal"}))
            }
            _ => json_response(404, serde_json::json!({"error": "not found"})),
        }
    })
}

fn json_response(status: u16, body: serde_json::Value) -> TunnelResponse {
    TunnelResponse {
        status,
        status_text: String::new(),
        headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
        body: serde_json::to_vec(&body).unwrap(),
    }
}

fn client_for(
    transport: &InMemoryTransport,
    config: TunnelConfig,
) -> (TunnelClient<InMemoryTransport>, ProviderId) {
    let client = TunnelClient::with_transport(config, transport.clone());
    let id = client
        .register_provider(ServiceProvider::new(BACKEND, transport.expected_peer()))
        .unwrap();
    (client, id)
}

#[tokio::test]
async fn login_roundtrip_is_tunneled() {
    let transport = backend_transport();
    let (client, id) = client_for(&transport, TunnelConfig::default());
    assert_eq!(client.session_status(id), SessionStatus::Absent);

    let request = TunnelRequest::post(
        format!("{BACKEND}/login"),
        Body::Json(serde_json::json!({"username": "tester", "password": "hunter2"})),
    )
    .unwrap();
    let response = client.dispatch(request).await.unwrap();

    assert!(response.is_ok());
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["token"], "session-token-1");

    // One handshake, one relay, nothing in the clear.
    assert_eq!(transport.init_calls(), 1);
    assert_eq!(transport.relay_calls(), 1);
    assert_eq!(transport.forward_calls(), 0);
    assert_eq!(client.session_status(id), SessionStatus::Valid);
}

#[tokio::test]
async fn session_is_reused_across_dispatches() {
    let transport = backend_transport();
    let (client, _) = client_for(&transport, TunnelConfig::default());

    for _ in 0..3 {
        let response = client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
        assert!(response.is_ok());
    }
    assert_eq!(transport.init_calls(), 1);
    assert_eq!(transport.relay_calls(), 3);
}

#[tokio::test]
async fn unregistered_origin_passes_through() {
    let transport = backend_transport();
    let (client, _) = client_for(&transport, TunnelConfig::default());

    assert!(client.is_tunneled(&format!("{BACKEND}/x")));
    assert!(!client.is_tunneled("https://elsewhere.example/x"));

    let response = client
        .dispatch("https://elsewhere.example/anything")
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(transport.init_calls(), 0);
    assert_eq!(transport.relay_calls(), 0);
    assert_eq!(transport.forward_calls(), 1);
}

#[tokio::test]
async fn backend_error_status_is_a_normal_response() {
    let transport = backend_transport();
    let (client, _) = client_for(&transport, TunnelConfig::default());

    let response = client.dispatch(format!("{BACKEND}/broken")).await.unwrap();
    assert_eq!(response.status, 500);
    assert!(!response.is_ok());
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["error"], "internal");
}

#[tokio::test]
async fn corrupted_response_invalidates_session() {
    let transport = backend_transport();
    let (client, id) = client_for(&transport, TunnelConfig::default());

    // Prime a session, then corrupt the next relay.
    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    transport.corrupt_next_relay();

    let err = client
        .dispatch(format!("{BACKEND}/profile"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TunnelError::Channel(CryptoError::AuthenticationFailed)
    ));
    assert!(err.is_retryable());
    assert_eq!(client.session_status(id), SessionStatus::Absent);

    // Next dispatch handshakes afresh and succeeds.
    let response = client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    assert!(response.is_ok());
    assert_eq!(transport.init_calls(), 2);
}

#[tokio::test]
async fn dispatch_with_retry_recovers_from_corruption() {
    let transport = backend_transport();
    let (client, _) = client_for(&transport, TunnelConfig::default());

    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    transport.corrupt_next_relay();

    let response = client
        .dispatch_with_retry(format!("{BACKEND}/profile"))
        .await
        .unwrap();
    assert!(response.is_ok());
    // Failed attempt plus the re-handshaked retry.
    assert_eq!(transport.init_calls(), 2);
    assert_eq!(transport.relay_calls(), 3);
}

#[tokio::test]
async fn dispatch_with_retry_recovers_from_handshake_network_failure() {
    let transport = backend_transport();
    let (client, _) = client_for(&transport, TunnelConfig::default());
    transport.fail_next_init();

    let response = client
        .dispatch_with_retry(format!("{BACKEND}/profile"))
        .await
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(transport.init_calls(), 2);
}

#[tokio::test]
async fn wrong_pinned_key_is_untrusted_and_final() {
    let transport = backend_transport();
    let client = TunnelClient::with_transport(TunnelConfig::default(), transport.clone());
    client
        .register_provider(ServiceProvider::new(
            BACKEND,
            ExpectedPeer {
                provider_id: "backend.example".to_string(),
                static_public_key: [0x42u8; 32],
            },
        ))
        .unwrap();

    let err = client
        .dispatch(format!("{BACKEND}/profile"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TunnelError::Handshake(HandshakeError::UntrustedPeer)
    ));
    assert!(!err.is_retryable());
    assert_eq!(transport.relay_calls(), 0);
}

#[tokio::test]
async fn concurrent_dispatches_share_one_handshake() {
    let transport = backend_transport();
    transport.set_init_delay(Duration::from_millis(30));
    let (client, _) = client_for(&transport, TunnelConfig::default());
    let client = Arc::new(client);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client.dispatch(format!("{BACKEND}/profile")).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_ok());
    }
    assert_eq!(transport.init_calls(), 1);
    assert_eq!(transport.relay_calls(), 8);
}

#[tokio::test]
async fn zero_ttl_forces_rehandshake_per_dispatch() {
    let transport = backend_transport();
    let config = TunnelConfig {
        session_ttl_secs: Some(0),
        ..TunnelConfig::default()
    };
    let (client, id) = client_for(&transport, config);

    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    assert_eq!(client.session_status(id), SessionStatus::Expired);
    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    assert_eq!(transport.init_calls(), 2);
}

#[tokio::test]
async fn init_tunnel_prewarms_the_session() {
    let transport = backend_transport();
    let (client, id) = client_for(&transport, TunnelConfig::default());

    client.init_tunnel(id).await.unwrap();
    assert_eq!(client.session_status(id), SessionStatus::Valid);
    assert_eq!(transport.init_calls(), 1);

    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    assert_eq!(transport.init_calls(), 1);
}

#[tokio::test]
async fn nonce_exhaustion_invalidates_session() {
    let transport = backend_transport();
    let (client, id) = client_for(&transport, TunnelConfig::default());

    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    client.session(id).unwrap().exhaust_nonces();

    // Sealing fails before anything reaches the proxy; the worn-out
    // session is dropped.
    let err = client
        .dispatch(format!("{BACKEND}/profile"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TunnelError::Channel(CryptoError::NonceExhausted)
    ));
    assert!(err.is_retryable());
    assert_eq!(client.session_status(id), SessionStatus::Absent);
    assert_eq!(transport.relay_calls(), 1);

    // The next dispatch handshakes afresh under a new key.
    let response = client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    assert!(response.is_ok());
    assert_eq!(transport.init_calls(), 2);
    assert_eq!(transport.relay_calls(), 2);
}

#[tokio::test]
async fn invalidate_forces_fresh_handshake() {
    let transport = backend_transport();
    let (client, id) = client_for(&transport, TunnelConfig::default());

    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    client.invalidate(id);
    assert_eq!(client.session_status(id), SessionStatus::Absent);

    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    assert_eq!(transport.init_calls(), 2);
}

#[tokio::test]
async fn empty_body_marker_rides_the_relay() {
    let transport = backend_transport();
    let (client, _) = client_for(&transport, TunnelConfig::default());

    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    assert!(transport.saw_empty_body_marker());
}

#[tokio::test]
async fn snapshots_survive_a_client_restart() {
    let transport = backend_transport();
    let (client, id) = client_for(&transport, TunnelConfig::default());

    client.dispatch(format!("{BACKEND}/profile")).await.unwrap();
    assert_eq!(client.session_status(id), SessionStatus::Valid);
    let snapshots = client.export_snapshots();
    assert!(snapshots.get(BACKEND).is_some());

    // "Restart": a fresh client over the same transport hydrates the
    // exported session and talks without a second handshake.
    let (restarted, restarted_id) = client_for(&transport, TunnelConfig::default());
    assert_eq!(restarted.hydrate_snapshots(&snapshots), 1);
    assert_eq!(restarted.session_status(restarted_id), SessionStatus::Valid);

    let response = restarted
        .dispatch(format!("{BACKEND}/profile"))
        .await
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(transport.init_calls(), 1);
}

#[tokio::test]
async fn abandoned_dispatch_still_completes_the_handshake() {
    let transport = backend_transport();
    transport.set_init_delay(Duration::from_millis(50));
    let (client, id) = client_for(&transport, TunnelConfig::default());
    let client = Arc::new(client);

    let attempt = tokio::time::timeout(
        Duration::from_millis(10),
        client.dispatch(format!("{BACKEND}/profile")),
    )
    .await;
    assert!(attempt.is_err(), "dispatch should have been abandoned");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.session_status(id), SessionStatus::Valid);
    assert_eq!(transport.init_calls(), 1);
}
