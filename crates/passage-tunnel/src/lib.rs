//! Passage tunnel client.
//!
//! End-to-end encrypted request tunneling through an untrusted forwarding
//! proxy. Register the backends to protect, then route traffic through
//! [`TunnelClient::dispatch`]: requests whose origin matches a registered
//! provider are sealed under a handshake-derived session key and relayed;
//! everything else passes through untouched.
//!
//! ```no_run
//! use passage_core::TunnelConfig;
//! use passage_crypto::ExpectedPeer;
//! use passage_tunnel::{ServiceProvider, TunnelClient};
//!
//! # async fn run(pinned_key: [u8; 32]) -> Result<(), passage_tunnel::TunnelError> {
//! let client = TunnelClient::new(TunnelConfig::default());
//! client.register_provider(ServiceProvider::new(
//!     "https://backend.example",
//!     ExpectedPeer {
//!         provider_id: "backend.example".to_string(),
//!         static_public_key: pinned_key,
//!     },
//! ))?;
//!
//! let response = client.dispatch("https://backend.example/profile").await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod provider;
pub mod request;
pub mod response;
pub mod snapshot;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

pub use client::TunnelClient;
pub use error::TunnelError;
pub use provider::{ProviderId, ProviderRegistry, ServiceProvider};
pub use request::{Body, Resource, TunnelRequest};
pub use response::TunnelResponse;
pub use snapshot::{SessionSnapshot, SnapshotStore};
pub use store::{SessionStatus, SessionStore, TunnelSession};
pub use transport::{HttpTransport, ProxyTransport, RelayCall};
