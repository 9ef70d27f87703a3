//! Passage core library.
//!
//! Shared plumbing for the passage workspace: error types, hierarchical
//! configuration resolution, and tracing initialization. No protocol logic
//! lives here.

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{TunnelConfig, load_config};
pub use error::{Error, Result};
pub use tracing_init::init_tracing;
