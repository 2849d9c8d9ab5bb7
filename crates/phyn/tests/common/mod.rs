//! Common test utilities for the phyn integration
//!
//! A scripted stand-in for the cloud API plus an isolated host with entry
//! storage, flows, services and registries in a temporary config dir.

#![allow(dead_code)]

mod fake_api;
mod test_hass;

pub use fake_api::*;
pub use test_hass::*;

/// Route `tracing` output through the test harness; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
