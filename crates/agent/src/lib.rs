//! `autonom-agent` library crate.
//!
//! Re-exports internal modules for integration testing. The binary
//! entrypoint lives in `main.rs`.

pub mod config;
pub mod executor;
pub mod poller;
pub mod processor;
pub mod publisher;
pub mod reconnect;
pub mod runner;
pub mod shutdown;
pub mod transport;
