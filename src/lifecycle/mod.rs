//! # Lifecycle: Configuration & Observability
//!
//! The ambient pieces every bridge deployment needs before the first object
//! is registered:
//!
//! - [`BridgeConfig`]: call timeout and codec limits, from defaults,
//!   a deserialized config section or the environment.
//! - [`setup_tracing`]: the `tracing` subscriber, filtered by `RUST_LOG`.
//!
//! Orchestration itself (creating connections, spawning processes, shutting
//! down) is done by the application; see the `ebus-demo` binary.

pub mod config;
pub mod tracing;

pub use config::BridgeConfig;
pub use tracing::setup_tracing;
