//! # Observability & Tracing
//!
//! The bridge logs through `tracing` with structured fields, so a single
//! subscriber set up here covers the bus, the runtime and the bridge core.
//!
//! ## What Gets Traced
//!
//! - **Registration lifecycle**: `Registered`, `Unregistered`, `Released` at
//!   `info` with `path` and `owner`.
//! - **Dispatch**: every delivery at `debug` with `path`, `owner` and the message.
//! - **Calls**: `Call issued` / `Reply delivered` at `debug` with `token`.
//! - **Dropped deliveries**: dead owners and abandoned calls at `debug`.
//! - **Broken invariants**: a re-entrant callback at `error`.
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=info cargo run --bin ebus-demo
//! RUST_LOG=ebus_bridge::bridge=debug cargo run --bin ebus-demo
//! RUST_LOG=trace cargo run --bin ebus-demo   # includes every send
//! ```

/// Installs the global subscriber. Filtering comes from `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}
