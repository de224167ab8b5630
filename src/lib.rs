//! # ebus-bridge
//!
//! > **Bus objects as actor processes.**
//!
//! This crate connects a message bus (objects, method calls, signals, pending
//! call replies) to an actor-style runtime where processes only talk through
//! mailboxes. A process registers an object path and from then on receives
//! calls and signals as ordinary mailbox messages; it issues calls without
//! blocking and gets the reply later as another mailbox message.
//!
//! ## 🏗️ Design
//!
//! Two concurrency models meet here. The bus side is a single-threaded,
//! callback-driven dispatch loop per connection. The runtime side is a set of
//! independently scheduled processes that may die at any time. The bridge
//! sits between them and keeps three promises:
//!
//! - **Order**: messages for one object path reach the owner's mailbox in the
//!   order the connection saw them.
//! - **No dead deliveries**: nothing is enqueued for a process that has
//!   terminated.
//! - **No leaks**: when a process dies, or the connection closes, every
//!   bus-side registration made for it is removed and every runtime resource
//!   handle is released.
//!
//! ## 🗺️ Module Tour
//!
//! ### 1. The Boundaries ([`bus`], [`process`], [`codec`])
//! What the bridge consumes, expressed as traits.
//! - [`Connection`](bus::Connection): one open bus connection. [`MemoryBus`](bus::MemoryBus)
//!   is an in-process implementation with a real dispatch task.
//! - [`ProcessRuntime`](process::ProcessRuntime): mailbox send, liveness, death
//!   notification, resource handles. [`LocalRuntime`](process::LocalRuntime)
//!   implements it on Tokio.
//! - [`Codec`](codec::Codec): bus [`Value`](bus::Value)s to runtime
//!   [`Term`](process::Term)s and back.
//!
//! ### 2. The Core ([`bridge`])
//! - [`Bridge`](bridge::Bridge): register, unregister, lookup, call, reply,
//!   signals, subscriptions, close.
//! - [`BridgeResource`](bridge::BridgeResource): one registration, owned by
//!   exactly one process.
//!
//! ### 3. The Runtime Side ([`server`], [`client`])
//! - [`ObjectServer`](server::ObjectServer) runs a [`BusObject`](server::BusObject)
//!   from its mailbox and answers calls automatically.
//! - [`BusClient`](client::BusClient) issues a call and awaits its reply.
//!
//! ### 4. Ambient ([`lifecycle`], [`error`], [`mock`])
//! - [`BridgeConfig`](lifecycle::BridgeConfig) and [`setup_tracing`](lifecycle::setup_tracing).
//! - [`BridgeError`](error::BridgeError), the errors returned to callers.
//! - [`MockConnection`](mock::MockConnection) for driving the bridge step by
//!   step in tests.
//!
//! ## 🚀 Quick Start
//!
//! ```bash
//! RUST_LOG=info cargo run --bin ebus-demo
//! cargo test
//! ```

pub mod bridge;
pub mod bus;
pub mod client;
pub mod codec;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod process;
pub mod server;

pub use bridge::{Bridge, BridgeResource, OutgoingCall};
pub use error::BridgeError;
