//! An embeddable WebSocket communication core.
//!
//! The crate provides both sides of a bidirectional byte-message channel:
//! a [`server::Server`] that accepts and multiplexes many concurrent
//! sessions behind one port, and a [`client::Client`] that drives a single
//! outbound connection. Both run over plain TCP or over TLS with the same
//! framing and lifecycle semantics, and both expose a synchronous facade
//! backed by their own runtime.

pub mod client;
pub mod config;
pub mod queue;
pub mod server;
pub mod tls;

mod registry;
mod session;
mod stream;
