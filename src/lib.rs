//! Client SDK for the iolink realtime relay.
//!
//! The crate provides a resilient duplex event channel over a persistent
//! websocket, organized by layer:
//! - `proto`: event tags and the JSON wire envelope.
//! - `state`: connection readiness and the session lifecycle switch.
//! - `config`: session tunables and endpoint defaults.
//! - `socket`: the physical socket seam and its `tokio-tungstenite` backend.
//! - `conn`: the socket-owning connection controller with auto-reconnect.
//! - `relay`: the caller-facing event relay with outbound buffering.

/// Session tunables and endpoint defaults.
pub mod config;
/// Connection controller: socket ownership, lifecycle, reconnect.
pub mod conn;
/// Event tags and the wire envelope.
pub mod proto;
/// Caller-facing event relay: send/buffer/drain, subscriptions, snapshot.
pub mod relay;
/// Physical socket traits and the websocket implementation.
pub mod socket;
/// Connection and lifecycle state types.
pub mod state;
