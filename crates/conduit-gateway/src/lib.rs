//! HTTP and WebSocket surface of the Conduit layer.
//!
//! # Main types
//!
//! - [`GatewayServer`] — Builds the axum router for queries, progress and operator endpoints.
//! - [`AppState`] — Orchestrator and transport handles shared by every handler.

/// Breaker, connection and cache endpoints.
pub mod admin;
/// Router, health and query endpoints.
pub mod server;
/// Progress event stream over WebSocket.
pub mod stream;

pub use server::{AppState, GatewayServer};
