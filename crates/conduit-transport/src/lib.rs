//! Agent transports for the Conduit layer.
//!
//! # Main types
//!
//! - [`ConnectionManager`] — Persistent WebSocket link to one agent, with heartbeat and reconnection.
//! - [`StatelessClient`] — HTTP request/response fallback.
//! - [`HybridTransportAdapter`] — Picks a transport per call and records which one served it.
//! - [`AgentInvoker`] — The seam orchestration code depends on.
//! - [`Envelope`] — Wire format of the persistent transport.

/// Persistent connection lifecycle and request correlation.
pub mod connection;
/// Stateless HTTP transport.
pub mod http;
/// Transport selection and fallback.
pub mod hybrid;
/// Persistent-transport wire format.
pub mod protocol;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionPhase, ConnectionState};
pub use http::StatelessClient;
pub use hybrid::{
    AgentInvoker, HybridTransportAdapter, Invocation, InvocationFailure, TransportConfig,
    TransportKind,
};
pub use protocol::{Envelope, MessageKind};
