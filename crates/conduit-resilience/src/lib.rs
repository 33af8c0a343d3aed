//! Failure-containment primitives shared by every transport.
//!
//! # Main types
//!
//! - [`CircuitBreaker`] — Three-state breaker that fast-fails calls to an unhealthy agent.
//! - [`BreakerRegistry`] — Named breakers, dumped and reset from the admin surface.
//! - [`RetryPolicy`] — Exponential backoff with jitter, bounded by a [`Deadline`].
//! - [`Deadline`] — Monotonic budget handed down through nested layers.

/// Three-state circuit breaker and registry.
pub mod circuit_breaker;
/// Shrinking time budget.
pub mod deadline;
/// Backoff-based retry execution.
pub mod retry;

pub use circuit_breaker::{
    BreakerRegistry, BreakerSnapshot, BreakerTransition, CircuitBreaker, CircuitBreakerConfig,
    CircuitState,
};
pub use deadline::Deadline;
pub use retry::RetryPolicy;
