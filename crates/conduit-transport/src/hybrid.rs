//! Transport selection: persistent first, stateless as the fallback.

use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState};
use crate::http::StatelessClient;
use async_trait::async_trait;
use conduit_core::{AgentIdentity, ConduitError, ConduitResult};
use conduit_resilience::deadline::budget;
use conduit_resilience::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, Deadline, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Which transport carried (or tried to carry) a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// The WebSocket link.
    Persistent,
    /// HTTP request/response.
    Stateless,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Persistent => write!(f, "persistent"),
            TransportKind::Stateless => write!(f, "stateless"),
        }
    }
}

/// A successful capability call.
#[derive(Debug, Clone, Serialize)]
pub struct Invocation {
    /// Agent that answered.
    pub agent: String,
    /// Capability that was invoked.
    pub capability: String,
    /// The agent's reply.
    pub payload: Value,
    /// Transport that carried the successful call.
    pub transport: TransportKind,
    /// Transports tried, in order.
    pub attempted: Vec<TransportKind>,
    /// The stateless fallback served a call for an agent that has a persistent address.
    pub degraded: bool,
    /// Wall time across every attempt.
    pub elapsed_ms: u64,
}

/// A failed capability call, with every transport that was tried.
#[derive(Debug, thiserror::Error)]
#[error("{agent}/{capability} failed: {error}")]
pub struct InvocationFailure {
    /// Agent that was called.
    pub agent: String,
    /// Capability that was invoked.
    pub capability: String,
    /// Transports tried, in order. Empty when the call was refused up front.
    pub attempted: Vec<TransportKind>,
    /// The last error seen.
    #[source]
    pub error: ConduitError,
}

/// Invokes agent capabilities. The orchestrator depends only on this seam.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Call `capability` on `agent` within an optional deadline.
    async fn invoke(
        &self,
        agent: &str,
        capability: &str,
        payload: Value,
        deadline: Option<Deadline>,
    ) -> Result<Invocation, InvocationFailure>;
}

/// Retry, breaker and connection settings shared by every agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Retries on the persistent path, kept short so fallback stays fast.
    #[serde(default = "RetryPolicy::low_latency")]
    pub persistent_retry: RetryPolicy,
    /// Retries on the stateless path.
    #[serde(default = "RetryPolicy::resilient")]
    pub stateless_retry: RetryPolicy,
    /// Applied to the `<agent>:persistent` and `<agent>:stateless` breakers.
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    /// Settings for every persistent connection.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Per-attempt timeout, further capped by the caller's deadline. Must not
    /// exceed `breaker.call_timeout_ms`, which bounds every attempt too.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            persistent_retry: RetryPolicy::low_latency(),
            stateless_retry: RetryPolicy::resilient(),
            breaker: CircuitBreakerConfig::default(),
            connection: ConnectionConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

struct AgentRoute {
    identity: AgentIdentity,
    connection: Option<Arc<ConnectionManager>>,
    persistent_breaker: Arc<CircuitBreaker>,
    stateless_breaker: Arc<CircuitBreaker>,
}

/// Routes each call over the persistent transport when it is up, falling
/// back to the stateless one when it is not.
pub struct HybridTransportAdapter {
    routes: HashMap<String, AgentRoute>,
    config: TransportConfig,
    http: StatelessClient,
    breakers: Arc<BreakerRegistry>,
}

impl HybridTransportAdapter {
    /// Validate `agents` and build one route (breakers, optional connection) per agent.
    pub fn new(
        agents: Vec<AgentIdentity>,
        config: TransportConfig,
        breakers: Arc<BreakerRegistry>,
    ) -> ConduitResult<Self> {
        let mut routes = HashMap::with_capacity(agents.len());
        for identity in agents {
            identity.validate()?;
            let name = identity.name.clone();
            let connection = match identity.ws_url {
                Some(_) => Some(ConnectionManager::new(
                    identity.clone(),
                    config.connection.clone(),
                    breakers.get_or_create(&format!("{name}:reconnect"), &config.connection.breaker),
                )?),
                None => None,
            };
            let route = AgentRoute {
                persistent_breaker: breakers
                    .get_or_create(&format!("{name}:persistent"), &config.breaker),
                stateless_breaker: breakers.get_or_create(&format!("{name}:stateless"), &config.breaker),
                identity,
                connection,
            };
            if routes.insert(name.clone(), route).is_some() {
                return Err(ConduitError::Config(format!("duplicate agent '{name}'")));
            }
        }

        Ok(Self {
            routes,
            config,
            http: StatelessClient::new()?,
            breakers,
        })
    }

    /// Start background connects for every agent with a persistent address.
    pub fn start(&self) {
        for conn in self.connections() {
            conn.start();
        }
    }

    /// Disconnect every persistent transport.
    pub async fn shutdown(&self) {
        for conn in self.connections() {
            conn.disconnect().await;
        }
    }

    /// The persistent connection for `agent`, if it has one.
    pub fn connection(&self, agent: &str) -> Option<Arc<ConnectionManager>> {
        self.routes.get(agent).and_then(|r| r.connection.clone())
    }

    /// Connection snapshots sorted by agent name.
    pub fn connection_states(&self) -> Vec<ConnectionState> {
        let mut states: Vec<_> = self.connections().map(|c| c.state()).collect();
        states.sort_by(|a, b| a.agent.cmp(&b.agent));
        states
    }

    /// Configured agents sorted by name.
    pub fn agents(&self) -> Vec<&AgentIdentity> {
        let mut agents: Vec<_> = self.routes.values().map(|r| &r.identity).collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// The registry holding every breaker this adapter uses.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    fn connections(&self) -> impl Iterator<Item = &Arc<ConnectionManager>> {
        self.routes.values().filter_map(|r| r.connection.as_ref())
    }

    async fn invoke_persistent(
        &self,
        route: &AgentRoute,
        conn: &Arc<ConnectionManager>,
        capability: &str,
        payload: &Value,
        deadline: Option<Deadline>,
    ) -> ConduitResult<Value> {
        let request_timeout = Duration::from_millis(self.config.request_timeout_ms);
        self.config
            .persistent_retry
            .run(
                move || {
                    let breaker = route.persistent_breaker.clone();
                    let conn = conn.clone();
                    let capability = capability.to_string();
                    let payload = payload.clone();
                    let timeout = budget(deadline, request_timeout);
                    async move {
                        breaker
                            .call_within(deadline, move || async move {
                                conn.request(&capability, payload, Some(timeout)).await
                            })
                            .await
                    }
                },
                deadline,
            )
            .await
    }

    async fn invoke_stateless(
        &self,
        route: &AgentRoute,
        capability: &str,
        payload: &Value,
        deadline: Option<Deadline>,
    ) -> ConduitResult<Value> {
        let request_timeout = Duration::from_millis(self.config.request_timeout_ms);
        self.config
            .stateless_retry
            .run(
                move || {
                    let breaker = route.stateless_breaker.clone();
                    let timeout = budget(deadline, request_timeout);
                    async move {
                        breaker
                            .call_within(deadline, move || {
                                self.http
                                    .invoke(&route.identity, capability, payload, timeout)
                            })
                            .await
                    }
                },
                deadline,
            )
            .await
    }
}

#[async_trait]
impl AgentInvoker for HybridTransportAdapter {
    async fn invoke(
        &self,
        agent: &str,
        capability: &str,
        payload: Value,
        deadline: Option<Deadline>,
    ) -> Result<Invocation, InvocationFailure> {
        let started = Instant::now();
        let fail = |error: ConduitError, attempted: Vec<TransportKind>| InvocationFailure {
            agent: agent.to_string(),
            capability: capability.to_string(),
            attempted,
            error,
        };

        let Some(route) = self.routes.get(agent) else {
            return Err(fail(
                ConduitError::Validation(format!("unknown agent '{agent}'")),
                Vec::new(),
            ));
        };
        if !route.identity.has_capability(capability) {
            return Err(fail(
                ConduitError::Validation(format!(
                    "agent '{agent}' does not offer capability '{capability}'"
                )),
                Vec::new(),
            ));
        }

        let mut attempted = Vec::with_capacity(2);
        if let Some(conn) = route.connection.as_ref().filter(|c| c.is_available()) {
            attempted.push(TransportKind::Persistent);
            match self
                .invoke_persistent(route, conn, capability, &payload, deadline)
                .await
            {
                Ok(reply) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    info!(agent, capability, transport = %TransportKind::Persistent, elapsed_ms, "Capability invoked");
                    return Ok(Invocation {
                        agent: agent.to_string(),
                        capability: capability.to_string(),
                        payload: reply,
                        transport: TransportKind::Persistent,
                        attempted,
                        degraded: false,
                        elapsed_ms,
                    });
                }
                Err(e) if e.is_transport_unavailable() => {
                    warn!(agent, capability, error = %e, "Persistent transport unavailable, falling back");
                }
                Err(e) => return Err(fail(e, attempted)),
            }
        }

        attempted.push(TransportKind::Stateless);
        let degraded = route.connection.is_some();
        match self
            .invoke_stateless(route, capability, &payload, deadline)
            .await
        {
            Ok(reply) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!(agent, capability, transport = %TransportKind::Stateless, degraded, elapsed_ms, "Capability invoked");
                Ok(Invocation {
                    agent: agent.to_string(),
                    capability: capability.to_string(),
                    payload: reply,
                    transport: TransportKind::Stateless,
                    attempted,
                    degraded,
                    elapsed_ms,
                })
            }
            Err(e) => {
                warn!(agent, capability, error = %e, attempted = ?attempted, "Capability invocation failed");
                Err(fail(e, attempted))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conduit_core::ErrorKind;
    use serde_json::json;

    fn adapter() -> HybridTransportAdapter {
        let agents = vec![
            AgentIdentity::new("nlp", "http://127.0.0.1:9").with_capability("understand_query"),
            AgentIdentity::new("data", "http://127.0.0.1:9")
                .with_ws_url("ws://127.0.0.1:9/ws")
                .with_capability("fetch_data"),
        ];
        HybridTransportAdapter::new(agents, TransportConfig::default(), Arc::new(BreakerRegistry::new()))
            .unwrap()
    }

    #[test]
    fn test_breakers_registered_per_agent() {
        let a = adapter();
        let names: Vec<_> = a.breakers().snapshot_all().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            [
                "data:persistent",
                "data:reconnect",
                "data:stateless",
                "nlp:persistent",
                "nlp:stateless"
            ]
        );
        assert!(a.connection("data").is_some());
        assert!(a.connection("nlp").is_none());
        assert_eq!(a.connection_states().len(), 1);
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let agents = vec![
            AgentIdentity::new("nlp", "http://a").with_capability("x"),
            AgentIdentity::new("nlp", "http://b").with_capability("y"),
        ];
        let result =
            HybridTransportAdapter::new(agents, TransportConfig::default(), Arc::new(BreakerRegistry::new()));
        assert!(matches!(result, Err(ConduitError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_agent_and_capability() {
        let a = adapter();
        let err = a.invoke("ghost", "fetch_data", json!({}), None).await.unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Validation);
        assert!(err.attempted.is_empty());

        let err = a.invoke("nlp", "fetch_data", json!({}), None).await.unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Validation);
        assert!(err.attempted.is_empty());
    }

    #[test]
    fn test_config_defaults_from_toml_like_json() {
        let cfg: TransportConfig = serde_json::from_str(r#"{"request_timeout_ms": 5000}"#).unwrap();
        assert_eq!(cfg.persistent_retry, RetryPolicy::low_latency());
        assert_eq!(cfg.stateless_retry, RetryPolicy::resilient());
        assert_eq!(cfg.request_timeout_ms, 5_000);
    }

    #[test]
    fn test_default_request_timeout_fits_breaker_call_timeout() {
        let cfg = TransportConfig::default();
        assert!(cfg.request_timeout_ms <= cfg.breaker.call_timeout_ms);
    }
}
