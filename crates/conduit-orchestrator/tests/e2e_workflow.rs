#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end workflows through the real hybrid transport: wiremock agents
//! for the stateless path and a tokio-tungstenite agent for the persistent one.

use conduit_cache::{CacheConfig, SemanticCache};
use conduit_core::{AgentIdentity, ConduitError, ErrorKind};
use conduit_orchestrator::{
    Orchestrator, PipelineConfig, ProgressEvent, ProgressReporter, WorkflowStage,
};
use conduit_resilience::{BreakerRegistry, CircuitBreakerConfig, CircuitState, RetryPolicy};
use conduit_transport::{
    ConnectionConfig, Envelope, HybridTransportAdapter, MessageKind, TransportConfig,
    TransportKind,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Persistent agent that acknowledges the handshake and answers every request with a chart.
async fn spawn_chart_agent() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(Message::Text(text))) = ws.next().await {
                    let env = Envelope::from_text(&text).unwrap();
                    let reply = match env.kind() {
                        MessageKind::Handshake => Envelope::acknowledged(env.correlation_id),
                        MessageKind::Heartbeat => Envelope::heartbeat_response(env.correlation_id),
                        MessageKind::Request(_) => {
                            Envelope::response_to(&env, json!({"chart": {"mark": "line"}}))
                        }
                        _ => continue,
                    };
                    if ws.send(Message::Text(reply.to_text().unwrap())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    format!("ws://{addr}/ws")
}

async fn mount_ok(server: &MockServer, capability: &str, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path(format!("/capabilities/{capability}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn transport_config() -> TransportConfig {
    TransportConfig {
        persistent_retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 20,
        },
        stateless_retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 50,
        },
        breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            call_timeout_ms: 2_000,
        },
        connection: ConnectionConfig {
            connect_timeout_ms: 1_000,
            handshake_timeout_ms: 1_000,
            request_timeout_ms: 2_000,
            heartbeat_interval_ms: 60_000,
            ..ConnectionConfig::default()
        },
        request_timeout_ms: 2_000,
    }
}

fn orchestrator(adapter: Arc<HybridTransportAdapter>) -> Orchestrator {
    Orchestrator::new(
        adapter,
        Arc::new(SemanticCache::new(CacheConfig::default())),
        Arc::new(ProgressReporter::new(64)),
        PipelineConfig::default(),
    )
}

fn labels_for(events: &[ProgressEvent], stage: WorkflowStage) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.stage == stage)
        .map(ProgressEvent::label)
        .collect()
}

fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_transient_data_failures_are_invisible_to_the_workflow() {
    let server = MockServer::start().await;
    mount_ok(&server, "understand_query", json!({"intent": "trend", "metric": "sales"})).await;
    Mock::given(method("POST"))
        .and(path("/capabilities/fetch_data"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_ok(
        &server,
        "fetch_data",
        json!({"columns": ["month", "sales"], "rows": [["jan", 3], ["feb", 5]]}),
    )
    .await;
    mount_ok(&server, "render_chart", json!({"chart": {"mark": "line"}, "chart_type": "line"})).await;

    let agents = vec![
        AgentIdentity::new("nlp", server.uri()).with_capability("understand_query"),
        AgentIdentity::new("data", server.uri()).with_capability("fetch_data"),
        AgentIdentity::new("viz", server.uri()).with_capability("render_chart"),
    ];
    let registry = Arc::new(BreakerRegistry::new());
    let adapter =
        Arc::new(HybridTransportAdapter::new(agents, transport_config(), registry.clone()).unwrap());
    let orch = orchestrator(adapter);
    let mut rx = orch.progress().subscribe();

    let outcome = orch.run("monthly sales trend").await;

    assert!(outcome.is_complete(), "{:?}", outcome.failure);
    assert_eq!(outcome.results.len(), 3);
    let data = outcome.result(WorkflowStage::Retrieving).unwrap();
    assert_eq!(data.output["rows"][1][1], 5);
    assert_eq!(data.transport, Some(TransportKind::Stateless));

    let events = drain(&mut rx);
    assert_eq!(
        labels_for(&events, WorkflowStage::Retrieving),
        ["retrieving:started", "retrieving:completed"]
    );
    assert_eq!(events.last().unwrap().label(), "done:completed");

    let breaker = registry.get("data:stateless").unwrap().snapshot();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.total_failures, 2);
    assert_eq!(breaker.consecutive_failures, 0);
}

#[tokio::test]
async fn test_visualization_failure_keeps_retrieved_data() {
    let server = MockServer::start().await;
    mount_ok(&server, "understand_query", json!({"intent": "breakdown"})).await;
    mount_ok(&server, "fetch_data", json!({"columns": ["region"], "rows": [["north"]]})).await;
    Mock::given(method("POST"))
        .and(path("/capabilities/render_chart"))
        .respond_with(ResponseTemplate::new(422).set_body_json(
            json!({"error_type": "validation", "message": "cannot chart a single column"}),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let viz_ws = spawn_chart_agent().await;
    let agents = vec![
        AgentIdentity::new("nlp", server.uri()).with_capability("understand_query"),
        AgentIdentity::new("data", server.uri()).with_capability("fetch_data"),
        AgentIdentity::new("viz", server.uri())
            .with_ws_url(&viz_ws)
            .with_capability("render_chart"),
    ];
    let registry = Arc::new(BreakerRegistry::new());
    let adapter =
        Arc::new(HybridTransportAdapter::new(agents, transport_config(), registry.clone()).unwrap());
    adapter.connection("viz").unwrap().connect().await.unwrap();

    let persistent = registry.get("viz:persistent").unwrap();
    for _ in 0..5 {
        let _ = persistent
            .call(|| async { Err::<(), _>(ConduitError::Connection("forced".into())) })
            .await;
    }
    assert_eq!(persistent.state(), CircuitState::Open);

    let orch = orchestrator(adapter.clone());
    let mut rx = orch.progress().subscribe();
    let outcome = orch.run("sales by region").await;

    assert_eq!(outcome.status, WorkflowStage::Failed);
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(
        outcome.deepest().unwrap().output["rows"][0][0],
        "north"
    );
    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.stage, WorkflowStage::Visualizing);
    assert_eq!(failure.error_type, ErrorKind::Validation);
    assert_eq!(
        failure.transports,
        vec![TransportKind::Persistent, TransportKind::Stateless]
    );

    let events = drain(&mut rx);
    assert_eq!(
        labels_for(&events, WorkflowStage::Visualizing),
        ["visualizing:started", "visualizing:failed"]
    );
    assert_eq!(events.last().unwrap().detail["error_type"], "validation");

    adapter.shutdown().await;
}
