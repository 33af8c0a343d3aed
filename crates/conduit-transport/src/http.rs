//! Stateless request/response transport: `POST {base_url}/capabilities/{capability}`.

use conduit_core::{AgentErrorBody, AgentIdentity, ConduitError, ConduitResult};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Thin HTTP client mapping agent replies onto [`ConduitError`].
#[derive(Debug, Clone)]
pub struct StatelessClient {
    http: reqwest::Client,
}

impl StatelessClient {
    /// Build the shared client. Fails only if the TLS backend cannot initialize.
    pub fn new() -> ConduitResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("conduit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConduitError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Invoke `capability` on `agent` with a per-call `timeout`.
    pub async fn invoke(
        &self,
        agent: &AgentIdentity,
        capability: &str,
        payload: &Value,
        timeout: Duration,
    ) -> ConduitResult<Value> {
        let url = agent.capability_url(capability);
        debug!(agent = %agent.name, url = %url, "Stateless invocation");

        let response = self
            .http
            .post(&url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_send_error(&agent.name, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_send_error(&agent.name, e))?;
        let body: Option<Value> = serde_json::from_str(&text).ok();

        interpret(&agent.name, status, body)
    }
}

fn map_send_error(agent: &str, e: reqwest::Error) -> ConduitError {
    if e.is_timeout() {
        ConduitError::Timeout(format!("'{agent}' did not answer in time: {e}"))
    } else {
        ConduitError::Connection(format!("'{agent}' unreachable: {e}"))
    }
}

/// Map a status and (possibly undecodable) body onto the error taxonomy.
fn interpret(agent: &str, status: StatusCode, body: Option<Value>) -> ConduitResult<Value> {
    let agent_error = body.as_ref().and_then(AgentErrorBody::extract);

    if status.is_success() {
        if let Some(err) = agent_error {
            return Err(ConduitError::from_agent_body(err));
        }
        return body.ok_or_else(|| {
            ConduitError::Validation(format!("'{agent}' returned an undecodable body"))
        });
    }

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Err(ConduitError::Timeout(
            format!("'{agent}' responded {status}"),
        )),
        StatusCode::TOO_MANY_REQUESTS => Err(ConduitError::Connection(format!(
            "'{agent}' is throttling: {status}"
        ))),
        s if s.is_server_error() => Err(ConduitError::Connection(format!(
            "'{agent}' responded {status}{}",
            agent_error
                .map(|e| format!(": {}", e.message))
                .unwrap_or_default()
        ))),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => match agent_error {
            Some(err) => Err(ConduitError::from_agent_body(err)),
            None => Err(ConduitError::Validation(format!(
                "'{agent}' rejected the payload: {status}"
            ))),
        },
        _ => match agent_error {
            Some(err) => Err(ConduitError::from_agent_body(err)),
            None => Err(ConduitError::Agent {
                error_type: "http_error".into(),
                message: format!("'{agent}' responded {status}"),
            }),
        },
    }
}
