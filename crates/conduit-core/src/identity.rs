use crate::{ConduitError, ConduitResult};
use serde::{Deserialize, Serialize};

/// An independently deployed agent reachable through the capability contract.
///
/// Loaded once from configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Unique agent name, e.g. `"data"`.
    pub name: String,
    /// Base address for the stateless request/response transport.
    pub base_url: String,
    /// Address of the persistent WebSocket transport, if the agent offers one.
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Named capabilities this agent exposes.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentIdentity {
    /// An HTTP-only agent. Add capabilities and a persistent address with the builders.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            ws_url: None,
            capabilities: Vec::new(),
        }
    }

    /// Set the persistent (WebSocket) address.
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    /// Declare one more capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Whether `capability` was declared.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Check names and addresses before the identity is put into service.
    pub fn validate(&self) -> ConduitResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConduitError::Config("agent name must not be empty".into()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConduitError::Config(format!(
                "agent '{}': base_url must be http(s), got '{}'",
                self.name, self.base_url
            )));
        }
        if let Some(ws) = &self.ws_url {
            if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
                return Err(ConduitError::Config(format!(
                    "agent '{}': ws_url must be ws(s), got '{ws}'",
                    self.name
                )));
            }
        }
        if self.capabilities.is_empty() {
            return Err(ConduitError::Config(format!(
                "agent '{}' declares no capabilities",
                self.name
            )));
        }
        if let Some(bad) = self
            .capabilities
            .iter()
            .find(|c| c.is_empty() || c.contains('/') || c.contains(char::is_whitespace))
        {
            return Err(ConduitError::Config(format!(
                "agent '{}': invalid capability name '{bad}'",
                self.name
            )));
        }
        Ok(())
    }

    /// URL of the stateless endpoint for a capability.
    pub fn capability_url(&self, capability: &str) -> String {
        format!(
            "{}/capabilities/{capability}",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn data_agent() -> AgentIdentity {
        AgentIdentity::new("data", "http://localhost:8002/")
            .with_ws_url("ws://localhost:8002/ws")
            .with_capability("fetch_data")
    }

    #[test]
    fn test_valid_identity() {
        let agent = data_agent();
        assert!(agent.validate().is_ok());
        assert!(agent.has_capability("fetch_data"));
        assert!(!agent.has_capability("render_chart"));
    }

    #[test]
    fn test_capability_url_trims_slash() {
        assert_eq!(
            data_agent().capability_url("fetch_data"),
            "http://localhost:8002/capabilities/fetch_data"
        );
    }

    #[test]
    fn test_rejects_bad_addresses() {
        let agent = AgentIdentity::new("nlp", "localhost:8001").with_capability("understand");
        assert!(matches!(agent.validate(), Err(ConduitError::Config(_))));

        let agent = AgentIdentity::new("nlp", "http://localhost:8001")
            .with_ws_url("http://localhost:8001/ws")
            .with_capability("understand");
        assert!(agent.validate().is_err());
    }

    #[test]
    fn test_rejects_missing_capabilities() {
        let agent = AgentIdentity::new("viz", "http://localhost:8003");
        let err = agent.validate().unwrap_err();
        assert!(err.to_string().contains("no capabilities"));
    }

    #[test]
    fn test_deserialize_from_toml_shape() {
        let agent: AgentIdentity = serde_json::from_str(
            r#"{"name":"viz","base_url":"http://viz:8003","capabilities":["render_chart"]}"#,
        )
        .unwrap();
        assert!(agent.ws_url.is_none());
        assert!(agent.validate().is_ok());
    }
}
