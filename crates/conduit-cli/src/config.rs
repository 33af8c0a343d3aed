//! `conduit.toml` loading and cross-section validation.

use conduit_cache::CacheConfig;
use conduit_core::{AgentIdentity, ConduitError, ConduitResult};
use conduit_orchestrator::{PipelineConfig, WorkflowStage};
use conduit_transport::TransportConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Everything the binary needs to assemble the layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub agents: Vec<AgentIdentity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Period of the background sweep that drops expired cache entries.
    #[serde(default = "default_cache_purge_interval_secs")]
    pub cache_purge_interval_secs: u64,
    /// Buffered progress events per subscriber before it starts lagging.
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cache_purge_interval_secs: default_cache_purge_interval_secs(),
            progress_capacity: default_progress_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_cache_purge_interval_secs() -> u64 {
    60
}
fn default_progress_capacity() -> usize {
    256
}

impl ConduitConfig {
    /// Agent, breaker and pipeline checks that serde cannot express.
    pub fn validate(&self) -> ConduitResult<()> {
        if self.agents.is_empty() {
            return Err(ConduitError::Config("no agents configured".into()));
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            agent.validate()?;
            if !seen.insert(agent.name.as_str()) {
                return Err(ConduitError::Config(format!(
                    "duplicate agent '{}'",
                    agent.name
                )));
            }
        }

        for stage in WorkflowStage::PIPELINE {
            let Some(binding) = self.pipeline.binding(stage) else {
                continue;
            };
            let agent = self
                .agents
                .iter()
                .find(|a| a.name == binding.agent)
                .ok_or_else(|| {
                    ConduitError::Config(format!(
                        "stage '{stage}' is bound to unknown agent '{}'",
                        binding.agent
                    ))
                })?;
            if !agent.has_capability(&binding.capability) {
                return Err(ConduitError::Config(format!(
                    "stage '{stage}': agent '{}' does not offer '{}'",
                    agent.name, binding.capability
                )));
            }
        }

        if self.transport.breaker.failure_threshold == 0 {
            return Err(ConduitError::Config(
                "breaker failure_threshold must be at least 1".into(),
            ));
        }
        if self.transport.request_timeout_ms > self.transport.breaker.call_timeout_ms {
            return Err(ConduitError::Config(format!(
                "transport request_timeout_ms ({}) exceeds breaker call_timeout_ms ({})",
                self.transport.request_timeout_ms, self.transport.breaker.call_timeout_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(ConduitError::Config(format!(
                "cache similarity_threshold must be within [0, 1], got {}",
                self.cache.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// Read, parse and validate a TOML config file.
pub fn load_config(path: &Path) -> ConduitResult<ConduitConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ConduitError::Config(format!(
            "Failed to read config '{}': {e}",
            path.display()
        ))
    })?;
    let config: ConduitConfig = toml::from_str(&content).map_err(|e| {
        ConduitError::Config(format!(
            "Failed to parse config '{}': {e}",
            path.display()
        ))
    })?;
    config.validate()?;
    Ok(config)
}
