//! `conduit` binary: loads `conduit.toml`, sets up logging and serves the gateway.

mod config;

use crate::config::{load_config, ConduitConfig};
use clap::{Parser, Subcommand};
use conduit_cache::SemanticCache;
use conduit_gateway::{AppState, GatewayServer};
use conduit_orchestrator::{Orchestrator, ProgressReporter, WorkflowStage};
use conduit_resilience::BreakerRegistry;
use conduit_transport::HybridTransportAdapter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conduit", about = "Conduit: resilient agent orchestration layer")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conduit.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate the config file and print the resolved pipeline
    Check,
    /// List configured agents and their transports
    Agents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await?,
        Commands::Check => {
            println!("Config '{}' is valid.", cli.config.display());
            for stage in WorkflowStage::PIPELINE {
                if let Some(binding) = config.pipeline.binding(stage) {
                    println!("  {stage:<14} {}/{}", binding.agent, binding.capability);
                }
            }
            println!(
                "  workflow timeout {}ms, breaker threshold {}, stateless attempts {}",
                config.pipeline.workflow_timeout_ms,
                config.transport.breaker.failure_threshold,
                config.transport.stateless_retry.max_attempts
            );
        }
        Commands::Agents => {
            println!("Configured agents:");
            for agent in &config.agents {
                let transports = match &agent.ws_url {
                    Some(ws) => format!("persistent {ws}, stateless {}", agent.base_url),
                    None => format!("stateless {}", agent.base_url),
                };
                println!("  {} ({transports})", agent.name);
                println!("    Capabilities: {}", agent.capabilities.join(", "));
            }
            println!("\nTotal: {} agent(s)", config.agents.len());
        }
    }

    Ok(())
}

async fn serve(config: ConduitConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);

    let breakers = Arc::new(BreakerRegistry::new());
    let transport = Arc::new(HybridTransportAdapter::new(
        config.agents,
        config.transport,
        breakers,
    )?);
    transport.start();

    let cache = Arc::new(SemanticCache::new(config.cache));
    let progress = Arc::new(ProgressReporter::new(config.server.progress_capacity));
    let orchestrator = Arc::new(Orchestrator::new(
        transport.clone(),
        cache.clone(),
        progress,
        config.pipeline,
    ));

    let purge_interval = Duration::from_secs(config.server.cache_purge_interval_secs.max(1));
    let purger = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_interval);
        loop {
            ticker.tick().await;
            let removed = cache.purge_expired().await;
            debug!(removed, "Cache sweep");
        }
    });

    let app = GatewayServer::build(AppState::new(orchestrator, transport.clone()));
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, agents = transport.agents().len(), "Conduit gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Shutting down");
    purger.abort();
    transport.shutdown().await;
    Ok(())
}
