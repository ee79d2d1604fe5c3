use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ro_sql_gateway::config::ConnectionRegistry;
use ro_sql_gateway::dispatch::GatewayServer;
use rmcp::{transport::stdio, ServiceExt};
use tracing_subscriber::EnvFilter;

/// Read-only MCP gateway brokering queries to a fleet of PostgreSQL/ClickHouse endpoints
#[derive(Parser)]
#[command(name = "ro-sql-gateway", version, about)]
struct Cli {
    /// Path to the YAML connection registry
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let env: HashMap<String, String> = std::env::vars().collect();
    let registry = ConnectionRegistry::load(&cli.config, &env)
        .with_context(|| format!("loading connection registry from {}", cli.config.display()))?;

    tracing::info!(
        connections = registry.list().count(),
        config = %cli.config.display(),
        "loaded connection registry"
    );

    let service = GatewayServer::new(registry);
    let running = service.serve(stdio()).await?;
    running.waiting().await?;

    Ok(())
}
