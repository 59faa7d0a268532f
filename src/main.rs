use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use rolegate::{cli, config, edge, gateway::GatewayCore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Loads config, wires the Router Core, bootstraps roles from the skills
/// backend, and starts every configured backend.
async fn initialize(cli: &cli::Cli) -> Result<Arc<GatewayCore>> {
    let mut config = config::Config::load(&cli.config)?;
    if let Some(role) = &cli.role {
        config.default_role = Some(role.clone());
    }
    if let Some(command) = &cli.skills_backend_command
        && let Some(skills_backend) = config.skills_backend.clone()
        && let Some(backend) = config.backends.get_mut(&skills_backend)
    {
        backend.command = command.to_string_lossy().into_owned();
    }

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(
        config_path = %cli.config.display(),
        backends = config.backends.len(),
        "rolegate starting"
    );

    let core = GatewayCore::new(config.clone());
    core.register_backends_from_config(config.backends.clone());
    core.start_all();
    core.bootstrap_roles().await;

    Ok(core)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let core = initialize(&cli).await?;

    let server = edge::RoleGateServer::new(core.clone());
    info!("starting MCP stdio server");
    let service = server.serve(stdio()).await?;

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = service.waiting() => {
                if let Err(e) = result {
                    warn!(error = %e, "MCP service exited with error");
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        service.waiting().await?;
    }

    info!("shutting down");
    core.shutdown().await;

    Ok(())
}
