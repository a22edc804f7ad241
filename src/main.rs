use anyhow::Result;
use spiral_core::config::{AgentBackendKind, Config};
use spiral_core::process_host;
use spiral_core::tool_surface::OrchestratorCore;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting spiral-core agent orchestration engine");

    let config = Config::load()?;
    let backend_name = match config.agent_backend {
        AgentBackendKind::Session => "session",
        AgentBackendKind::Process => "process",
    };
    let process_host: Arc<dyn process_host::ProcessHost> =
        Arc::from(process_host::backend_from_config(backend_name)?);

    let core = Arc::new(OrchestratorCore::new(config, process_host)?);

    tokio::select! {
        _ = core.clone().run_liveness_daemon() => {
            tracing::error!("liveness daemon exited unexpectedly");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
            info!("shutdown signal received, stopping");
        }
    }

    Ok(())
}
