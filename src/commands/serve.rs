//! `ralph serve`: the websocket hub plus the worker orchestrator, running
//! until SIGINT.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{Adapter as _, AnyAdapter};
use crate::config::Config;
use crate::hub::{EventPipeline, Hub};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorControl as _};
use crate::server::{Server, ServerConfig, ServerContext};
use crate::store::SessionStore;
use crate::task::BeadsTaskStore;
use crate::worktree::WorktreeManager;

/// Bounded shutdown: workers get this long to wind down after SIGINT.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub async fn serve(workspace: PathBuf, config: Config) -> Result<u8> {
    let store = Arc::new(SessionStore::open(&workspace)?);
    let hub = Hub::new();
    let pipeline = EventPipeline::new(Arc::clone(&store), hub);

    let adapter = AnyAdapter::by_id(&config.agent).context("unknown agent adapter")?;
    if !adapter.is_available() {
        warn!(agent = %config.agent, "agent binary not found on PATH; workers will fail to start");
    }

    let orchestrator = Orchestrator::new(
        adapter,
        BeadsTaskStore::new(&workspace),
        Arc::new(WorktreeManager::new(&workspace)),
        pipeline.clone(),
        OrchestratorConfig {
            max_workers: config.max_workers,
            workspace_id: config.workspace_id.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            model: config.model.clone(),
            allowed_tools: config.allowed_tools.clone(),
            ..OrchestratorConfig::default()
        },
    );
    orchestrator.start();

    let server = Server::bind(&ServerConfig {
        host: config.host.clone(),
        port: config.port,
    })
    .await?;
    info!(addr = %server.local_addr, "observers connect via ws://{}", server.local_addr);

    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server.run(
        ServerContext {
            pipeline,
            control: Arc::new(orchestrator.clone()),
        },
        cancel.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for SIGINT")?;
    info!("SIGINT received, shutting down");

    if tokio::time::timeout(SHUTDOWN_GRACE, orchestrator.stop_and_wait())
        .await
        .is_err()
    {
        warn!("workers did not stop within the shutdown grace period");
    }
    orchestrator.cancel_token().cancel();
    cancel.cancel();
    let _ = server_task.await;

    match store.filter_noise() {
        Ok(0) => {}
        Ok(evicted) => info!(evicted, "evicted startup-noise sessions"),
        Err(e) => warn!(error = %e, "noise filtering failed"),
    }

    Ok(130)
}
