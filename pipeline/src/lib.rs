pub mod batch;
pub mod clients;
pub mod collaborators;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod generation;
pub mod handlers;
pub mod invocation;
pub mod memory;
pub mod metrics_defs;
pub mod remote;
pub mod retry;
pub mod service;
pub mod workflow;

#[cfg(test)]
mod testutils;

use clients::Clients;
use errors::PipelineError;
use handlers::Handlers;
use service::PipelineService;
use shared::admin_service::AdminService;
use shared::http::{bind, serve};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Wires the collaborators described by `config` and serves invocations until a listener fails.
pub async fn run(config: config::Config) -> Result<(), PipelineError> {
    run_with_readiness(config, Arc::new(AtomicBool::new(false))).await
}

/// Like [`run`], flipping `ready` once both listeners are bound.
async fn run_with_readiness(
    config: config::Config,
    ready: Arc<AtomicBool>,
) -> Result<(), PipelineError> {
    let clients = Clients::from_config(&config)?;
    let handlers = Arc::new(Handlers::from_config(&config, &clients));
    tracing::info!(handlers = ?handlers.names(), "Handlers registered");

    let flag = ready.clone();
    let admin = AdminService::new(move || flag.load(Ordering::Relaxed));

    let pipeline_listener = bind(&config.listener.host, config.listener.port).await?;
    let admin_listener = bind(&config.admin_listener.host, config.admin_listener.port).await?;
    ready.store(true, Ordering::Relaxed);

    tokio::try_join!(
        serve(pipeline_listener, PipelineService::new(handlers)),
        serve(admin_listener, admin),
    )?;
    Ok(())
}
