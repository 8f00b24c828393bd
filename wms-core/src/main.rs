use wms_core::database::Pools;
use wms_core::logging::init_logging;
use wms_core::{JobLifecycle, WmsConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = WmsConfig::from_env()?;
    let (_logging, _guard) = init_logging(config.log_dir.as_deref())?;

    let pools = Pools::open(&config.database_url, config.read_pool_size).await?;
    let lifecycle = JobLifecycle::new(pools, config);

    let queues = lifecycle.retrieve_task_queues(None).await?;
    tracing::info!(
        task_queues = queues.len(),
        max_rescheduling = lifecycle.config().max_rescheduling,
        deferred_cleanup = %lifecycle.config().deferred_cleanup,
        "wms-core initialized successfully"
    );

    lifecycle.shutdown().await;
    Ok(())
}
