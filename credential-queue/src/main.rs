use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use credential_queue::config::AppConfig;
use credential_queue::database::models::CredentialDbModel;
use credential_queue::database::repositories::SqlxCredentialRepository;
use credential_queue::worker::{BatchProcessor, BatchWorker, ItemOutcome};
use credential_queue::{database, logging, object_store};

/// Logs every claimed request and issues those whose payload is valid JSON.
struct LoggingProcessor;

#[async_trait]
impl BatchProcessor for LoggingProcessor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn process(
        &self,
        batch_id: &str,
        items: Vec<CredentialDbModel>,
    ) -> credential_queue::Result<Vec<ItemOutcome>> {
        Ok(items
            .into_iter()
            .map(|item| {
                info!(batch_id = %batch_id, id = %item.id, status = %item.status_code, "Credential request");
                match serde_json::from_str::<serde_json::Value>(&item.request) {
                    Ok(_) => ItemOutcome::issued(item.id),
                    Err(e) => ItemOutcome::failed(item.id, format!("invalid request: {e}")),
                }
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;
    if let Some(filter) = &config.log_filter {
        if let Err(e) = logging_config.set_filter(filter) {
            warn!("Ignoring LOG_FILTER: {}", e);
        }
    }

    let cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(cancel.child_token());

    // Migrations go through the write pool so they never race the readers.
    let write_pool = database::init_write_pool(&config.database_url).await?;
    database::run_migrations(&write_pool).await?;
    let pool = database::init_pool(&config.database_url).await?;

    if let Some(helper) = object_store::helper_from_config(&config)? {
        info!(
            account = %helper.settings().account,
            bucket = %helper.settings().bucket,
            "Object store configured"
        );
    }

    let repo = SqlxCredentialRepository::new(pool.clone(), write_pool.clone())
        .with_lock_settings(config.lock_settings());
    let worker = BatchWorker::new(
        Arc::new(repo),
        Arc::new(LoggingProcessor),
        config.worker_config(),
    );

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    });

    info!("credential-queue initialized successfully");
    worker.run(cancel).await;

    write_pool.close().await;
    pool.close().await;
    Ok(())
}
