use std::{sync::Arc, time::Duration};

use tokio::signal;
use tracing_subscriber::EnvFilter;

use vitalog::{
    config::AppConfig,
    db,
    llm::{LlmGateway, OllamaGateway},
    parser::{DocumentParser, OcrClient},
    state::AppState,
    storage::{LocalStorage, ObjectStorage},
    workers,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        workers = config.worker_count,
        ocr_service_url = %config.ocr_service_url,
        extraction_model = %config.inference_extraction_model,
        "loaded configuration"
    );

    let pool = db::init_worker_pool(&config.database_url, config.worker_count)?;
    let storage: Arc<dyn ObjectStorage> = Arc::new(LocalStorage::new(config.upload_dir.clone()));
    let llm: Arc<dyn LlmGateway> = Arc::new(OllamaGateway::from_config(&config));
    let parser: Arc<dyn DocumentParser> = Arc::new(OcrClient::from_config(&config));

    let worker_count = config.worker_count;
    let state = Arc::new(AppState::new(pool, config, storage, llm, parser));

    tokio::select! {
        _ = workers::run_pool(state, worker_count, Duration::from_secs(2)) => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
