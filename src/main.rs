use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use vitalog::{
    config::AppConfig,
    db,
    llm::{LlmGateway, OllamaGateway},
    parser::{DocumentParser, OcrClient},
    routes,
    state::AppState,
    storage::{LocalStorage, ObjectStorage},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "api",
        database_url = %config.redacted_database_url(),
        inference_host = %config.inference_host,
        chat_model = %config.inference_chat_model,
        extraction_model = %config.inference_extraction_model,
        ocr_service_url = %config.ocr_service_url,
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let storage: Arc<dyn ObjectStorage> = Arc::new(LocalStorage::new(config.upload_dir.clone()));
    let llm: Arc<dyn LlmGateway> = Arc::new(OllamaGateway::from_config(&config));
    let parser: Arc<dyn DocumentParser> = Arc::new(OcrClient::from_config(&config));

    let address = format!("{}:{}", config.server_host, config.server_port);
    let state = AppState::new(pool, config, storage, llm, parser);
    let router = routes::create_router(state);

    let listener = TcpListener::bind(&address).await?;
    tracing::info!(%address, "api server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            tracing::info!("api server received shutdown signal");
        })
        .await?;

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
