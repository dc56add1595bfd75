use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    llm::LlmGateway,
    parser::DocumentParser,
    storage::ObjectStorage,
};

pub type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub llm: Arc<dyn LlmGateway>,
    pub parser: Arc<dyn DocumentParser>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        llm: Arc<dyn LlmGateway>,
        parser: Arc<dyn DocumentParser>,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            storage,
            llm,
            parser,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
