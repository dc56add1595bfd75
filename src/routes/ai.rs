use axum::extract::State;
use axum::Json;

use crate::llm::LlmStatus;
use crate::state::AppState;

/// Probe the inference server and report configured models.
pub async fn ai_status(State(state): State<AppState>) -> Json<LlmStatus> {
    Json(state.llm.health_check().await)
}
