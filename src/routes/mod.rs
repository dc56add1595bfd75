use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::AppState;

pub mod ai;
pub mod chat;
pub mod documents;
pub mod health;
pub mod labs;
pub mod symptoms;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let chat_routes = Router::new()
        .route(
            "/sessions",
            get(chat::list_sessions).post(chat::create_session),
        )
        .route(
            "/sessions/:id",
            get(chat::get_session).delete(chat::delete_session),
        )
        .route("/sessions/:id/messages", post(chat::send_message));

    let documents_routes = Router::new()
        .route("/", get(documents::list_documents))
        .route("/upload", post(documents::upload_document))
        .route(
            "/:id",
            get(documents::get_document).delete(documents::delete_document),
        );

    let labs_routes = Router::new()
        .route("/", get(labs::list_labs))
        .route("/trends/:test_name", get(labs::get_lab_trend))
        .route("/test-names", get(labs::list_test_names));

    let symptoms_routes = Router::new()
        .route(
            "/",
            get(symptoms::list_symptoms).post(symptoms::create_symptom),
        )
        .route("/types", get(symptoms::list_symptom_types));

    let body_limit = (state.config.max_upload_bytes() as usize).saturating_add(1024 * 1024);

    Router::new()
        .nest("/api/v1/chat", chat_routes)
        .nest("/api/v1/documents", documents_routes)
        .nest("/api/v1/labs", labs_routes)
        .nest("/api/v1/symptoms", symptoms_routes)
        .route("/api/v1/ai/status", get(ai::ai_status))
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
}
