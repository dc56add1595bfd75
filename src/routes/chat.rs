use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::chat::ChatService;
use crate::error::{AppError, AppResult};
use crate::models::{ChatMessage, ChatSession};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: Uuid,
    pub title: Option<String>,
}

#[derive(Deserialize)]
pub struct SessionListQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl From<ChatSession> for SessionResponse {
    fn from(session: ChatSession) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id,
            title: session.title,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
        }
    }
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<ChatMessage> for MessageResponse {
    fn from(message: ChatMessage) -> Self {
        Self {
            id: message.id,
            role: message.role,
            content: message.content,
            metadata: message.metadata,
            created_at: message.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct SessionDetailResponse {
    #[serde(flatten)]
    pub session: SessionResponse,
    pub messages: Vec<MessageResponse>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionRequest>,
) -> AppResult<(StatusCode, Json<SessionResponse>)> {
    let session = ChatService::new(state).create_session(payload.user_id, payload.title)?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<SessionListQuery>,
) -> AppResult<Json<Vec<SessionResponse>>> {
    let sessions = ChatService::new(state).list_sessions(params.user_id)?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<SessionDetailResponse>> {
    let service = ChatService::new(state);
    let session = service.get_session(session_id)?;
    let messages = service.get_messages(session_id)?;
    Ok(Json(SessionDetailResponse {
        session: session.into(),
        messages: messages.into_iter().map(Into::into).collect(),
    }))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    ChatService::new(state).delete_session(session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Send a user message and stream the grounded assistant response as
/// Server-Sent Events: `content`, `tool_call`, `tool_result`, then exactly
/// one `done` or `error`.
pub async fn send_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if payload.content.trim().is_empty() {
        return Err(AppError::bad_request("content must not be empty"));
    }

    let service = ChatService::new(state);
    let session = service.get_session(session_id)?;
    let events = service.send_message(&session, payload.content).await?;

    let stream = ReceiverStream::new(events).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| {
            json!({"type": "error", "error": "event serialization failed"}).to_string()
        });
        Ok::<Event, Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(stream))
}
