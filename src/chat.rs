//! Chat orchestration: session lifecycle, message persistence, and the
//! bridge between the LLM gateway's tool loop and the SSE transport.

use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::PgPool;
use crate::error::{AppError, AppResult};
use crate::llm::{ChatEvent, ChatTurn, ToolCallFunction, ToolCallPayload};
use crate::models::{ChatMessage, ChatSession, NewActiveChatStream, NewChatMessage, NewChatSession};
use crate::schema::{active_chat_streams, chat_messages, chat_sessions};
use crate::state::AppState;
use crate::tools::{self, HealthToolExecutor};

const EVENT_CHANNEL_CAPACITY: usize = 32;
const HISTORY_LIMIT: i64 = 50;
const AUTO_TITLE_MAX_CHARS: usize = 50;

const SYSTEM_PROMPT: &str = "\
You are a knowledgeable and empathetic health assistant. You help users \
understand their health data from wearable devices, lab results, and symptom \
tracking.

## Your Capabilities
You have access to tools that can query:
- **Lab Results**: blood tests, hormone levels, medical markers with reference ranges
- **Symptom History**: user-logged symptoms with severity, triggers, and duration
- **Wearable Data**: heart rate, steps, sleep, HRV, weight, and more
- **Daily Summaries**: a combined view of all health data for a specific date
- **Correlations**: statistical relationships between any two health metrics

## Guidelines
1. **Always use tools** to look up real data before answering. Never guess or make up data.
2. **Be specific**: include actual numbers, dates, and trends, and say which tool result supports each claim.
3. **Highlight important findings**: flag values outside reference ranges.
4. **Be honest about limitations**: you are not a doctor and you do not give diagnoses or medical advice. Recommend consulting a healthcare professional for medical decisions, medication changes, or concerning trends.
5. **Be concise but thorough.**

Today's date is {today}. Use it to resolve relative time periods like 'last week'.";

/// One recorded tool invocation on an assistant message, kept under
/// `metadata.tool_calls` and replayed on later turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: Value,
    pub result: String,
}

#[derive(Clone)]
pub struct ChatService {
    state: AppState,
}

impl ChatService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn create_session(&self, user_id: Uuid, title: Option<String>) -> AppResult<ChatSession> {
        let mut conn = self.state.db()?;
        let new_session = NewChatSession {
            id: Uuid::new_v4(),
            user_id,
            title,
        };
        diesel::insert_into(chat_sessions::table)
            .values(&new_session)
            .execute(&mut conn)?;
        let session = chat_sessions::table.find(new_session.id).first(&mut conn)?;
        info!(session_id = %new_session.id, %user_id, "created chat session");
        Ok(session)
    }

    pub fn list_sessions(&self, user_id: Uuid) -> AppResult<Vec<ChatSession>> {
        let mut conn = self.state.db()?;
        let sessions = chat_sessions::table
            .filter(chat_sessions::user_id.eq(user_id))
            .order(chat_sessions::last_activity_at.desc())
            .limit(HISTORY_LIMIT)
            .load(&mut conn)?;
        Ok(sessions)
    }

    pub fn get_session(&self, session_id: Uuid) -> AppResult<ChatSession> {
        let mut conn = self.state.db()?;
        let session = chat_sessions::table.find(session_id).first(&mut conn)?;
        Ok(session)
    }

    pub fn get_messages(&self, session_id: Uuid) -> AppResult<Vec<ChatMessage>> {
        let mut conn = self.state.db()?;
        load_messages(&mut conn, session_id).map_err(AppError::from)
    }

    /// Deletes the session; messages go with it through the FK cascade.
    pub fn delete_session(&self, session_id: Uuid) -> AppResult<()> {
        let mut conn = self.state.db()?;
        let deleted =
            diesel::delete(chat_sessions::table.find(session_id)).execute(&mut conn)?;
        if deleted == 0 {
            return Err(AppError::not_found());
        }
        info!(%session_id, "deleted chat session");
        Ok(())
    }

    /// Persist the user turn and start the grounded response stream.
    ///
    /// Returns the event receiver feeding the transport. The user message is
    /// durable before any LLM work begins; the assistant turn is written only
    /// after the gateway reports `done`. Dropping the receiver cancels the
    /// stream without persisting a partial assistant message.
    pub async fn send_message(
        &self,
        session: &ChatSession,
        content: String,
    ) -> AppResult<mpsc::Receiver<ChatEvent>> {
        let session_id = session.id;
        let user_id = session.user_id;

        self.claim_stream(session_id)?;

        let turns = {
            let mut conn = match self.state.db() {
                Ok(conn) => conn,
                Err(err) => {
                    self.release_stream(session_id);
                    return Err(err);
                }
            };
            let prepared = conn.transaction::<_, diesel::result::Error, _>(|conn| {
                persist_message(conn, session_id, "user", &content, None)?;
                autofill_title(conn, session, &content)?;
                let history = load_messages(conn, session_id)?;
                Ok(history)
            });
            match prepared {
                Ok(history) => build_conversation(&history, self.timezone()),
                Err(err) => {
                    self.release_stream(session_id);
                    return Err(err.into());
                }
            }
        };

        let executor = Arc::new(HealthToolExecutor::new(
            self.state.pool.clone(),
            user_id,
            self.timezone(),
        ));

        let gateway_rx = self
            .state
            .llm
            .chat_with_tools(turns, tools::definitions(), executor)
            .await;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pool = self.state.pool.clone();
        tokio::spawn(forward_stream(pool, session_id, gateway_rx, tx));

        Ok(rx)
    }

    fn timezone(&self) -> Tz {
        self.state
            .config
            .user_timezone
            .parse()
            .unwrap_or(chrono_tz::UTC)
    }

    /// Single-writer-per-session guard: a conditional insert keyed by the
    /// session, removed when the stream ends.
    fn claim_stream(&self, session_id: Uuid) -> AppResult<()> {
        let mut conn = self.state.db()?;
        let claimed = diesel::insert_into(active_chat_streams::table)
            .values(&NewActiveChatStream {
                session_id,
                started_at: Utc::now(),
            })
            .on_conflict_do_nothing()
            .execute(&mut conn)?;
        if claimed == 0 {
            return Err(AppError::conflict(
                "a response stream is already active for this session",
            ));
        }
        Ok(())
    }

    fn release_stream(&self, session_id: Uuid) {
        if let Ok(mut conn) = self.state.db() {
            let _ = diesel::delete(active_chat_streams::table.find(session_id))
                .execute(&mut conn);
        } else {
            error!(%session_id, "failed to release stream guard due to pool error");
        }
    }
}

/// Re-emit gateway events to the transport, accumulate the assistant turn,
/// and persist it once `done` arrives. Always releases the stream guard.
async fn forward_stream(
    pool: PgPool,
    session_id: Uuid,
    mut gateway_rx: mpsc::Receiver<ChatEvent>,
    tx: mpsc::Sender<ChatEvent>,
) {
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCallRecord> = Vec::new();

    while let Some(event) = gateway_rx.recv().await {
        match event {
            ChatEvent::Content { content: delta } => {
                content.push_str(&delta);
                if tx.send(ChatEvent::Content { content: delta }).await.is_err() {
                    break;
                }
            }
            ChatEvent::ToolCall { name, arguments } => {
                tool_calls.push(ToolCallRecord {
                    tool: name.clone(),
                    arguments: arguments.clone(),
                    result: String::new(),
                });
                if tx.send(ChatEvent::ToolCall { name, arguments }).await.is_err() {
                    break;
                }
            }
            ChatEvent::ToolResult { name, result } => {
                if let Some(record) = tool_calls
                    .iter_mut()
                    .find(|r| r.tool == name && r.result.is_empty())
                {
                    record.result = result.clone();
                }
                if tx.send(ChatEvent::ToolResult { name, result }).await.is_err() {
                    break;
                }
            }
            ChatEvent::Done => {
                if let Err(err) =
                    persist_assistant_turn(&pool, session_id, &content, &tool_calls).await
                {
                    error!(%session_id, error = %err, "failed to persist assistant message");
                    let _ = tx
                        .send(ChatEvent::Error {
                            error: "failed to persist assistant message".to_string(),
                        })
                        .await;
                    break;
                }
                let _ = tx.send(ChatEvent::Done).await;
                break;
            }
            ChatEvent::Error { error } => {
                // The user message stays; nothing else is written.
                warn!(%session_id, %error, "chat stream ended with error");
                let _ = tx.send(ChatEvent::Error { error }).await;
                break;
            }
        }
    }

    drop(gateway_rx);

    let release = tokio::task::spawn_blocking(move || {
        if let Ok(mut conn) = pool.get() {
            let _ = diesel::delete(active_chat_streams::table.find(session_id))
                .execute(&mut conn);
        }
    })
    .await;
    if release.is_err() {
        error!(%session_id, "stream guard release task panicked");
    }
}

async fn persist_assistant_turn(
    pool: &PgPool,
    session_id: Uuid,
    content: &str,
    tool_calls: &[ToolCallRecord],
) -> Result<(), String> {
    let pool = pool.clone();
    let content = content.to_string();
    let metadata = if tool_calls.is_empty() {
        None
    } else {
        Some(json!({ "tool_calls": tool_calls }))
    };

    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            persist_message(conn, session_id, "assistant", &content, metadata)
        })
        .map_err(|err| err.to_string())
    })
    .await
    .map_err(|err| format!("persist task panicked: {err}"))?
}

/// Append one message and advance the session's `last_activity_at` in the
/// same transaction scope.
fn persist_message(
    conn: &mut PgConnection,
    session_id: Uuid,
    role: &str,
    content: &str,
    metadata: Option<Value>,
) -> Result<(), diesel::result::Error> {
    let message = NewChatMessage {
        id: Uuid::new_v4(),
        session_id,
        role: role.to_string(),
        content: content.to_string(),
        metadata,
    };
    diesel::insert_into(chat_messages::table)
        .values(&message)
        .execute(conn)?;

    diesel::update(chat_sessions::table.find(session_id))
        .set(chat_sessions::last_activity_at.eq(Utc::now()))
        .execute(conn)?;
    Ok(())
}

fn autofill_title(
    conn: &mut PgConnection,
    session: &ChatSession,
    first_message: &str,
) -> Result<(), diesel::result::Error> {
    if session.title.is_some() {
        return Ok(());
    }

    let trimmed = first_message.trim();
    let mut title: String = trimmed.chars().take(AUTO_TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > AUTO_TITLE_MAX_CHARS {
        title.push_str("...");
    }
    if title.is_empty() {
        return Ok(());
    }

    diesel::update(chat_sessions::table.find(session.id))
        .set(chat_sessions::title.eq(Some(title)))
        .execute(conn)?;
    Ok(())
}

fn load_messages(
    conn: &mut PgConnection,
    session_id: Uuid,
) -> Result<Vec<ChatMessage>, diesel::result::Error> {
    chat_messages::table
        .filter(chat_messages::session_id.eq(session_id))
        .order(chat_messages::created_at.asc())
        .load(conn)
}

/// Assemble the model-visible conversation: the dated system prompt followed
/// by the session history. Assistant turns that recorded tool calls are
/// expanded back into an assistant-with-tool-calls turn plus one tool-role
/// turn per result, so the model sees the context it produced earlier.
fn build_conversation(history: &[ChatMessage], tz: Tz) -> Vec<ChatTurn> {
    let today = Utc::now().with_timezone(&tz).date_naive().to_string();
    let mut turns = vec![ChatTurn::system(SYSTEM_PROMPT.replace("{today}", &today))];

    for message in history {
        match message.role.as_str() {
            "assistant" => {
                let records = message
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("tool_calls"))
                    .and_then(|calls| {
                        serde_json::from_value::<Vec<ToolCallRecord>>(calls.clone()).ok()
                    })
                    .unwrap_or_default();

                if records.is_empty() {
                    turns.push(ChatTurn::assistant(message.content.clone()));
                    continue;
                }

                let payloads = records
                    .iter()
                    .map(|record| ToolCallPayload {
                        function: ToolCallFunction {
                            name: record.tool.clone(),
                            arguments: record.arguments.clone(),
                        },
                    })
                    .collect();
                turns.push(ChatTurn::assistant_with_tool_calls("", payloads));
                for record in &records {
                    turns.push(ChatTurn::tool(record.result.clone()));
                }
                if !message.content.is_empty() {
                    turns.push(ChatTurn::assistant(message.content.clone()));
                }
            }
            role => {
                let mut turn = ChatTurn::user(message.content.clone());
                turn.role = role.to_string();
                turns.push(turn);
            }
        }
    }

    turns
}
