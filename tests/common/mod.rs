use std::collections::{HashMap, VecDeque};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tower::util::ServiceExt;
use uuid::Uuid;

use vitalog::config::AppConfig;
use vitalog::db::{self, PgPool};
use vitalog::llm::{ChatEvent, ChatOptions, ChatTurn, LlmGateway, LlmStatus, ToolExecutor};
use vitalog::models::{Job, NewLabResult, NewSymptomEntry, NewUser, NewWearableSample};
use vitalog::parser::{DocumentParser, ParseError};
use vitalog::routes;
use vitalog::state::AppState;
use vitalog::storage::ObjectStorage;
use vitalog::workers::{default_handlers, Worker};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

// ---------------------------------------------------------------------------
// Fake storage

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let guard = self.objects.lock().await;
        guard
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("object {key} missing"))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        Ok(())
    }
}

impl FakeStorage {
    #[allow(dead_code)]
    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

// ---------------------------------------------------------------------------
// Fake document parser

enum ParserBehavior {
    Text(String),
    Unreachable,
}

pub struct FakeParser {
    behavior: std::sync::Mutex<ParserBehavior>,
    calls: AtomicUsize,
}

impl FakeParser {
    pub fn with_text(text: &str) -> Self {
        Self {
            behavior: std::sync::Mutex::new(ParserBehavior::Text(text.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            behavior: std::sync::Mutex::new(ParserBehavior::Unreachable),
            calls: AtomicUsize::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn set_text(&self, text: &str) {
        *self.behavior.lock().unwrap() = ParserBehavior::Text(text.to_string());
    }

    #[allow(dead_code)]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentParser for FakeParser {
    async fn parse(&self, filename: &str, bytes: &[u8]) -> Result<String, ParseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &*self.behavior.lock().unwrap() {
            ParserBehavior::Unreachable => {
                Err(ParseError::Connection("connection refused".to_string()))
            }
            ParserBehavior::Text(_) if bytes.is_empty() => {
                Err(ParseError::Empty(filename.to_string()))
            }
            ParserBehavior::Text(text) => Ok(text.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake LLM gateway

/// One scripted behavior for a `chat_with_tools` round.
pub enum ScriptedRound {
    /// Emit content deltas, then the given tool calls (executed through the
    /// real executor) before the next round.
    Round {
        deltas: Vec<&'static str>,
        tool_calls: Vec<(&'static str, Value)>,
    },
    /// Emit an upstream error and stop.
    Fail(&'static str),
    /// Emit content deltas forever until the consumer goes away.
    Drip(&'static str),
}

#[derive(Default)]
pub struct FakeLlm {
    script: std::sync::Mutex<VecDeque<ScriptedRound>>,
    chat_replies: std::sync::Mutex<VecDeque<Result<String, String>>>,
    cancelled: AtomicBool,
    chat_calls: AtomicUsize,
}

impl FakeLlm {
    pub fn script_rounds(&self, rounds: Vec<ScriptedRound>) {
        *self.script.lock().unwrap() = rounds.into();
    }

    pub fn script_chat_replies(&self, replies: Vec<Result<String, String>>) {
        *self.chat_replies.lock().unwrap() = replies.into();
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn chat_call_count(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct FakeLlmHandle(Arc<FakeLlm>);

impl std::ops::Deref for FakeLlmHandle {
    type Target = FakeLlm;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl LlmGateway for FakeLlmHandle {
    async fn health_check(&self) -> LlmStatus {
        LlmStatus {
            reachable: true,
            installed_models: vec!["fake-chat".to_string(), "fake-extract".to_string()],
            configured_chat_model: "fake-chat".to_string(),
            configured_extraction_model: "fake-extract".to_string(),
            error: None,
        }
    }

    async fn chat(
        &self,
        _turns: Vec<ChatTurn>,
        _model: &str,
        _options: ChatOptions,
    ) -> anyhow::Result<String> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        match self.chat_replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(error)) => Err(anyhow!(error)),
            None => Ok(json!({ "lab_results": [] }).to_string()),
        }
    }

    async fn chat_stream(&self, _turns: Vec<ChatTurn>) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(8);
        let _ = tx.send(ChatEvent::Done).await;
        rx
    }

    async fn chat_with_tools(
        &self,
        _turns: Vec<ChatTurn>,
        _tools: Vec<Value>,
        executor: Arc<dyn ToolExecutor>,
    ) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(8);
        let fake = self.clone();
        tokio::spawn(async move {
            loop {
                let round = fake.script.lock().unwrap().pop_front();
                match round {
                    None => {
                        let _ = tx.send(ChatEvent::Done).await;
                        return;
                    }
                    Some(ScriptedRound::Fail(error)) => {
                        let _ = tx
                            .send(ChatEvent::Error {
                                error: error.to_string(),
                            })
                            .await;
                        return;
                    }
                    Some(ScriptedRound::Drip(delta)) => loop {
                        let event = ChatEvent::Content {
                            content: delta.to_string(),
                        };
                        if tx.send(event).await.is_err() {
                            fake.cancelled.store(true, Ordering::SeqCst);
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    },
                    Some(ScriptedRound::Round { deltas, tool_calls }) => {
                        for delta in deltas {
                            let event = ChatEvent::Content {
                                content: delta.to_string(),
                            };
                            if tx.send(event).await.is_err() {
                                fake.cancelled.store(true, Ordering::SeqCst);
                                return;
                            }
                        }

                        if tool_calls.is_empty() {
                            let _ = tx.send(ChatEvent::Done).await;
                            return;
                        }

                        for (name, arguments) in tool_calls {
                            let call = ChatEvent::ToolCall {
                                name: name.to_string(),
                                arguments: arguments.clone(),
                            };
                            if tx.send(call).await.is_err() {
                                fake.cancelled.store(true, Ordering::SeqCst);
                                return;
                            }
                            let result = executor.execute(name, &arguments).await;
                            let event = ChatEvent::ToolResult {
                                name: name.to_string(),
                                result,
                            };
                            if tx.send(event).await.is_err() {
                                fake.cancelled.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                }
            }
        });
        rx
    }
}

// ---------------------------------------------------------------------------
// Test application

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
    parser: Arc<FakeParser>,
    llm: Arc<FakeLlm>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_parser(FakeParser::with_text("Parsed document text.")).await
    }

    pub async fn with_parser(parser: FakeParser) -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            cors_allowed_origin: None,
            inference_host: "http://localhost:11434".to_string(),
            inference_chat_model: "fake-chat".to_string(),
            inference_extraction_model: "fake-extract".to_string(),
            inference_timeout_seconds: 5,
            ocr_service_url: "http://localhost:5001".to_string(),
            ocr_timeout_seconds: 5,
            extraction_timeout_seconds: 5,
            ingest_timeout_seconds: 30,
            upload_dir: "./uploads-test".to_string(),
            max_upload_size_mb: 5,
            worker_count: 1,
            tool_round_limit: 8,
            user_timezone: "UTC".to_string(),
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let parser = Arc::new(parser);
        let llm = Arc::new(FakeLlm::default());

        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();
        let parser_for_state: Arc<dyn DocumentParser> = parser.clone();
        let llm_for_state: Arc<dyn LlmGateway> = Arc::new(FakeLlmHandle(llm.clone()));

        let state = AppState::new(
            pool,
            config,
            storage_for_state,
            llm_for_state,
            parser_for_state,
        );
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
            parser,
            llm,
        })
    }

    #[allow(dead_code)]
    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    #[allow(dead_code)]
    pub fn parser(&self) -> Arc<FakeParser> {
        self.parser.clone()
    }

    pub fn llm(&self) -> Arc<FakeLlm> {
        self.llm.clone()
    }

    pub async fn insert_user(&self, username: &str) -> Result<Uuid> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            let user = NewUser {
                id: Uuid::new_v4(),
                username,
            };
            diesel::insert_into(vitalog::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn seed_lab(
        &self,
        user_id: Uuid,
        test_name: &str,
        test_code: Option<&str>,
        value: &str,
        unit: &str,
        status: Option<&str>,
        recorded_at: NaiveDate,
    ) -> Result<Uuid> {
        let row = NewLabResult {
            id: Uuid::new_v4(),
            user_id,
            document_id: None,
            test_name: test_name.to_string(),
            test_code: test_code.map(str::to_string),
            value: value.parse::<BigDecimal>().context("invalid value")?,
            unit: unit.to_string(),
            reference_min: None,
            reference_max: None,
            status: status.map(str::to_string),
            recorded_at,
        };
        let id = row.id;
        self.with_conn(move |conn| {
            diesel::insert_into(vitalog::schema::lab_results::table)
                .values(&row)
                .execute(conn)
                .context("failed to seed lab result")?;
            Ok(id)
        })
        .await
    }

    pub async fn seed_symptom(
        &self,
        user_id: Uuid,
        symptom_type: &str,
        severity: i32,
        recorded_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let entry = NewSymptomEntry {
            id: Uuid::new_v4(),
            user_id,
            symptom_type: symptom_type.to_string(),
            severity,
            notes: None,
            recorded_at,
            duration_minutes: None,
            triggers: None,
        };
        let id = entry.id;
        self.with_conn(move |conn| {
            diesel::insert_into(vitalog::schema::symptom_entries::table)
                .values(&entry)
                .execute(conn)
                .context("failed to seed symptom")?;
            Ok(id)
        })
        .await
    }

    pub async fn seed_wearable(
        &self,
        user_id: Uuid,
        series_code: &str,
        recorded_at: DateTime<Utc>,
        value: f64,
    ) -> Result<()> {
        let series_code = series_code.to_string();
        self.with_conn(move |conn| {
            use vitalog::schema::series_types::dsl as st;
            let series_type_id: Uuid = st::series_types
                .filter(st::code.eq(&series_code))
                .select(st::id)
                .first(conn)
                .context("series type missing")?;

            let sample = NewWearableSample {
                id: Uuid::new_v4(),
                user_id,
                series_type_id,
                recorded_at,
                value,
            };
            diesel::insert_into(vitalog::schema::wearable_samples::table)
                .values(&sample)
                .execute(conn)
                .context("failed to seed wearable sample")?;
            Ok(())
        })
        .await
    }

    /// Drain the job queue with a single worker, exactly as the worker
    /// binary would.
    pub async fn run_worker_until_idle(&self) -> Result<()> {
        let worker = Worker::new(
            Arc::new(self.state.clone()),
            default_handlers(),
            Duration::from_millis(10),
        );
        loop {
            let handled = worker.tick().await.context("worker tick failed")?;
            if !handled {
                return Ok(());
            }
        }
    }

    #[allow(dead_code)]
    pub async fn jobs_by_type(&self, ty: &str) -> Result<Vec<Job>> {
        let ty = ty.to_string();
        self.with_conn(move |conn| {
            use vitalog::schema::jobs::dsl::{job_type as job_type_col, jobs as jobs_table};
            let rows = jobs_table
                .filter(job_type_col.eq(&ty))
                .load::<Job>(conn)
                .context("failed to load jobs")?;
            Ok(rows)
        })
        .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn delete(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn upload_document(
        &self,
        user_id: Uuid,
        filename: &str,
        content_type: &str,
        data: &[u8],
        document_type: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();

        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        body.extend(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        body.extend(data);
        body.extend(b"\r\n");

        for (name, value) in [
            ("user_id", user_id.to_string()),
            ("title", format!("Test upload {filename}")),
            ("document_type", document_type.to_string()),
        ] {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
            body.extend(value.as_bytes());
            body.extend(b"\r\n");
        }

        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/documents/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn body_to_json(body: Body) -> Result<Value> {
    let bytes = body_to_vec(body).await?;
    serde_json::from_slice(&bytes).context("response body is not JSON")
}

/// Parse an SSE body into the JSON payloads of its `data:` frames.
pub async fn sse_events(body: Body) -> Result<Vec<Value>> {
    let bytes = body_to_vec(body).await?;
    let text = String::from_utf8(bytes).context("SSE body is not UTF-8")?;

    let mut events = Vec::new();
    for frame in text.split("\n\n") {
        for line in frame.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                events.push(serde_json::from_str(data).context("SSE frame is not JSON")?);
            }
        }
    }
    Ok(events)
}

pub fn expect_status(response: &hyper::Response<Body>, expected: StatusCode) -> Result<()> {
    anyhow::ensure!(
        response.status() == expected,
        "expected status {expected}, got {}",
        response.status()
    );
    Ok(())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE active_chat_streams, chat_messages, chat_sessions, jobs, lab_results, \
         medical_documents, symptom_entries, wearable_samples, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
