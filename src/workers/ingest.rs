//! The document ingestion job: OCR, LLM extraction, validation, and
//! deduplicated persistence of lab results.
//!
//! Status only moves forward (uploading → parsing → parsed → extracting →
//! completed) or to failed; a redelivered job observes a non-resumable
//! status and exits without touching anything.

use std::{str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    db::PgPool,
    jobs::JOB_PROCESS_DOCUMENT,
    llm::{ChatOptions, ChatTurn},
    models::{document_status, MedicalDocument, NewLabResult},
    schema::{lab_results, medical_documents},
    state::AppState,
};

use super::{JobExecution, JobHandler};

const EXTRACTION_TEXT_LIMIT: usize = 8000;

const EXTRACTION_SYSTEM_PROMPT: &str =
    "You are a medical data extractor. Return ONLY valid JSON.";

const EXTRACTION_USER_TEMPLATE: &str = r#"Extract all lab results from the following medical document text.

Return a JSON object with this exact structure:
{
  "lab_results": [
    {
      "test_name": "Hemoglobin",
      "test_code": "718-7",
      "value": 14.2,
      "unit": "g/dL",
      "reference_min": 13.5,
      "reference_max": 17.5,
      "recorded_at": "2024-01-15",
      "status": "normal"
    }
  ]
}

Rules:
- "value" must be a number (not a string)
- "test_code" is the standardized code if stated, otherwise null
- "reference_min" and "reference_max" may be null if not stated
- "recorded_at" must be YYYY-MM-DD format; omit it if no date is stated
- "status" must be one of: "normal", "high", "low", "critical", or null
- Only include results with a numeric value

Document text:
"#;

const REINFORCEMENT_PROMPT: &str =
    "Your previous reply was not valid JSON. Reply again with ONLY the JSON object described above, with no prose around it.";

#[derive(Debug, Clone, Deserialize)]
struct ProcessDocumentPayload {
    document_id: Uuid,
}

pub struct ProcessDocumentJob;

impl ProcessDocumentJob {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessDocumentJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for ProcessDocumentJob {
    fn job_type(&self) -> &'static str {
        JOB_PROCESS_DOCUMENT
    }

    async fn handle(&self, state: Arc<AppState>, job: crate::models::Job) -> JobExecution {
        let payload: ProcessDocumentPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid process-document payload: {err}"),
                }
            }
        };

        let ceiling = Duration::from_secs(state.config.ingest_timeout_seconds);
        let document_id = payload.document_id;

        match timeout(ceiling, run_pipeline(state.clone(), document_id)).await {
            Ok(execution) => execution,
            Err(_) => {
                warn!(job_id = %job.id, %document_id, "ingestion exceeded overall ceiling");
                let stage = current_stage(&state.pool, document_id).await;
                fail_document(&state.pool, document_id, &stage, "ingestion timed out").await;
                JobExecution::Failed {
                    error: format!("ingestion exceeded {} seconds", ceiling.as_secs()),
                }
            }
        }
    }
}

async fn run_pipeline(state: Arc<AppState>, document_id: Uuid) -> JobExecution {
    let document = match load_document(&state.pool, document_id).await {
        Ok(Some(document)) => document,
        Ok(None) => {
            return JobExecution::Failed {
                error: format!("document {document_id} not found"),
            }
        }
        Err(err) => {
            return JobExecution::Retry {
                delay: Duration::from_secs(30),
                error: err,
            }
        }
    };

    // Redelivery guard: only a fresh or previously interrupted parse resumes.
    if document.status != document_status::UPLOADING
        && document.status != document_status::PARSING
    {
        info!(%document_id, status = %document.status, "document already processed; skipping");
        return JobExecution::Success;
    }

    // Stage 1: OCR.
    if let Err(err) = set_status(&state.pool, document_id, document_status::PARSING).await {
        return JobExecution::Retry {
            delay: Duration::from_secs(30),
            error: err,
        };
    }

    let bytes = match state.storage.get_object(&document.file_path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let message = format!("failed to read stored file: {err}");
            fail_document(&state.pool, document_id, "parsing", &message).await;
            return JobExecution::Failed { error: message };
        }
    };

    let raw_text = match parse_with_retry(&state, &document.file_path, &bytes).await {
        Ok(text) => text,
        Err(err) => {
            let message = err.to_string();
            fail_document(&state.pool, document_id, "parsing", &message).await;
            return JobExecution::Failed { error: message };
        }
    };

    if let Err(err) = store_raw_text(&state.pool, document_id, &raw_text).await {
        return JobExecution::Retry {
            delay: Duration::from_secs(30),
            error: err,
        };
    }

    // Stage 2: LLM extraction.
    if let Err(err) = set_status(&state.pool, document_id, document_status::EXTRACTING).await {
        return JobExecution::Retry {
            delay: Duration::from_secs(30),
            error: err,
        };
    }

    let extracted = match extract_lab_records(&state, &raw_text).await {
        Ok(extracted) => extracted,
        Err(err) => {
            fail_document(&state.pool, document_id, "extracting", &err).await;
            return JobExecution::Failed { error: err };
        }
    };

    // Stage 3: validation.
    let (validated, dropped) = validate_records(&extracted, document.document_date);

    // Stage 4: deduplicated persistence; completion is atomic with the
    // written artifacts.
    match persist_lab_results(
        &state.pool,
        document_id,
        document.user_id,
        validated,
        dropped,
    )
    .await
    {
        Ok((saved, skipped)) => {
            info!(
                %document_id,
                saved,
                skipped,
                dropped,
                "document ingestion completed"
            );
            JobExecution::Success
        }
        Err(err) => {
            fail_document(&state.pool, document_id, "persisting", &err).await;
            JobExecution::Failed { error: err }
        }
    }
}

/// One retry on connection-level parser failures only; HTTP and content
/// errors are final.
async fn parse_with_retry(
    state: &AppState,
    filename: &str,
    bytes: &[u8],
) -> Result<String, crate::parser::ParseError> {
    use crate::parser::ParseError;

    match state.parser.parse(filename, bytes).await {
        Err(ParseError::Connection(first)) => {
            warn!(filename, error = %first, "retrying parser after connection error");
            state.parser.parse(filename, bytes).await
        }
        other => other,
    }
}

/// Call the extraction model and parse its JSON reply. One retry with a
/// reinforcement turn when the reply is not valid JSON.
async fn extract_lab_records(state: &AppState, raw_text: &str) -> Result<Vec<Value>, String> {
    let text: String = raw_text.chars().take(EXTRACTION_TEXT_LIMIT).collect();
    let mut turns = vec![
        ChatTurn::system(EXTRACTION_SYSTEM_PROMPT),
        ChatTurn::user(format!("{EXTRACTION_USER_TEMPLATE}{text}")),
    ];
    let options =
        ChatOptions::json(Duration::from_secs(state.config.extraction_timeout_seconds));
    let model = state.config.inference_extraction_model.as_str();

    let reply = state
        .llm
        .chat(turns.clone(), model, options.clone())
        .await
        .map_err(|err| format!("extraction request failed: {err}"))?;

    match parse_extraction_reply(&reply) {
        Ok(records) => Ok(records),
        Err(first_error) => {
            warn!(error = %first_error, "extraction reply was not valid JSON; retrying");
            turns.push(ChatTurn::assistant(reply));
            turns.push(ChatTurn::user(REINFORCEMENT_PROMPT));

            let retry_reply = state
                .llm
                .chat(turns, model, options)
                .await
                .map_err(|err| format!("extraction retry failed: {err}"))?;
            parse_extraction_reply(&retry_reply)
                .map_err(|err| format!("extraction returned invalid JSON twice: {err}"))
        }
    }
}

fn parse_extraction_reply(reply: &str) -> Result<Vec<Value>, String> {
    let parsed: Value = serde_json::from_str(reply.trim()).map_err(|e| e.to_string())?;
    match parsed.get("lab_results") {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err("lab_results is not an array".to_string()),
        None => Err("reply has no lab_results field".to_string()),
    }
}

pub(crate) struct ValidatedLab {
    test_name: String,
    test_code: Option<String>,
    value: BigDecimal,
    unit: String,
    reference_min: Option<BigDecimal>,
    reference_max: Option<BigDecimal>,
    status: Option<String>,
    recorded_at: NaiveDate,
}

/// Drop records missing required fields or carrying non-numeric values.
/// Returns the surviving records and the dropped count.
fn validate_records(
    records: &[Value],
    document_date: Option<NaiveDate>,
) -> (Vec<ValidatedLab>, usize) {
    let fallback_date = document_date.unwrap_or_else(|| Utc::now().date_naive());
    let mut validated = Vec::with_capacity(records.len());
    let mut dropped = 0;

    for record in records {
        match validate_record(record, fallback_date) {
            Some(lab) => validated.push(lab),
            None => dropped += 1,
        }
    }

    (validated, dropped)
}

fn validate_record(record: &Value, fallback_date: NaiveDate) -> Option<ValidatedLab> {
    let test_name = record
        .get("test_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())?
        .to_string();

    let value = numeric_field(record.get("value"))?;

    let unit = record
        .get("unit")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|unit| !unit.is_empty())?
        .to_string();

    let recorded_at = match record.get("recorded_at") {
        None | Some(Value::Null) => fallback_date,
        Some(Value::String(raw)) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?,
        Some(_) => return None,
    };

    let status = record
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| matches!(s.as_str(), "normal" | "high" | "low" | "critical"));

    let test_code = record
        .get("test_code")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_string);

    Some(ValidatedLab {
        test_name,
        test_code,
        value,
        unit,
        reference_min: record.get("reference_min").and_then(numeric_field_opt),
        reference_max: record.get("reference_max").and_then(numeric_field_opt),
        status,
        recorded_at,
    })
}

fn numeric_field(value: Option<&Value>) -> Option<BigDecimal> {
    match value? {
        Value::Number(n) if n.as_f64().is_some_and(f64::is_finite) => {
            BigDecimal::from_str(&n.to_string()).ok()
        }
        _ => None,
    }
}

fn numeric_field_opt(value: &Value) -> Option<BigDecimal> {
    numeric_field(Some(value))
}

async fn persist_lab_results(
    pool: &PgPool,
    document_id: Uuid,
    user_id: Uuid,
    validated: Vec<ValidatedLab>,
    dropped: usize,
) -> Result<(usize, usize), String> {
    let pool = pool.clone();
    task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let mut saved = 0usize;
            let mut skipped = 0usize;
            let mut stored = Vec::with_capacity(validated.len());

            for lab in &validated {
                let row = NewLabResult {
                    id: Uuid::new_v4(),
                    user_id,
                    document_id: Some(document_id),
                    test_name: lab.test_name.clone(),
                    test_code: lab.test_code.clone(),
                    value: lab.value.clone(),
                    unit: lab.unit.clone(),
                    reference_min: lab.reference_min.clone(),
                    reference_max: lab.reference_max.clone(),
                    status: lab.status.clone(),
                    recorded_at: lab.recorded_at,
                };

                // The partial unique indexes enforce the dedup key;
                // conflicts are skipped, never updated.
                let inserted = diesel::insert_into(lab_results::table)
                    .values(&row)
                    .on_conflict_do_nothing()
                    .execute(conn)?;
                if inserted == 1 {
                    saved += 1;
                } else {
                    skipped += 1;
                }

                stored.push(json!({
                    "test_name": lab.test_name,
                    "test_code": lab.test_code,
                    "value": lab.value.to_string(),
                    "unit": lab.unit,
                    "status": lab.status,
                    "recorded_at": lab.recorded_at.to_string(),
                }));
            }

            let parsed_data = json!({
                "lab_results": stored,
                "saved": saved,
                "skipped": skipped,
                "dropped": dropped,
            });

            diesel::update(medical_documents::table.find(document_id))
                .set((
                    medical_documents::parsed_data.eq(Some(parsed_data)),
                    medical_documents::status.eq(document_status::COMPLETED),
                ))
                .execute(conn)?;

            Ok((saved, skipped))
        })
        .map_err(|err| err.to_string())
    })
    .await
    .map_err(|err| format!("persist task panicked: {err}"))?
}

async fn load_document(
    pool: &PgPool,
    document_id: Uuid,
) -> Result<Option<MedicalDocument>, String> {
    let pool = pool.clone();
    task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        medical_documents::table
            .find(document_id)
            .first::<MedicalDocument>(&mut conn)
            .optional()
            .map_err(|err| err.to_string())
    })
    .await
    .map_err(|err| format!("load task panicked: {err}"))?
}

async fn set_status(pool: &PgPool, document_id: Uuid, status: &'static str) -> Result<(), String> {
    let pool = pool.clone();
    task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        diesel::update(medical_documents::table.find(document_id))
            .set(medical_documents::status.eq(status))
            .execute(&mut conn)
            .map(|_| ())
            .map_err(|err| err.to_string())
    })
    .await
    .map_err(|err| format!("status task panicked: {err}"))?
}

/// Advance to `parsed` atomically with writing the stage's artifact.
async fn store_raw_text(pool: &PgPool, document_id: Uuid, raw_text: &str) -> Result<(), String> {
    let pool = pool.clone();
    let raw_text = raw_text.to_string();
    task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        diesel::update(medical_documents::table.find(document_id))
            .set((
                medical_documents::raw_text.eq(Some(raw_text)),
                medical_documents::status.eq(document_status::PARSED),
            ))
            .execute(&mut conn)
            .map(|_| ())
            .map_err(|err| err.to_string())
    })
    .await
    .map_err(|err| format!("raw text task panicked: {err}"))?
}

async fn fail_document(pool: &PgPool, document_id: Uuid, stage: &str, message: &str) {
    let pool = pool.clone();
    let diagnostics = json!({ "error": message, "stage": stage });
    let result = task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| err.to_string())?;
        diesel::update(medical_documents::table.find(document_id))
            .set((
                medical_documents::status.eq(document_status::FAILED),
                medical_documents::parsed_data.eq(Some(diagnostics)),
            ))
            .execute(&mut conn)
            .map(|_| ())
            .map_err(|err| err.to_string())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%document_id, error = %err, "failed to mark document failed"),
        Err(err) => error!(%document_id, error = %err, "fail-document task panicked"),
    }
}

/// Map the document's current status to the stage name used in diagnostics.
async fn current_stage(pool: &PgPool, document_id: Uuid) -> String {
    match load_document(pool, document_id).await {
        Ok(Some(document)) => match document.status.as_str() {
            document_status::UPLOADING | document_status::PARSING => "parsing".to_string(),
            document_status::PARSED | document_status::EXTRACTING => "extracting".to_string(),
            other => other.to_string(),
        },
        _ => "unknown".to_string(),
    }
}
