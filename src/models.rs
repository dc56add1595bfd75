use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = chat_sessions)]
#[diesel(belongs_to(User))]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chat_sessions)]
pub struct NewChatSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = chat_messages)]
#[diesel(belongs_to(ChatSession, foreign_key = session_id))]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chat_messages)]
pub struct NewChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

/// Document ingestion states. Transitions only move forward or to FAILED.
pub mod document_status {
    pub const UPLOADING: &str = "uploading";
    pub const PARSING: &str = "parsing";
    pub const PARSED: &str = "parsed";
    pub const EXTRACTING: &str = "extracting";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

pub const DOCUMENT_TYPES: &[&str] = &["lab_report", "prescription", "imaging", "other"];

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = medical_documents)]
#[diesel(belongs_to(User))]
pub struct MedicalDocument {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub document_type: String,
    pub file_path: String,
    pub file_type: String,
    pub raw_text: Option<String>,
    pub parsed_data: Option<serde_json::Value>,
    pub document_date: Option<NaiveDate>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = medical_documents)]
pub struct NewMedicalDocument {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub document_type: String,
    pub file_path: String,
    pub file_type: String,
    pub document_date: Option<NaiveDate>,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = lab_results)]
#[diesel(belongs_to(MedicalDocument, foreign_key = document_id))]
pub struct LabResult {
    pub id: Uuid,
    pub user_id: Uuid,
    pub document_id: Option<Uuid>,
    pub test_name: String,
    pub test_code: Option<String>,
    pub value: BigDecimal,
    pub unit: String,
    pub reference_min: Option<BigDecimal>,
    pub reference_max: Option<BigDecimal>,
    pub status: Option<String>,
    pub recorded_at: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = lab_results)]
pub struct NewLabResult {
    pub id: Uuid,
    pub user_id: Uuid,
    pub document_id: Option<Uuid>,
    pub test_name: String,
    pub test_code: Option<String>,
    pub value: BigDecimal,
    pub unit: String,
    pub reference_min: Option<BigDecimal>,
    pub reference_max: Option<BigDecimal>,
    pub status: Option<String>,
    pub recorded_at: NaiveDate,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = symptom_entries)]
#[diesel(belongs_to(User))]
pub struct SymptomEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symptom_type: String,
    pub severity: i32,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub duration_minutes: Option<i32>,
    pub triggers: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = symptom_entries)]
pub struct NewSymptomEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symptom_type: String,
    pub severity: i32,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub duration_minutes: Option<i32>,
    pub triggers: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = series_types)]
pub struct SeriesType {
    pub id: Uuid,
    pub code: String,
    pub unit: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = wearable_samples)]
#[diesel(belongs_to(SeriesType))]
pub struct WearableSample {
    pub id: Uuid,
    pub user_id: Uuid,
    pub series_type_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = wearable_samples)]
pub struct NewWearableSample {
    pub id: Uuid,
    pub user_id: Uuid,
    pub series_type_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub run_after: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = active_chat_streams)]
pub struct NewActiveChatStream {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}
