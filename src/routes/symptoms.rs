use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{NewSymptomEntry, SymptomEntry};
use crate::schema::symptom_entries;
use crate::state::AppState;

const MAX_SEVERITY: i32 = 10;
const LIST_LIMIT: i64 = 200;

fn default_days() -> i64 {
    30
}

#[derive(Deserialize)]
pub struct CreateSymptomRequest {
    pub user_id: Uuid,
    pub symptom_type: String,
    pub severity: i32,
    pub notes: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub triggers: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct SymptomListQuery {
    pub user_id: Uuid,
    #[serde(default = "default_days")]
    pub days: i64,
    pub symptom_type: Option<String>,
}

#[derive(Deserialize)]
pub struct SymptomTypesQuery {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct SymptomResponse {
    pub id: Uuid,
    pub symptom_type: String,
    pub severity: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<SymptomEntry> for SymptomResponse {
    fn from(entry: SymptomEntry) -> Self {
        Self {
            id: entry.id,
            symptom_type: entry.symptom_type,
            severity: entry.severity,
            notes: entry.notes,
            recorded_at: entry.recorded_at,
            duration_minutes: entry.duration_minutes,
            triggers: entry.triggers,
            created_at: entry.created_at,
        }
    }
}

pub async fn create_symptom(
    State(state): State<AppState>,
    Json(payload): Json<CreateSymptomRequest>,
) -> AppResult<(StatusCode, Json<SymptomResponse>)> {
    let symptom_type = payload.symptom_type.trim().to_string();
    if symptom_type.is_empty() {
        return Err(AppError::bad_request("symptom_type must not be empty"));
    }
    if !(0..=MAX_SEVERITY).contains(&payload.severity) {
        return Err(AppError::bad_request(format!(
            "severity must be between 0 and {MAX_SEVERITY}"
        )));
    }
    if let Some(duration) = payload.duration_minutes {
        if duration < 0 {
            return Err(AppError::bad_request("duration_minutes must not be negative"));
        }
    }

    let mut conn = state.db()?;
    let entry = NewSymptomEntry {
        id: Uuid::new_v4(),
        user_id: payload.user_id,
        symptom_type,
        severity: payload.severity,
        notes: payload.notes,
        recorded_at: payload.recorded_at.unwrap_or_else(Utc::now),
        duration_minutes: payload.duration_minutes,
        triggers: payload.triggers.map(|t| serde_json::json!(t)),
    };
    diesel::insert_into(symptom_entries::table)
        .values(&entry)
        .execute(&mut conn)?;

    let created: SymptomEntry = symptom_entries::table.find(entry.id).first(&mut conn)?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

pub async fn list_symptoms(
    State(state): State<AppState>,
    Query(params): Query<SymptomListQuery>,
) -> AppResult<Json<Vec<SymptomResponse>>> {
    let mut conn = state.db()?;
    let cutoff = Utc::now() - Duration::days(params.days.max(0));

    let mut query = symptom_entries::table
        .filter(symptom_entries::user_id.eq(params.user_id))
        .filter(symptom_entries::recorded_at.ge(cutoff))
        .order(symptom_entries::recorded_at.desc())
        .limit(LIST_LIMIT)
        .into_boxed();

    if let Some(symptom) = params.symptom_type.as_deref() {
        query = query.filter(symptom_entries::symptom_type.eq(symptom));
    }

    let rows: Vec<SymptomEntry> = query.load(&mut conn)?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

pub async fn list_symptom_types(
    State(state): State<AppState>,
    Query(params): Query<SymptomTypesQuery>,
) -> AppResult<Json<Vec<String>>> {
    let mut conn = state.db()?;
    let types: Vec<String> = symptom_entries::table
        .filter(symptom_entries::user_id.eq(params.user_id))
        .select(symptom_entries::symptom_type)
        .distinct()
        .order(symptom_entries::symptom_type.asc())
        .load(&mut conn)?;
    Ok(Json(types))
}
