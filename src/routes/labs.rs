use axum::extract::{Path, Query, State};
use axum::Json;
use bigdecimal::ToPrimitive;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::LabResult;
use crate::schema::lab_results;
use crate::state::AppState;
use crate::tools::queries;

fn default_days() -> i64 {
    90
}

fn default_months() -> i64 {
    12
}

#[derive(Deserialize)]
pub struct LabListQuery {
    pub user_id: Uuid,
    #[serde(default = "default_days")]
    pub days: i64,
    pub test_name: Option<String>,
}

#[derive(Deserialize)]
pub struct LabTrendQuery {
    pub user_id: Uuid,
    #[serde(default = "default_months")]
    pub months: i64,
}

#[derive(Deserialize)]
pub struct TestNamesQuery {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct LabResponse {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
    pub test_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_code: Option<String>,
    pub value: Option<f64>,
    pub unit: String,
    pub reference_min: Option<f64>,
    pub reference_max: Option<f64>,
    pub status: Option<String>,
    pub recorded_at: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl From<LabResult> for LabResponse {
    fn from(lab: LabResult) -> Self {
        Self {
            id: lab.id,
            document_id: lab.document_id,
            test_name: lab.test_name,
            test_code: lab.test_code,
            value: lab.value.to_f64(),
            unit: lab.unit,
            reference_min: lab.reference_min.as_ref().and_then(|v| v.to_f64()),
            reference_max: lab.reference_max.as_ref().and_then(|v| v.to_f64()),
            status: lab.status,
            recorded_at: lab.recorded_at,
            created_at: lab.created_at,
        }
    }
}

pub async fn list_labs(
    State(state): State<AppState>,
    Query(params): Query<LabListQuery>,
) -> AppResult<Json<Vec<LabResponse>>> {
    let mut conn = state.db()?;

    if params.days <= 0 {
        return Ok(Json(Vec::new()));
    }

    let cutoff = Utc::now().date_naive() - Duration::days(params.days);
    let mut query = lab_results::table
        .filter(lab_results::user_id.eq(params.user_id))
        .filter(lab_results::recorded_at.ge(cutoff))
        .order((lab_results::recorded_at.desc(), lab_results::test_name.asc()))
        .limit(queries::RECENT_LABS_CAP)
        .into_boxed();

    if let Some(name) = params.test_name.as_deref() {
        query = query.filter(lab_results::test_name.ilike(format!("%{name}%")));
    }

    let rows: Vec<LabResult> = query.load(&mut conn)?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Same shape as the `get_lab_trend` chat tool.
pub async fn get_lab_trend(
    State(state): State<AppState>,
    Path(test_name): Path<String>,
    Query(params): Query<LabTrendQuery>,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let trend = queries::lab_trend(&mut conn, params.user_id, &test_name, params.months)?;
    Ok(Json(trend))
}

pub async fn list_test_names(
    State(state): State<AppState>,
    Query(params): Query<TestNamesQuery>,
) -> AppResult<Json<Vec<String>>> {
    let mut conn = state.db()?;
    let names: Vec<String> = lab_results::table
        .filter(lab_results::user_id.eq(params.user_id))
        .select(lab_results::test_name)
        .distinct()
        .order(lab_results::test_name.asc())
        .load(&mut conn)?;
    Ok(Json(names))
}
