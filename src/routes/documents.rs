use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::jobs::{enqueue_job, JOB_PROCESS_DOCUMENT};
use crate::models::{document_status, MedicalDocument, NewMedicalDocument, DOCUMENT_TYPES};
use crate::schema::medical_documents;
use crate::state::AppState;

const LIST_LIMIT: i64 = 50;

const ALLOWED_MIME_TYPES: &[(&str, &str)] = &[
    ("application/pdf", "pdf"),
    ("image/jpeg", "jpg"),
    ("image/jpg", "jpg"),
    ("image/png", "png"),
    ("image/tiff", "tiff"),
    ("image/webp", "webp"),
];

#[derive(Deserialize)]
pub struct DocumentListQuery {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub document_type: String,
    pub file_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<MedicalDocument> for DocumentResponse {
    fn from(doc: MedicalDocument) -> Self {
        Self {
            id: doc.id,
            user_id: doc.user_id,
            title: doc.title,
            document_type: doc.document_type,
            file_type: doc.file_type,
            status: doc.status,
            document_date: doc.document_date,
            parsed_data: doc.parsed_data,
            created_at: doc.created_at,
        }
    }
}

struct UploadFields {
    bytes: Option<Vec<u8>>,
    content_type: Option<String>,
    user_id: Option<Uuid>,
    title: Option<String>,
    document_type: Option<String>,
    document_date: Option<NaiveDate>,
}

/// Accept a medical document for asynchronous ingestion. The row is created
/// in `uploading` state and the pipeline job enqueued; poll
/// `GET /documents/{id}` for progress.
pub async fn upload_document(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    let fields = read_upload_fields(multipart).await?;

    let bytes = fields
        .bytes
        .ok_or_else(|| AppError::bad_request("file field is required"))?;
    let user_id = fields
        .user_id
        .ok_or_else(|| AppError::bad_request("user_id field is required"))?;
    let title = fields
        .title
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("title field is required"))?;
    let document_type = fields
        .document_type
        .ok_or_else(|| AppError::bad_request("document_type field is required"))?;

    if !DOCUMENT_TYPES.contains(&document_type.as_str()) {
        return Err(AppError::bad_request(format!(
            "invalid document_type '{document_type}'. Allowed: {}",
            DOCUMENT_TYPES.join(", ")
        )));
    }

    if bytes.len() as u64 > state.config.max_upload_bytes() {
        return Err(AppError::payload_too_large(format!(
            "file exceeds maximum size of {} MB",
            state.config.max_upload_size_mb
        )));
    }

    let file_type = fields
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let Some((_, extension)) = ALLOWED_MIME_TYPES
        .iter()
        .find(|(mime, _)| mime.eq_ignore_ascii_case(&file_type))
    else {
        return Err(AppError::unsupported_media_type(format!(
            "unsupported file type: {file_type}. Allowed: PDF, JPEG, PNG, TIFF, WebP"
        )));
    };

    let document_id = Uuid::new_v4();
    let storage_key = format!("documents/{document_id}.{extension}");

    state.storage.put_object(&storage_key, bytes).await.map_err(|err| {
        error!(error = %err, key = %storage_key, "failed to store document");
        AppError::internal(format!("failed to store document: {err}"))
    })?;

    let document: MedicalDocument = {
        let mut conn = state.db()?;
        let new_document = NewMedicalDocument {
            id: document_id,
            user_id,
            title,
            document_type,
            file_path: storage_key,
            file_type,
            document_date: fields.document_date,
            status: document_status::UPLOADING.to_string(),
        };
        diesel::insert_into(medical_documents::table)
            .values(&new_document)
            .execute(&mut conn)?;

        if let Err(err) = enqueue_job(
            &mut conn,
            JOB_PROCESS_DOCUMENT,
            json!({ "document_id": document_id }),
            None,
        ) {
            warn!(%document_id, error = %err, "failed to enqueue ingestion job");
        }

        medical_documents::table.find(document_id).first(&mut conn)?
    };

    info!(%document_id, %user_id, "document upload accepted");
    Ok((StatusCode::CREATED, Json(document.into())))
}

pub async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<DocumentListQuery>,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let mut conn = state.db()?;
    let docs: Vec<MedicalDocument> = medical_documents::table
        .filter(medical_documents::user_id.eq(params.user_id))
        .order(medical_documents::created_at.desc())
        .limit(LIST_LIMIT)
        .load(&mut conn)?;
    Ok(Json(docs.into_iter().map(Into::into).collect()))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let mut conn = state.db()?;
    let doc: MedicalDocument = medical_documents::table.find(document_id).first(&mut conn)?;
    Ok(Json(doc.into()))
}

/// Remove the document and its stored file. Lab results extracted from it
/// survive; their document reference is cleared by the store.
pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let file_path = {
        let mut conn = state.db()?;
        let doc: MedicalDocument = medical_documents::table.find(document_id).first(&mut conn)?;
        diesel::delete(medical_documents::table.find(document_id)).execute(&mut conn)?;
        doc.file_path
    };

    if let Err(err) = state.storage.delete_object(&file_path).await {
        warn!(%document_id, error = %err, "failed to delete stored file");
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn read_upload_fields(mut multipart: Multipart) -> AppResult<UploadFields> {
    let mut fields = UploadFields {
        bytes: None,
        content_type: None,
        user_id: None,
        title: None,
        document_type: None,
        document_date: None,
    };

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                fields.content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, "failed to read file bytes");
                    AppError::bad_request(format!("failed to read file bytes: {err}"))
                })?;
                fields.bytes = Some(data.to_vec());
            }
            Some("user_id") => {
                let value = text_field(field, "user_id").await?;
                let parsed = Uuid::parse_str(value.trim())
                    .map_err(|_| AppError::bad_request("user_id must be a valid UUID"))?;
                fields.user_id = Some(parsed);
            }
            Some("title") => {
                fields.title = Some(text_field(field, "title").await?);
            }
            Some("document_type") => {
                fields.document_type = Some(text_field(field, "document_type").await?.trim().to_string());
            }
            Some("document_date") => {
                let value = text_field(field, "document_date").await?;
                if !value.trim().is_empty() {
                    let parsed = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
                        .map_err(|_| {
                            AppError::bad_request("document_date must be in YYYY-MM-DD format")
                        })?;
                    fields.document_date = Some(parsed);
                }
            }
            _ => {}
        }
    }

    Ok(fields)
}

async fn text_field(field: axum::extract::multipart::Field<'_>, name: &str) -> AppResult<String> {
    field
        .text()
        .await
        .map_err(|err| AppError::bad_request(format!("invalid {name} field: {err}")))
}
