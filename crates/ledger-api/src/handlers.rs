//! Collection route handlers.
//!
//! Handlers stay thin: authenticate, resolve the collection, parse the body
//! into a [`WritePayload`], and hand off to the coordinator.

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use ledger_core::{Collection, WritePayload};
use ledger_db::health_check;

use crate::auth::RequireAuth;
use crate::error::ApiError;
use crate::AppState;

const DEFAULT_AUDIT_LIMIT: i64 = 100;
const MAX_AUDIT_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// Liveness plus a database round-trip.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match health_check(state.db.pool()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable", "error": e.kind() })),
        ),
    }
}

/// `GET /api/:collection`
pub async fn list_collection(
    State(state): State<AppState>,
    _auth: RequireAuth,
    Path(collection): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<JsonValue>, ApiError> {
    let body = match Collection::resolve(&collection)? {
        Collection::Entity(schema) => {
            serde_json::to_value(state.db.records.list(schema).await?)
                .map_err(ledger_core::Error::from)?
        }
        Collection::AuditLogs => {
            let limit = params
                .limit
                .unwrap_or(DEFAULT_AUDIT_LIMIT)
                .clamp(1, MAX_AUDIT_LIMIT);
            serde_json::to_value(state.db.audit.list_recent(limit).await?)
                .map_err(ledger_core::Error::from)?
        }
    };
    Ok(Json(body))
}

/// `POST /api/:collection`
pub async fn create_record(
    State(state): State<AppState>,
    auth: RequireAuth,
    Path(collection): Path<String>,
    WriteBody(payload): WriteBody,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .coordinator
        .create(&collection, payload, &auth.principal)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// `PUT /api/:collection/:id`
pub async fn update_record(
    State(state): State<AppState>,
    auth: RequireAuth,
    Path((collection, id)): Path<(String, String)>,
    WriteBody(payload): WriteBody,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let outcome = state
        .coordinator
        .update(&collection, id, payload, &auth.principal)
        .await?;
    Ok((StatusCode::OK, Json(outcome)))
}

/// `DELETE /api/:collection/:id`
pub async fn delete_record(
    State(state): State<AppState>,
    auth: RequireAuth,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state
        .coordinator
        .delete(&collection, id, &auth.principal)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid id: {}", raw)))
}

// =============================================================================
// REQUEST BODY
// =============================================================================

/// Create/update body: a JSON object, or `multipart/form-data` where text
/// parts are fields and file parts are uploads.
pub struct WriteBody(pub WritePayload);

#[axum::async_trait]
impl<S: Send + Sync> FromRequest<S> for WriteBody {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));

        if is_multipart {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            return payload_from_multipart(multipart).await.map(WriteBody);
        }

        let Json(value) = Json::<JsonValue>::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        payload_from_json(value).map(WriteBody)
    }
}

fn payload_from_json(value: JsonValue) -> Result<WritePayload, ApiError> {
    match value {
        JsonValue::Object(fields) => Ok(WritePayload::from_fields(fields)),
        _ => Err(ApiError::BadRequest(
            "Request body must be a JSON object".to_string(),
        )),
    }
}

async fn payload_from_multipart(mut multipart: Multipart) -> Result<WritePayload, ApiError> {
    let mut fields = Map::new();
    let mut payload = WritePayload::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Multipart error: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Read error: {}", e)))?;
                // Browsers send an empty part when no file was chosen.
                if bytes.is_empty() && file_name.is_empty() {
                    continue;
                }
                payload = payload.with_upload(name, file_name, bytes.to_vec());
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Read error: {}", e)))?;
                fields.insert(name, JsonValue::String(text));
            }
        }
    }

    debug!(
        subsystem = "api",
        component = "handlers",
        fields = fields.len(),
        uploads = payload.uploads.len(),
        "Parsed multipart body"
    );
    payload.fields = fields;
    Ok(payload)
}
