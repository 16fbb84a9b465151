//! Upload Routes
//!
//! HTTP endpoints for the chunked backup protocol.
//!
//! Endpoints:
//! - POST /api/v1/uploads/start - Open a session for one file
//! - PUT /api/v1/uploads/:session_id/chunks/:index - Upload a chunk (raw body)
//! - GET /api/v1/uploads/:session_id - Get session status
//! - DELETE /api/v1/uploads/:session_id - Cancel upload
//! - POST /api/v1/backups/finalize - Assemble and commit a version

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequest, Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;

use crate::auth::AuthenticatedClient;
use crate::error::AppError;
use crate::state::AppState;
use crate::upload::{
    BackupSummary, ChunkUploadResponse, FinalizeRequest, SessionSnapshot, StartUploadRequest,
    StartUploadResponse, UploadError,
};

/// Optional per-chunk SHA-256 supplied by the client
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    code: &'static str,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_chunks: Option<Vec<u32>>,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Upload request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Upload request rejected");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            retryable: self.is_retryable(),
            missing_chunks: match &self {
                UploadError::IncompleteUpload { missing, .. } => Some(missing.clone()),
                _ => None,
            },
        });

        (status, body).into_response()
    }
}

/// JSON body whose rejections use the upload error body
struct UploadJson<T>(T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for UploadJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = UploadError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(UploadError::Validation(rejection.body_text())),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/uploads/start", post(start_upload))
        .route("/uploads/:session_id", get(get_session).delete(cancel_session))
        .route("/uploads/:session_id/chunks/:index", put(upload_chunk))
        .route("/backups/finalize", post(finalize_backup))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/uploads/start
///
/// Open an upload session for one file. Allocates the next version of the
/// backup set unless the request names a pending version to join.
async fn start_upload(
    State(state): State<AppState>,
    client: AuthenticatedClient,
    UploadJson(request): UploadJson<StartUploadRequest>,
) -> Result<(StatusCode, Json<StartUploadResponse>), AppError> {
    let response = state
        .uploads()
        .start_session(&client.client_id, request)
        .await?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// PUT /api/v1/uploads/:session_id/chunks/:index
///
/// Upload a single chunk. The chunk data is the raw request body.
async fn upload_chunk(
    State(state): State<AppState>,
    client: AuthenticatedClient,
    Path((session_id, chunk_index)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkUploadResponse>, AppError> {
    if body.is_empty() {
        return Err(UploadError::Validation("chunk body is empty".to_string()).into());
    }

    let chunk_checksum = headers
        .get(CHUNK_CHECKSUM_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty());

    let response = state
        .uploads()
        .receive_chunk(
            &client.client_id,
            &session_id,
            chunk_index,
            &body,
            chunk_checksum,
        )
        .await?;

    Ok(Json(response))
}

/// GET /api/v1/uploads/:session_id
async fn get_session(
    State(state): State<AppState>,
    client: AuthenticatedClient,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = state
        .uploads()
        .session_status(&client.client_id, &session_id)
        .await?;

    Ok(Json(snapshot))
}

/// DELETE /api/v1/uploads/:session_id
async fn cancel_session(
    State(state): State<AppState>,
    client: AuthenticatedClient,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .uploads()
        .cancel_session(&client.client_id, &session_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/backups/finalize
///
/// Assemble, verify and commit every file of a pending version.
async fn finalize_backup(
    State(state): State<AppState>,
    client: AuthenticatedClient,
    UploadJson(request): UploadJson<FinalizeRequest>,
) -> Result<Json<BackupSummary>, AppError> {
    let backup_name = request
        .backup_name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| UploadError::Validation("backupName is required".to_string()))?;
    let version = request
        .version
        .ok_or_else(|| UploadError::Validation("version is required".to_string()))?;

    let summary = state
        .uploads()
        .finalize(&client.client_id, backup_name.trim(), version)
        .await?;

    Ok(Json(summary))
}

// ============================================================================
// Tests
// ============================================================================
