//! HTTP handlers for the upload gateway and object reads.
//!
//! The upload handler goes through the write-only [`UploadStore`] handle and
//! answers as soon as the store write is committed; it never waits on the
//! notification bridge or the queue.

use crate::{errors::AppError, models::object::ObjectVersion, state::AppState};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    /// Caller-supplied object key; a random token is generated when absent.
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub key: String,
    pub version_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "versionId")]
    pub version_id: Option<String>,
}

/// `POST /` — upload a single binary payload.
///
/// Returns `200 {"key", "versionId"}` once the write is durably committed.
/// Empty bodies are rejected with 400; bodies over the configured limit are
/// rejected with 413 by the body-limit layer before this handler runs.
pub async fn upload_image(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>, AppError> {
    if body.is_empty() {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "empty upload body"));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let key = query
        .key
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let stream = futures::stream::iter([Ok::<_, std::io::Error>(body)]);
    let object = state.uploads.put(&key, content_type, stream).await?;

    Ok(Json(UploadResponse {
        key: object.key,
        version_id: format!("v{}", object.version_no),
    }))
}

/// `GET /objects/{*key}` — stream the latest version, or a specific one via
/// `?versionId=vN`.
pub async fn download_image(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let (meta, file) = match query.version_id.as_deref() {
        Some(version_id) => state.storage.get_version(&key, version_id).await?,
        None => state.storage.get_latest(&key).await?,
    };

    let stream = ReaderStream::new(file);
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// One entry of the `GET /versions/{*key}` listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub version_id: String,
    pub size_bytes: i64,
    pub etag: String,
    pub content_type: Option<String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct VersionListResponse {
    pub key: String,
    pub versions: Vec<VersionSummary>,
}

/// `GET /versions/{*key}` — list all stored versions of a key, oldest first.
pub async fn list_versions(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<VersionListResponse>, AppError> {
    let versions = state.storage.list_versions(&key).await?;
    Ok(Json(VersionListResponse {
        key,
        versions: versions
            .into_iter()
            .map(|v| VersionSummary {
                version_id: v.version_id(),
                size_bytes: v.size_bytes,
                etag: v.etag,
                content_type: v.content_type,
                last_modified: v.created_at,
            })
            .collect(),
    }))
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectVersion) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    let quoted = format!("\"{}\"", meta.etag);
    if let Ok(value) = HeaderValue::from_str(&quoted) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.version_id()) {
        headers.insert(HeaderName::from_static("x-version-id"), value);
    }

    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&meta.created_at.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
}
