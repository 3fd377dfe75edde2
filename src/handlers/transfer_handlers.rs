//! Upload and download handlers.
//!
//! Binary fields travel as standard base64 inside JSON. Chunk bodies are raw
//! ciphertext frames.

use super::{caller, decode_b64, encode_b64, read_body, read_json, require_caller};
use crate::{
    errors::AppError,
    models::object::ObjectKind,
    services::{
        download_service::DownloadInfo,
        upload_service::{MAX_CHUNK_BODY, NewUpload},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Remaining downloads, sent with the last frame of a limited object.
pub const DOWNLOADS_HEADER: &str = "downloads";
pub const EXPIRATION_HEADER: &str = "expiration";

fn default_downloads() -> i64 {
    -1
}

fn default_kind() -> ObjectKind {
    ObjectKind::Send
}

#[derive(Debug, Deserialize)]
pub struct InitiateUploadRequest {
    /// Encrypted display name, base64.
    pub name: String,
    pub chunks: u64,
    /// Container salt, base64.
    pub salt: String,
    #[serde(default = "default_downloads")]
    pub downloads: i64,
    /// Lifetime such as `7d`, `12h` or `30m`.
    pub expiration: String,
    #[serde(default = "default_kind")]
    pub kind: ObjectKind,
}

#[derive(Debug, Serialize)]
pub struct InitiateUploadResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ObjectInfoResponse {
    pub id: Uuid,
    pub name: String,
    pub chunks: u64,
    pub salt: String,
    pub size: u64,
    pub kind: ObjectKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads: Option<i64>,
    pub expiration: DateTime<Utc>,
}

impl From<DownloadInfo> for ObjectInfoResponse {
    fn from(info: DownloadInfo) -> Self {
        Self {
            id: info.id,
            name: encode_b64(&info.name),
            chunks: info.chunks,
            salt: encode_b64(&info.salt),
            size: info.size,
            kind: info.kind,
            downloads: info.downloads,
            expiration: info.expiration,
        }
    }
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::not_found(format!("no object `{}`", raw)))
}

pub(crate) fn parse_index(raw: &str) -> Result<u64, AppError> {
    raw.parse::<u64>()
        .map_err(|_| AppError::bad_request(format!("chunk index `{}` is not a number", raw)))
}

/// `POST /u`
pub async fn initiate_upload(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let req: InitiateUploadRequest = read_json(body).await?;
    let owner = caller(headers);

    let upload = NewUpload {
        name: decode_b64("name", &req.name)?,
        chunks: req.chunks,
        salt: decode_b64("salt", &req.salt)?,
        downloads: req.downloads,
        expires_in: state.uploads.expiry(&req.expiration)?,
        kind: req.kind,
    };
    let id = state.uploads.initiate(owner.as_deref(), upload).await?;

    Ok((StatusCode::CREATED, Json(InitiateUploadResponse { id })).into_response())
}

/// `POST /u/{id}/{index}`
pub async fn upload_chunk(
    state: &AppState,
    id: &str,
    index: &str,
    body: Body,
) -> Result<Response, AppError> {
    let id = parse_id(id)?;
    let index = parse_index(index)?;
    let data = read_body(body, MAX_CHUNK_BODY).await?;

    let receipt = state.uploads.accept_chunk(id, index, data).await?;
    Ok(Json(receipt).into_response())
}

/// `DELETE /u/{id}`
pub async fn delete_object(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
) -> Result<Response, AppError> {
    let owner = require_caller(headers)?;
    let id = parse_id(id)?;
    state.objects.remove_owned(id, &owner).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /d/{path}` and `GET /{path}`
pub async fn object_info(state: &AppState, path: &str) -> Result<Response, AppError> {
    let info = state.downloads.metadata_by_path(path).await?;
    Ok(Json(ObjectInfoResponse::from(info)).into_response())
}

/// `GET /d/{path}/{index}`
///
/// The last frame carries `Downloads` (absent when unlimited) and `Expiration`.
pub async fn download_chunk(
    state: &AppState,
    path: &str,
    index: &str,
) -> Result<Response, AppError> {
    let index = parse_index(index)?;
    let info = state.downloads.metadata_by_path(path).await?;
    let chunk = state.downloads.fetch_chunk(info.id, index).await?;

    let mut response = Response::new(Body::from(chunk.bytes));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if chunk.is_last {
        if let Some(remaining) = chunk.remaining {
            headers.insert(DOWNLOADS_HEADER, HeaderValue::from(remaining));
        }
        let expiration = chunk.expiration.to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Ok(value) = HeaderValue::from_str(&expiration) {
            headers.insert(EXPIRATION_HEADER, value);
        }
    }
    Ok(response)
}
