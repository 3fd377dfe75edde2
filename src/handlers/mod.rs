//! HTTP handlers. Request parsing lives here; behavior lives in `services`.

pub mod account_handlers;
pub mod health_handlers;
pub mod transfer_handlers;

use crate::errors::AppError;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
};
use base64::{Engine as _, engine::general_purpose};
use serde::de::DeserializeOwned;

/// Caller identity header.
pub const ACCOUNT_HEADER: &str = "x-account-id";

const MAX_JSON_BODY: usize = 64 * 1024;

/// The account making the request, if any.
pub(crate) fn caller(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn require_caller(headers: &HeaderMap) -> Result<String, AppError> {
    caller(headers).ok_or_else(|| AppError::unauthorized("missing X-Account-Id header"))
}

pub(crate) async fn read_body(body: Body, limit: usize) -> Result<bytes::Bytes, AppError> {
    axum::body::to_bytes(body, limit).await.map_err(|err| {
        AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body rejected: {}", err),
        )
    })
}

pub(crate) async fn read_json<T: DeserializeOwned>(body: Body) -> Result<T, AppError> {
    let bytes = read_body(body, MAX_JSON_BODY).await?;
    serde_json::from_slice(&bytes)
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {}", err)))
}

pub(crate) fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, AppError> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|_| AppError::bad_request(format!("`{}` is not valid base64", field)))
}

pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}
