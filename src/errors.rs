use crate::{
    crypto::CryptoError,
    services::{backend::BackendError, ledger::LedgerError, objects::TransferError},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    /// Log the detail and hide it from the client.
    fn opaque(status: StatusCode, detail: impl fmt::Display) -> Self {
        tracing::error!(status = status.as_u16(), error = %detail, "request failed");
        Self::new(status, status.canonical_reason().unwrap_or("error"))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::opaque(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

impl From<CryptoError> for AppError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailure => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            CryptoError::ChunkTooLarge(_) => Self::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string()),
            CryptoError::InvalidContainer(_) => Self::bad_request(err.to_string()),
            CryptoError::SealFailure | CryptoError::KeyDerivation(_) => {
                Self::opaque(StatusCode::INTERNAL_SERVER_ERROR, err)
            }
        }
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(_) => Self::not_found(err.to_string()),
            BackendError::Unavailable(_) | BackendError::Timeout(_) => {
                Self::opaque(StatusCode::SERVICE_UNAVAILABLE, err)
            }
            BackendError::InvalidRange { .. } | BackendError::InvalidTarget(_) => {
                Self::opaque(StatusCode::BAD_GATEWAY, err)
            }
            BackendError::Io(_) if err.is_transient() => {
                Self::opaque(StatusCode::SERVICE_UNAVAILABLE, err)
            }
            BackendError::Io(_) => Self::opaque(StatusCode::INTERNAL_SERVER_ERROR, err),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let status = match err {
            LedgerError::AccountNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::AccountExists | LedgerError::SubscriptionActive => StatusCode::CONFLICT,
            LedgerError::AccountLimitReached => StatusCode::FORBIDDEN,
            LedgerError::StorageExceeded | LedgerError::SendExceeded => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            LedgerError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            LedgerError::HintRequiresEmail | LedgerError::UnknownTier(_) => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::IdentifierExhausted | LedgerError::Hash(_) | LedgerError::Sqlx(_) => {
                return Self::opaque(StatusCode::INTERNAL_SERVER_ERROR, err);
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        let status = match err {
            TransferError::Ledger(inner) => return inner.into(),
            TransferError::Crypto(inner) => return inner.into(),
            TransferError::Backend(inner) => return inner.into(),
            TransferError::Sqlx(_) | TransferError::Internal(_) => {
                return Self::opaque(StatusCode::INTERNAL_SERVER_ERROR, err);
            }
            TransferError::NotFound(_) => StatusCode::NOT_FOUND,
            TransferError::InvalidRequest(_)
            | TransferError::ChunkOutOfRange { .. }
            | TransferError::ChunkCountMismatch { .. }
            | TransferError::Incomplete { .. } => StatusCode::BAD_REQUEST,
            TransferError::ChunkTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            TransferError::AlreadyFinalized(_)
            | TransferError::FinalizeInProgress(_)
            | TransferError::ChunkInProgress { .. } => StatusCode::CONFLICT,
            TransferError::AccountRequired => StatusCode::UNAUTHORIZED,
            TransferError::Forbidden(_) => StatusCode::FORBIDDEN,
        };
        Self::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(AppError, StatusCode)> = vec![
            (LedgerError::StorageExceeded.into(), StatusCode::PAYLOAD_TOO_LARGE),
            (LedgerError::AccountLimitReached.into(), StatusCode::FORBIDDEN),
            (LedgerError::AccountExists.into(), StatusCode::CONFLICT),
            (CryptoError::AuthenticationFailure.into(), StatusCode::UNPROCESSABLE_ENTITY),
            (
                BackendError::Unavailable("down".into()).into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                TransferError::ChunkCountMismatch { declared: 3, got: 2 }.into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                TransferError::FinalizeInProgress(uuid::Uuid::nil()).into(),
                StatusCode::CONFLICT,
            ),
            (
                TransferError::Ledger(LedgerError::SendExceeded).into(),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (TransferError::NotFound("x".into()).into(), StatusCode::NOT_FOUND),
        ];
        for (err, status) in cases {
            assert_eq!(err.status, status, "{}", err.message);
        }
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err: AppError = TransferError::Internal("secret detail".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("secret"));
    }
}
