//! Account handlers: signup, usage, deletion and the billing collaborator.

use super::{decode_b64, read_json, require_caller};
use crate::{
    errors::AppError,
    models::account::{NewAccount, SubscriptionUpdate},
    services::ledger::LedgerError,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Shared secret presented by the billing collaborator.
pub const BILLING_SECRET_HEADER: &str = "x-billing-secret";

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    /// Omitted for anonymous accounts.
    pub email: Option<String>,
    pub login_key: String,
    #[serde(default)]
    pub protected_key: String,
    #[serde(default)]
    pub public_key: String,
    pub password_hint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub id: String,
    pub payment_id: String,
}

/// `POST /account`
pub async fn signup(state: &AppState, body: Body) -> Result<Response, AppError> {
    let req: SignupRequest = read_json(body).await?;
    let login_key = decode_b64("login_key", &req.login_key)?;
    if login_key.is_empty() {
        return Err(AppError::bad_request("`login_key` must not be empty"));
    }
    let password_hint = match req.password_hint.as_deref() {
        Some(_) if req.email.is_none() => return Err(LedgerError::HintRequiresEmail.into()),
        Some(hint) => Some(decode_b64("password_hint", hint)?),
        None => None,
    };

    let account = state
        .ledger
        .create_account(NewAccount {
            email: req.email,
            login_key,
            protected_key: decode_b64("protected_key", &req.protected_key)?,
            public_key: decode_b64("public_key", &req.public_key)?,
            password_hint,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            id: account.id,
            payment_id: account.payment_id,
        }),
    )
        .into_response())
}

/// `GET /account/usage`
pub async fn usage(state: &AppState, headers: &HeaderMap) -> Result<Response, AppError> {
    let account = require_caller(headers)?;
    let usage = state.ledger.usage(&account).await?;
    Ok(Json(usage).into_response())
}

/// `DELETE /account`
///
/// Objects go first so their backend bytes are released.
pub async fn delete_account(state: &AppState, headers: &HeaderMap) -> Result<Response, AppError> {
    let account = require_caller(headers)?;
    state.ledger.get_account(&account).await?;
    let removed = state.objects.purge_owner(&account).await?;
    state.ledger.delete_account(&account).await?;
    tracing::info!(account_id = %account, removed, "account closed");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `POST /billing/subscription`
///
/// Disabled (404) unless a billing secret is configured.
pub async fn billing_subscription(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.billing_secret.as_deref() else {
        return Err(AppError::not_found("billing is not enabled"));
    };
    let presented = headers
        .get(BILLING_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(AppError::unauthorized("invalid billing secret"));
    }

    let update: SubscriptionUpdate = read_json(body).await?;
    state.ledger.set_subscription(&update, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
