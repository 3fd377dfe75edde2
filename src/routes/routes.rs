//! Defines the HTTP surface.
//!
//! ## Structure
//! - **Health endpoints** (axum routes)
//!   - `GET    /healthz` liveness
//!   - `GET    /readyz`  database and backend readiness
//!
//! - **Transfer endpoints** (segment dispatcher)
//!   - `POST   /u`       declare an upload
//!   - `POST   /u/*/*`   upload chunk `{index}` of object `{id}`
//!   - `DELETE /u/*`     owner deletes an object
//!   - `GET    /d/*`     metadata by public path
//!   - `GET    /d/*/*`   one ciphertext frame
//!   - `GET    /*`       share link, same body as `/d/*`
//!
//! - **Account endpoints**
//!   - `POST   /account`              signup
//!   - `GET    /account/usage`        quota usage
//!   - `DELETE /account`              close the account
//!   - `POST   /billing/subscription` billing collaborator
//!
//! Everything except the health endpoints goes through the axum fallback,
//! which resolves the path with [`Dispatcher`] so a share link at the root
//! never shadows a reserved prefix.

use super::dispatch::Dispatcher;
use crate::{
    errors::AppError,
    handlers::{
        account_handlers::{billing_subscription, delete_account, signup, usage},
        health_handlers::{healthz, readyz},
        transfer_handlers::{
            delete_object, download_chunk, initiate_upload, object_info, upload_chunk,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::get,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    InitiateUpload,
    UploadChunk,
    DeleteObject,
    ObjectInfo,
    DownloadChunk,
    ShareLink,
    Signup,
    Usage,
    DeleteAccount,
    Billing,
}

pub fn dispatcher() -> Dispatcher<Endpoint> {
    Dispatcher::new()
        .route(Method::POST, "/u", Endpoint::InitiateUpload)
        .route(Method::POST, "/u/*/*", Endpoint::UploadChunk)
        .route(Method::DELETE, "/u/*", Endpoint::DeleteObject)
        .route(Method::GET, "/d/*", Endpoint::ObjectInfo)
        .route(Method::GET, "/d/*/*", Endpoint::DownloadChunk)
        .route(Method::GET, "/*", Endpoint::ShareLink)
        .route(Method::POST, "/account", Endpoint::Signup)
        .route(Method::GET, "/account/usage", Endpoint::Usage)
        .route(Method::DELETE, "/account", Endpoint::DeleteAccount)
        .route(Method::POST, "/billing/subscription", Endpoint::Billing)
        .reserve("healthz")
        .reserve("readyz")
}

pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .fallback(dispatch)
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = uri.path();
    let Some(matched) = state.dispatcher.resolve(&method, path) else {
        tracing::debug!(%method, path, "no route");
        return AppError::not_found(format!("no route for {} {}", method, path)).into_response();
    };

    let result = match (matched.endpoint, matched.params.as_slice()) {
        (Endpoint::InitiateUpload, []) => initiate_upload(&state, &headers, body).await,
        (Endpoint::UploadChunk, [id, index]) => upload_chunk(&state, id, index, body).await,
        (Endpoint::DeleteObject, [id]) => delete_object(&state, &headers, id).await,
        (Endpoint::ObjectInfo | Endpoint::ShareLink, [path]) => object_info(&state, path).await,
        (Endpoint::DownloadChunk, [path, index]) => download_chunk(&state, path, index).await,
        (Endpoint::Signup, []) => signup(&state, body).await,
        (Endpoint::Usage, []) => usage(&state, &headers).await,
        (Endpoint::DeleteAccount, []) => delete_account(&state, &headers).await,
        (Endpoint::Billing, []) => billing_subscription(&state, &headers, body).await,
        (endpoint, params) => Err(AppError::internal(format!(
            "{:?} registered with {} parameters",
            endpoint,
            params.len()
        ))),
    };

    result.unwrap_or_else(IntoResponse::into_response)
}
