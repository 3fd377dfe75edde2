//! Object-backend collaborator interface.
//!
//! The server never sees plaintext; a backend only moves opaque container
//! bytes. Uploads go through either a single-shot target (one chunk) or a
//! multipart target (one part per chunk, stitched by `finish_multipart`).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{io, ops::Range, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend object `{0}` not found")]
    NotFound(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("range {start}..{end} is outside an object of {len} bytes")]
    InvalidRange { start: u64, end: u64, len: u64 },
    #[error("invalid upload target: {0}")]
    InvalidTarget(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackendError {
    /// Errors worth retrying for idempotent calls.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Where the bytes of one upload go.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadTarget {
    pub upload_url: String,
    pub auth_token: String,
    /// Bucket id for single-shot targets, multipart id otherwise.
    pub upload_value: String,
    pub multipart: bool,
}

/// A stored object on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub key: String,
}

impl ObjectRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Target for a single-shot upload.
    async fn init_upload(&self) -> BackendResult<UploadTarget>;

    /// Target for a multipart upload of the object `name`.
    async fn init_multipart(&self, name: &str) -> BackendResult<UploadTarget>;

    /// Store `data` as the whole object `name`. Replaces any earlier attempt.
    async fn upload_single(
        &self,
        target: &UploadTarget,
        name: &str,
        data: Bytes,
    ) -> BackendResult<ObjectRef>;

    /// Store part `index`, returning its part id. Replaces any earlier attempt.
    async fn upload_part(
        &self,
        target: &UploadTarget,
        index: u32,
        data: Bytes,
    ) -> BackendResult<String>;

    /// Stitch parts in index order into one object.
    async fn finish_multipart(
        &self,
        target: &UploadTarget,
        part_ids: &[String],
    ) -> BackendResult<ObjectRef>;

    async fn abort_multipart(&self, target: &UploadTarget) -> BackendResult<()>;

    /// Read the half-open byte range `range` of `object`.
    async fn read_range(&self, object: &ObjectRef, range: Range<u64>) -> BackendResult<Bytes>;

    /// Delete `object`. Deleting a missing object succeeds.
    async fn delete(&self, object: &ObjectRef) -> BackendResult<()>;

    /// Readiness check.
    async fn probe(&self) -> BackendResult<()>;
}
