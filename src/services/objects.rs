//! Object rows and their lifecycle: lookup, download accounting, removal.
//!
//! Removal always deletes the row first with `DELETE ... RETURNING`, so of
//! several concurrent removers only one goes on to delete backend bytes and
//! refund storage.

use super::{
    backend::{BackendError, ObjectBackend, ObjectRef},
    ledger::{LedgerError, LedgerService},
    retry::{RetryPolicy, with_timeout},
};
use crate::{
    crypto::CryptoError,
    models::{
        object::{ObjectKind, StoredObject},
        upload::{UploadPart, UploadSession},
    },
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) const OBJECT_COLUMNS: &str = "id, owner_id, kind, name, chunks, salt, downloads, \
     expiration, length, object_key, path, state, created_at";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("chunk {index} is out of range for an object of {chunks} chunks")]
    ChunkOutOfRange { index: u64, chunks: u64 },
    #[error("chunk of {0} bytes exceeds the maximum frame size")]
    ChunkTooLarge(usize),
    #[error("finalize declared {got} chunks but the upload declared {declared}")]
    ChunkCountMismatch { declared: u64, got: u64 },
    #[error("upload incomplete: {received} of {declared} chunks received")]
    Incomplete { received: u64, declared: u64 },
    #[error("upload `{0}` is already finalized")]
    AlreadyFinalized(Uuid),
    #[error("finalization of `{0}` is already in progress")]
    FinalizeInProgress(Uuid),
    #[error("chunk {index} of `{id}` is being uploaded by another request")]
    ChunkInProgress { id: Uuid, index: u64 },
    #[error("an account is required for this upload")]
    AccountRequired,
    #[error("object `{0}` belongs to another account")]
    Forbidden(Uuid),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type TransferResult<T> = Result<T, TransferError>;

#[derive(Clone)]
pub struct ObjectRepo {
    pub(crate) db: Arc<SqlitePool>,
    pub(crate) backend: Arc<dyn ObjectBackend>,
    pub(crate) ledger: LedgerService,
    pub(crate) retry: RetryPolicy,
}

impl ObjectRepo {
    pub fn new(
        db: Arc<SqlitePool>,
        backend: Arc<dyn ObjectBackend>,
        ledger: LedgerService,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            backend,
            ledger,
            retry,
        }
    }

    pub async fn fetch(&self, id: Uuid) -> TransferResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| TransferError::NotFound(id.to_string()))
    }

    /// A finalized, unexpired object.
    pub async fn fetch_live(&self, id: Uuid, now: DateTime<Utc>) -> TransferResult<StoredObject> {
        let object = self.fetch(id).await?;
        if !object.is_finalized() || object.is_expired(now) {
            return Err(TransferError::NotFound(id.to_string()));
        }
        Ok(object)
    }

    pub async fn fetch_by_path(&self, path: &str, now: DateTime<Utc>) -> TransferResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE path = ? AND state = 'finalized' AND expiration > ?"
        ))
        .bind(path)
        .bind(now)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| TransferError::NotFound(path.to_string()))
    }

    /// Count one completed download. Deletes the object when none remain.
    ///
    /// Returns the remaining count, `-1` for unlimited objects.
    pub async fn record_download(&self, object: &StoredObject) -> TransferResult<i64> {
        if object.is_unlimited() {
            return Ok(-1);
        }

        let remaining = sqlx::query_scalar::<_, i64>(
            "UPDATE objects SET downloads = downloads - 1
             WHERE id = ? AND downloads > 0
             RETURNING downloads",
        )
        .bind(object.id)
        .fetch_optional(&*self.db)
        .await?;

        match remaining {
            Some(0) => {
                self.remove_where(object.id, "AND downloads = 0").await?;
                Ok(0)
            }
            Some(n) => Ok(n),
            None => {
                debug!(object_id = %object.id, "download limit already exhausted");
                Ok(0)
            }
        }
    }

    /// Delete an object on behalf of its owner.
    pub async fn remove_owned(&self, id: Uuid, owner: &str) -> TransferResult<()> {
        let object = self.fetch(id).await?;
        if object.owner_id.as_deref() != Some(owner) {
            return Err(TransferError::Forbidden(id));
        }
        match self.remove_where(id, "").await? {
            Some(_) => Ok(()),
            None => Err(TransferError::NotFound(id.to_string())),
        }
    }

    /// Delete every object whose expiration has passed.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> TransferResult<u64> {
        let expired: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM objects WHERE expiration <= ?")
                .bind(now)
                .fetch_all(&*self.db)
                .await?;

        let mut removed = 0;
        for id in expired {
            if self.remove_where(id, "").await?.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "reaped expired objects");
        }
        Ok(removed)
    }

    /// Delete every object owned by `owner`, backend bytes included.
    pub async fn purge_owner(&self, owner: &str) -> TransferResult<u64> {
        let owned: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM objects WHERE owner_id = ?")
            .bind(owner)
            .fetch_all(&*self.db)
            .await?;

        let mut removed = 0;
        for id in owned {
            if self.remove_where(id, "").await?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete the row if `id` still matches `condition`, then its bytes.
    async fn remove_where(&self, id: Uuid, condition: &str) -> TransferResult<Option<StoredObject>> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT object_id, upload_url, auth_token, upload_value, multipart, created_at
             FROM uploads WHERE object_id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        let parts = sqlx::query_as::<_, UploadPart>(
            "SELECT object_id, chunk_index, part_id, size_bytes, uploaded_at
             FROM upload_parts WHERE object_id = ? ORDER BY chunk_index",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?;

        let deleted = sqlx::query_as::<_, StoredObject>(&format!(
            "DELETE FROM objects WHERE id = ? {condition} RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        let Some(object) = deleted else {
            return Ok(None);
        };

        self.release_bytes(&object, session, &parts).await;

        if let (ObjectKind::Vault, Some(owner)) = (object.kind, object.owner_id.as_deref()) {
            let stored = if object.is_finalized() {
                object.length
            } else {
                parts.iter().map(|p| p.size_bytes).sum()
            };
            if stored > 0 {
                if let Err(err) = self.ledger.charge_storage(owner, -stored).await {
                    warn!(object_id = %object.id, owner, error = %err, "storage refund failed");
                }
            }
        }

        info!(object_id = %object.id, kind = ?object.kind, "object deleted");
        Ok(Some(object))
    }

    async fn release_bytes(
        &self,
        object: &StoredObject,
        session: Option<UploadSession>,
        parts: &[UploadPart],
    ) {
        let timeout = self.retry.timeout;
        let result = match (&object.object_key, session) {
            (Some(key), _) => with_timeout(timeout, self.backend.delete(&ObjectRef::new(key))).await,
            (None, Some(session)) if session.multipart => {
                with_timeout(timeout, self.backend.abort_multipart(&session.target())).await
            }
            (None, Some(_)) => match parts.first() {
                Some(part) => {
                    with_timeout(timeout, self.backend.delete(&ObjectRef::new(&part.part_id))).await
                }
                None => Ok(()),
            },
            (None, None) => Ok(()),
        };

        if let Err(err) = result {
            warn!(object_id = %object.id, error = %err, "failed to release backend bytes");
        }
    }
}
