//! Upload sessions: `uploading -> finalizing -> finalized`.
//!
//! Each chunk is charged to its owner before it reaches the backend and
//! refunded if the backend call fails. Attempts on the same chunk index hold
//! a lease row in `chunk_leases`, so the read of the previous size, the
//! charge and the part record never interleave. The chunk that completes the set
//! triggers finalization; exactly one caller wins the transition into
//! `finalizing` and stitches the object, everyone else waits for the path.

use super::{
    backend::{ObjectBackend, UploadTarget},
    ledger::LedgerService,
    objects::{ObjectRepo, TransferError, TransferResult},
    retry::with_timeout,
};
use crate::{
    crypto::{FRAME_SIZE, KEY_SIZE, container::ContainerLayout},
    db::violates_unique,
    models::{
        object::{ObjectKind, ObjectState, StoredObject},
        upload::{UploadPart, UploadSession},
    },
};
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest body accepted for one chunk: a full frame plus the trailing salt.
pub const MAX_CHUNK_BODY: usize = FRAME_SIZE + KEY_SIZE;

const PATH_LEN: usize = 12;
const PATH_ATTEMPTS: usize = 5;
const FINALIZE_POLL: Duration = Duration::from_millis(50);

/// A declared upload, binary fields already decoded.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub name: Vec<u8>,
    pub chunks: u64,
    pub salt: Vec<u8>,
    pub downloads: i64,
    pub expires_in: ChronoDuration,
    pub kind: ObjectKind,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub id: Uuid,
    pub index: u64,
    pub acknowledged: u64,
    pub chunks: u64,
    /// Set once the upload is finalized.
    pub path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Second-granularity expirations are only accepted in debug mode.
    pub debug: bool,
    /// How long a losing finalizer, or a contended chunk, waits.
    pub finalize_wait: Duration,
    /// Lifetime of a chunk lease. Outlives one backend call.
    pub chunk_lease: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            debug: false,
            finalize_wait: Duration::from_secs(30),
            chunk_lease: Duration::from_secs(60),
        }
    }
}

/// Parse `<n>d`, `<n>h`, `<n>m` (and `<n>s` in debug mode).
pub fn parse_expiry(raw: &str, debug: bool) -> TransferResult<ChronoDuration> {
    let raw = raw.trim();
    let invalid = || TransferError::InvalidRequest(format!("invalid expiration `{raw}`"));

    let unit = raw.chars().last().ok_or_else(invalid)?;
    let amount: i64 = raw[..raw.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }

    let duration = match unit {
        'd' => ChronoDuration::try_days(amount),
        'h' => ChronoDuration::try_hours(amount),
        'm' => ChronoDuration::try_minutes(amount),
        's' if debug => ChronoDuration::try_seconds(amount),
        _ => None,
    };
    duration.ok_or_else(invalid)
}

#[derive(Clone)]
pub struct UploadService {
    db: Arc<SqlitePool>,
    backend: Arc<dyn ObjectBackend>,
    ledger: LedgerService,
    objects: ObjectRepo,
    settings: UploadSettings,
}

impl UploadService {
    pub fn new(objects: ObjectRepo, settings: UploadSettings) -> Self {
        Self {
            db: objects.db.clone(),
            backend: objects.backend.clone(),
            ledger: objects.ledger.clone(),
            objects,
            settings,
        }
    }

    pub fn expiry(&self, raw: &str) -> TransferResult<ChronoDuration> {
        parse_expiry(raw, self.settings.debug)
    }

    /// Declare an upload and obtain its backend target.
    pub async fn initiate(&self, owner: Option<&str>, upload: NewUpload) -> TransferResult<Uuid> {
        if upload.chunks == 0 {
            return Err(TransferError::InvalidRequest(
                "an upload needs at least one chunk".into(),
            ));
        }
        if upload.downloads != -1 && upload.downloads < 1 {
            return Err(TransferError::InvalidRequest(
                "download limit must be -1 or at least 1".into(),
            ));
        }
        if upload.salt.len() != KEY_SIZE {
            return Err(TransferError::InvalidRequest(format!(
                "salt must be {KEY_SIZE} bytes"
            )));
        }
        if upload.name.is_empty() {
            return Err(TransferError::InvalidRequest("name is required".into()));
        }
        if upload.expires_in <= ChronoDuration::zero() {
            return Err(TransferError::InvalidRequest(
                "expiration must be in the future".into(),
            ));
        }
        let chunks = i64::try_from(upload.chunks)
            .map_err(|_| TransferError::InvalidRequest("too many chunks".into()))?;

        match owner {
            Some(owner) => {
                self.ledger.get_account(owner).await?;
            }
            None if upload.kind == ObjectKind::Vault => return Err(TransferError::AccountRequired),
            None => {}
        }

        let id = Uuid::new_v4();
        let timeout = self.objects.retry.timeout;
        let target = if upload.chunks == 1 {
            with_timeout(timeout, self.backend.init_upload()).await?
        } else {
            with_timeout(timeout, self.backend.init_multipart(&id.to_string())).await?
        };

        let now = Utc::now();
        let expiration = now + upload.expires_in;
        let recorded = async {
            let mut tx = self.db.begin().await?;
            sqlx::query(
                "INSERT INTO objects (id, owner_id, kind, name, chunks, salt, downloads,
                                      expiration, state, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'uploading', ?)",
            )
            .bind(id)
            .bind(owner)
            .bind(upload.kind)
            .bind(&upload.name)
            .bind(chunks)
            .bind(&upload.salt)
            .bind(upload.downloads)
            .bind(expiration)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO uploads (object_id, upload_url, auth_token, upload_value,
                                      multipart, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&target.upload_url)
            .bind(&target.auth_token)
            .bind(&target.upload_value)
            .bind(target.multipart)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        }
        .await;

        if let Err(err) = recorded {
            if target.multipart {
                if let Err(abort) = with_timeout(timeout, self.backend.abort_multipart(&target)).await {
                    warn!(object_id = %id, error = %abort, "failed to abort unrecorded multipart upload");
                }
            }
            return Err(err.into());
        }

        info!(object_id = %id, chunks = upload.chunks, kind = ?upload.kind, anonymous = owner.is_none(), "upload initiated");
        Ok(id)
    }

    /// Store chunk `index` of upload `id`.
    pub async fn accept_chunk(&self, id: Uuid, index: u64, data: Bytes) -> TransferResult<ChunkReceipt> {
        let object = self.objects.fetch(id).await?;
        let declared = object.chunks as u64;

        ensure_uploading(&object)?;
        if object.is_expired(Utc::now()) {
            return Err(TransferError::NotFound(id.to_string()));
        }
        if index >= declared {
            return Err(TransferError::ChunkOutOfRange {
                index,
                chunks: declared,
            });
        }
        if data.len() > MAX_CHUNK_BODY {
            return Err(TransferError::ChunkTooLarge(data.len()));
        }
        if data.is_empty() {
            return Err(TransferError::InvalidRequest("empty chunk".into()));
        }

        let lease = self.lease_chunk(id, index).await?;
        let stored = self.store_chunk(id, index, data).await;
        self.release_lease(&lease).await;
        stored?;

        let acknowledged = self.acknowledged(id).await?;
        debug!(object_id = %id, index, acknowledged, declared, "chunk accepted");

        let path = if acknowledged == declared {
            Some(self.finalize(id, declared).await?)
        } else {
            None
        };

        Ok(ChunkReceipt {
            id,
            index,
            acknowledged,
            chunks: declared,
            path,
        })
    }

    /// Charge, forward and record one chunk. Caller holds the chunk lease.
    async fn store_chunk(&self, id: Uuid, index: u64, data: Bytes) -> TransferResult<()> {
        // Re-read under the lease: another attempt may have finalized the upload.
        let object = self.objects.fetch(id).await?;
        ensure_uploading(&object)?;
        let session = self.session(id).await?;

        let previous: i64 = sqlx::query_scalar(
            "SELECT size_bytes FROM upload_parts WHERE object_id = ? AND chunk_index = ?",
        )
        .bind(id)
        .bind(index as i64)
        .fetch_optional(&*self.db)
        .await?
        .unwrap_or(0);
        let size = data.len() as i64;
        let delta = size - previous;

        self.charge(&object, delta).await?;

        let part_id = match self.forward(&session.target(), id, index, data).await {
            Ok(part_id) => part_id,
            Err(err) => {
                self.refund(&object, delta).await;
                return Err(err);
            }
        };

        let recorded = sqlx::query(
            "INSERT INTO upload_parts (object_id, chunk_index, part_id, size_bytes, uploaded_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(object_id, chunk_index) DO UPDATE SET
                 part_id = excluded.part_id,
                 size_bytes = excluded.size_bytes,
                 uploaded_at = excluded.uploaded_at",
        )
        .bind(id)
        .bind(index as i64)
        .bind(&part_id)
        .bind(size)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;
        if let Err(err) = recorded {
            self.refund(&object, delta).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Take the lease on `(id, index)`, waiting for a live holder to finish.
    async fn lease_chunk(&self, id: Uuid, index: u64) -> TransferResult<ChunkLease> {
        let deadline = Instant::now() + self.settings.finalize_wait;
        let lease = ChunkLease {
            object_id: id,
            index: index as i64,
            token: Uuid::new_v4().to_string(),
        };

        let lease_ms = i64::try_from(self.settings.chunk_lease.as_millis()).unwrap_or(i64::MAX);

        loop {
            let now = Utc::now().timestamp_millis();
            let taken = sqlx::query(
                "INSERT INTO chunk_leases (object_id, chunk_index, token, lease_until)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(object_id, chunk_index) DO UPDATE SET
                     token = excluded.token,
                     lease_until = excluded.lease_until
                 WHERE chunk_leases.lease_until <= ?",
            )
            .bind(id)
            .bind(lease.index)
            .bind(&lease.token)
            .bind(now.saturating_add(lease_ms))
            .bind(now)
            .execute(&*self.db)
            .await?;
            if taken.rows_affected() == 1 {
                return Ok(lease);
            }

            if Instant::now() >= deadline {
                return Err(TransferError::ChunkInProgress { id, index });
            }
            debug!(object_id = %id, index, "chunk lease held, waiting");
            tokio::time::sleep(FINALIZE_POLL).await;
        }
    }

    async fn release_lease(&self, lease: &ChunkLease) {
        if let Err(err) = sqlx::query(
            "DELETE FROM chunk_leases WHERE object_id = ? AND chunk_index = ? AND token = ?",
        )
        .bind(lease.object_id)
        .bind(lease.index)
        .bind(&lease.token)
        .execute(&*self.db)
        .await
        {
            warn!(object_id = %lease.object_id, index = lease.index, error = %err, "failed to release chunk lease");
        }
    }

    /// Finalize upload `id`, returning its public path. Idempotent.
    pub async fn finalize(&self, id: Uuid, chunk_count: u64) -> TransferResult<String> {
        let deadline = Instant::now() + self.settings.finalize_wait;

        loop {
            let object = self.objects.fetch(id).await?;
            let declared = object.chunks as u64;
            if declared != chunk_count {
                return Err(TransferError::ChunkCountMismatch {
                    declared,
                    got: chunk_count,
                });
            }

            match object.state {
                ObjectState::Finalized => {
                    return object
                        .path
                        .ok_or_else(|| TransferError::Internal(format!("finalized object {id} has no path")));
                }
                ObjectState::Uploading => {
                    let received = self.acknowledged(id).await?;
                    if received != declared {
                        return Err(TransferError::Incomplete { received, declared });
                    }
                    if self.claim(id).await? {
                        return self.complete(object).await;
                    }
                }
                ObjectState::Finalizing => {}
            }

            if Instant::now() >= deadline {
                return Err(TransferError::FinalizeInProgress(id));
            }
            tokio::time::sleep(FINALIZE_POLL).await;
        }
    }

    /// Win the `uploading -> finalizing` transition.
    async fn claim(&self, id: Uuid) -> TransferResult<bool> {
        let result = sqlx::query(
            "UPDATE objects SET state = 'finalizing' WHERE id = ? AND state = 'uploading'",
        )
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, id: Uuid) {
        if let Err(err) = sqlx::query(
            "UPDATE objects SET state = 'uploading' WHERE id = ? AND state = 'finalizing'",
        )
        .bind(id)
        .execute(&*self.db)
        .await
        {
            warn!(object_id = %id, error = %err, "failed to release finalize claim");
        }
    }

    /// Stitch the object on the backend and publish its path. Caller holds the claim.
    async fn complete(&self, object: StoredObject) -> TransferResult<String> {
        let id = object.id;
        let result = self.complete_claimed(&object).await;
        if result.is_err() {
            self.release_claim(id).await;
        }
        result
    }

    async fn complete_claimed(&self, object: &StoredObject) -> TransferResult<String> {
        let id = object.id;
        let session = self.session(id).await?;
        let parts = sqlx::query_as::<_, UploadPart>(
            "SELECT object_id, chunk_index, part_id, size_bytes, uploaded_at
             FROM upload_parts WHERE object_id = ? ORDER BY chunk_index",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?;

        let length: i64 = parts.iter().map(|p| p.size_bytes).sum();
        let layout = ContainerLayout::new(length as u64)?;
        let misaligned = layout.chunk_count() != object.chunks as u64
            || parts
                .iter()
                .take(parts.len().saturating_sub(1))
                .any(|p| p.size_bytes != FRAME_SIZE as i64);
        if misaligned {
            return Err(TransferError::InvalidRequest(format!(
                "chunks of upload {id} do not form a {}-chunk container",
                object.chunks
            )));
        }

        let object_key = if let Some(key) = object.object_key.clone() {
            // Stitched by an earlier attempt whose publish failed.
            key
        } else if session.multipart {
            let part_ids: Vec<String> = parts.iter().map(|p| p.part_id.clone()).collect();
            with_timeout(
                self.objects.retry.timeout,
                self.backend.finish_multipart(&session.target(), &part_ids),
            )
            .await?
            .key
        } else {
            parts
                .first()
                .map(|p| p.part_id.clone())
                .ok_or_else(|| TransferError::Incomplete {
                    received: 0,
                    declared: 1,
                })?
        };

        sqlx::query("UPDATE objects SET object_key = ? WHERE id = ? AND state = 'finalizing'")
            .bind(&object_key)
            .bind(id)
            .execute(&*self.db)
            .await?;

        for attempt in 0..PATH_ATTEMPTS {
            let path = generate_path();
            let published = sqlx::query_scalar::<_, String>(
                "UPDATE objects
                 SET state = 'finalized', path = ?, object_key = ?, length = ?
                 WHERE id = ? AND state = 'finalizing' AND path IS NULL
                 RETURNING path",
            )
            .bind(&path)
            .bind(&object_key)
            .bind(length)
            .bind(id)
            .fetch_optional(&*self.db)
            .await;

            match published {
                Ok(Some(path)) => {
                    if let Err(err) = sqlx::query("DELETE FROM uploads WHERE object_id = ?")
                        .bind(id)
                        .execute(&*self.db)
                        .await
                    {
                        warn!(object_id = %id, error = %err, "failed to clear upload session");
                    }
                    info!(object_id = %id, path = %path, length, "upload finalized");
                    return Ok(path);
                }
                Ok(None) => {
                    return Err(TransferError::Internal(format!(
                        "lost finalize claim on {id}"
                    )));
                }
                Err(err) if violates_unique(&err, "objects.path") => {
                    debug!(attempt, "path collision, regenerating");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(TransferError::Internal("could not allocate a unique path".into()))
    }

    async fn session(&self, id: Uuid) -> TransferResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT object_id, upload_url, auth_token, upload_value, multipart, created_at
             FROM uploads WHERE object_id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| TransferError::NotFound(id.to_string()))
    }

    async fn acknowledged(&self, id: Uuid) -> TransferResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_parts WHERE object_id = ?")
            .bind(id)
            .fetch_one(&*self.db)
            .await?;
        Ok(count as u64)
    }

    async fn forward(
        &self,
        target: &UploadTarget,
        id: Uuid,
        index: u64,
        data: Bytes,
    ) -> TransferResult<String> {
        let timeout = self.objects.retry.timeout;
        if target.multipart {
            let index = u32::try_from(index)
                .map_err(|_| TransferError::InvalidRequest("chunk index too large".into()))?;
            Ok(with_timeout(timeout, self.backend.upload_part(target, index, data)).await?)
        } else {
            let object = with_timeout(
                timeout,
                self.backend.upload_single(target, &id.to_string(), data),
            )
            .await?;
            Ok(object.key)
        }
    }

    async fn charge(&self, object: &StoredObject, delta: i64) -> TransferResult<()> {
        let Some(owner) = object.owner_id.as_deref() else {
            return Ok(());
        };
        match object.kind {
            ObjectKind::Vault => self.ledger.charge_storage(owner, delta).await?,
            ObjectKind::Send => self.ledger.charge_send(owner, delta).await?,
        };
        Ok(())
    }

    async fn refund(&self, object: &StoredObject, delta: i64) {
        if let Err(err) = self.charge(object, -delta).await {
            warn!(object_id = %object.id, delta, error = %err, "refund after failed upload did not apply");
        }
    }
}

/// A held `(object, index)` lease. Only the holder's token releases it.
struct ChunkLease {
    object_id: Uuid,
    index: i64,
    token: String,
}

fn ensure_uploading(object: &StoredObject) -> TransferResult<()> {
    match object.state {
        ObjectState::Finalized => Err(TransferError::AlreadyFinalized(object.id)),
        ObjectState::Finalizing => Err(TransferError::FinalizeInProgress(object.id)),
        ObjectState::Uploading => Ok(()),
    }
}

fn generate_path() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PATH_LEN)
        .map(char::from)
        .collect()
}
