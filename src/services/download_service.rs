//! Download sessions: metadata lookup and ranged chunk reads.

use super::{
    backend::{BackendError, ObjectBackend, ObjectRef},
    ledger::LedgerService,
    objects::{ObjectRepo, TransferError, TransferResult},
    retry::{RetryPolicy, with_retry},
};
use crate::{
    crypto::{
        CryptoError, KdfParams, decrypt_chunk, derive_key,
        container::{ContainerLayout, ContainerReader, RangeSource},
    },
    models::object::{ObjectKind, StoredObject},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::{ops::Range, sync::Arc};
use tracing::{debug, warn};
use uuid::Uuid;

/// What a recipient needs before fetching chunks.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadInfo {
    pub id: Uuid,
    /// Client-encrypted display name.
    pub name: Vec<u8>,
    pub chunks: u64,
    pub salt: Vec<u8>,
    pub size: u64,
    pub kind: ObjectKind,
    /// `None` when unlimited.
    pub downloads: Option<i64>,
    pub expiration: DateTime<Utc>,
}

impl From<&StoredObject> for DownloadInfo {
    fn from(object: &StoredObject) -> Self {
        Self {
            id: object.id,
            name: object.name.clone(),
            chunks: object.chunks as u64,
            salt: object.salt.clone(),
            size: object.length as u64,
            kind: object.kind,
            downloads: (!object.is_unlimited()).then_some(object.downloads),
            expiration: object.expiration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkDownload {
    pub index: u64,
    pub is_last: bool,
    /// One ciphertext frame.
    pub bytes: Bytes,
    /// Downloads left after this one, `None` when unlimited.
    pub remaining: Option<i64>,
    pub expiration: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PlaintextChunk {
    pub index: u64,
    pub is_last: bool,
    pub plaintext: Vec<u8>,
    pub remaining: Option<i64>,
    pub expiration: DateTime<Utc>,
}

/// Read exactly `range` or fail; short reads count as transient.
async fn read_exact_range(
    backend: &dyn ObjectBackend,
    object: &ObjectRef,
    range: Range<u64>,
    retry: &RetryPolicy,
) -> TransferResult<Bytes> {
    let expected = range.end - range.start;
    let bytes = with_retry(retry, "read_range", move || {
        let range = range.clone();
        async move {
            let bytes = backend.read_range(object, range).await?;
            if bytes.len() as u64 != expected {
                return Err(BackendError::Unavailable(format!(
                    "short read: {} of {} bytes",
                    bytes.len(),
                    expected
                )));
            }
            Ok(bytes)
        }
    })
    .await?;
    Ok(bytes)
}

/// A stored container viewed as a [`RangeSource`].
pub struct BackendSource {
    backend: Arc<dyn ObjectBackend>,
    object: ObjectRef,
    retry: RetryPolicy,
}

#[async_trait]
impl RangeSource for BackendSource {
    type Error = TransferError;

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes, TransferError> {
        read_exact_range(self.backend.as_ref(), &self.object, range, &self.retry).await
    }
}

#[derive(Clone)]
pub struct DownloadService {
    backend: Arc<dyn ObjectBackend>,
    ledger: LedgerService,
    objects: ObjectRepo,
}

impl DownloadService {
    pub fn new(objects: ObjectRepo) -> Self {
        Self {
            backend: objects.backend.clone(),
            ledger: objects.ledger.clone(),
            objects,
        }
    }

    pub async fn metadata_by_path(&self, path: &str) -> TransferResult<DownloadInfo> {
        let object = self.objects.fetch_by_path(path, Utc::now()).await?;
        Ok(DownloadInfo::from(&object))
    }

    pub async fn metadata(&self, id: Uuid) -> TransferResult<DownloadInfo> {
        let object = self.objects.fetch_live(id, Utc::now()).await?;
        Ok(DownloadInfo::from(&object))
    }

    /// Fetch ciphertext chunk `index`.
    ///
    /// Serving the last chunk counts as one completed download.
    pub async fn fetch_chunk(&self, id: Uuid, index: u64) -> TransferResult<ChunkDownload> {
        let object = self.objects.fetch_live(id, Utc::now()).await?;
        let layout = ContainerLayout::new(object.length as u64)?;
        let range = layout
            .chunk_range(index)
            .ok_or(TransferError::ChunkOutOfRange {
                index,
                chunks: layout.chunk_count(),
            })?;

        let bytes = read_exact_range(
            self.backend.as_ref(),
            &self.object_ref(&object)?,
            range,
            &self.objects.retry,
        )
        .await?;

        if let Some(owner) = object.owner_id.as_deref() {
            if let Err(err) = self.ledger.charge_bandwidth(owner, bytes.len() as i64).await {
                warn!(object_id = %id, owner, error = %err, "bandwidth charge failed");
            }
        }

        let is_last = layout.is_last(index);
        let remaining = if is_last {
            self.objects.record_download(&object).await?
        } else {
            object.downloads
        };
        debug!(object_id = %id, index, is_last, remaining, "chunk served");

        Ok(ChunkDownload {
            index,
            is_last,
            bytes,
            remaining: (remaining >= 0).then_some(remaining),
            expiration: object.expiration,
        })
    }

    /// Fetch and decrypt chunk `index` with the container passphrase.
    pub async fn fetch_plaintext_chunk(
        &self,
        id: Uuid,
        index: u64,
        passphrase: SecretString,
        params: KdfParams,
    ) -> TransferResult<PlaintextChunk> {
        // The salt must be read before the last chunk can delete the object.
        let object = self.objects.fetch_live(id, Utc::now()).await?;
        let layout = ContainerLayout::new(object.length as u64)?;
        let salt = read_exact_range(
            self.backend.as_ref(),
            &self.object_ref(&object)?,
            layout.salt_range(),
            &self.objects.retry,
        )
        .await?;
        let key = tokio::task::spawn_blocking(move || derive_key(&passphrase, &salt, &params))
            .await
            .map_err(|e| TransferError::Internal(e.to_string()))??;

        let download = self.fetch_chunk(id, index).await?;
        let (plaintext, consumed) = decrypt_chunk(&key, &download.bytes)?;
        if consumed != download.bytes.len() {
            return Err(CryptoError::AuthenticationFailure.into());
        }

        Ok(PlaintextChunk {
            index,
            is_last: download.is_last,
            plaintext,
            remaining: download.remaining,
            expiration: download.expiration,
        })
    }

    /// Open a decoder over the whole container without counting a download.
    pub async fn open_reader(
        &self,
        id: Uuid,
        passphrase: &SecretString,
        params: &KdfParams,
    ) -> TransferResult<ContainerReader<BackendSource>> {
        let object = self.objects.fetch_live(id, Utc::now()).await?;
        let source = BackendSource {
            backend: self.backend.clone(),
            object: self.object_ref(&object)?,
            retry: self.objects.retry.clone(),
        };
        ContainerReader::open(source, object.length as u64, passphrase, params).await
    }

    fn object_ref(&self, object: &StoredObject) -> TransferResult<ObjectRef> {
        object
            .object_key
            .as_deref()
            .map(ObjectRef::new)
            .ok_or_else(|| TransferError::Internal(format!("object {} has no backend key", object.id)))
    }
}
