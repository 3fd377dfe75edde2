//! In-flight upload bookkeeping.

use crate::services::backend::UploadTarget;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Backend target recorded when an upload is declared.
#[derive(Clone, FromRow, Debug)]
pub struct UploadSession {
    pub object_id: Uuid,
    pub upload_url: String,
    pub auth_token: String,
    pub upload_value: String,
    pub multipart: bool,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn target(&self) -> UploadTarget {
        UploadTarget {
            upload_url: self.upload_url.clone(),
            auth_token: self.auth_token.clone(),
            upload_value: self.upload_value.clone(),
            multipart: self.multipart,
        }
    }
}

/// An acknowledged chunk.
#[derive(Clone, FromRow, Debug)]
pub struct UploadPart {
    pub object_id: Uuid,
    pub chunk_index: i64,
    pub part_id: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
}
