//! Represents an encrypted container stored on the object backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Which quota an object is charged against.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ObjectKind {
    /// Share link, charged against the monthly send allowance.
    Send,
    /// Long-lived file, charged against storage.
    Vault,
}

#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ObjectState {
    Uploading,
    Finalizing,
    Finalized,
}

/// Metadata for one container. The bytes live on the backend.
#[derive(Clone, FromRow, Debug)]
pub struct StoredObject {
    pub id: Uuid,

    /// Nullable for anonymous send links.
    pub owner_id: Option<String>,

    pub kind: ObjectKind,

    /// Client-encrypted display name.
    pub name: Vec<u8>,

    /// Declared chunk count.
    pub chunks: i64,

    /// Key-derivation salt declared at upload time.
    pub salt: Vec<u8>,

    /// Remaining downloads, `-1` for unlimited.
    pub downloads: i64,

    pub expiration: DateTime<Utc>,

    /// Total container length, known once finalized.
    pub length: i64,

    /// Backend reference, set at finalization.
    pub object_key: Option<String>,

    /// Public access path, assigned exactly once.
    pub path: Option<String>,

    pub state: ObjectState,

    pub created_at: DateTime<Utc>,
}

impl StoredObject {
    pub fn is_unlimited(&self) -> bool {
        self.downloads < 0
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    pub fn is_finalized(&self) -> bool {
        self.state == ObjectState::Finalized
    }
}
