//! Accounts and their quota counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered account.
///
/// Credentials and key material are opaque client-produced blobs; the
/// server only stores the PHC hash of the login key.
#[derive(Clone, FromRow, Debug)]
pub struct Account {
    /// 16-digit identifier, immutable.
    pub id: String,

    /// Absent for anonymous accounts.
    pub email: Option<String>,

    /// Argon2 PHC string of the client login key.
    pub pw_hash: String,

    pub protected_key: Vec<u8>,
    pub public_key: Vec<u8>,
    pub pw_hint: Option<Vec<u8>>,

    pub second_factor: Option<Vec<u8>>,
    /// JSON array of recovery-code hashes.
    pub recovery_hashes: Option<String>,

    /// Billing reference, recyclable.
    pub payment_id: String,
    pub member_expiration: DateTime<Utc>,
    pub sub_tag: Option<String>,
    pub sub_method: Option<String>,

    pub storage_available: i64,
    pub storage_used: i64,
    pub send_available: i64,
    pub send_used: i64,
    pub bandwidth: i64,

    /// `year * 100 + month` of the last allotment refresh, `-1` for never.
    pub last_upgraded_month: i64,

    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Accounts without a storage allotment bypass quota checks.
    pub fn is_unmetered(&self) -> bool {
        self.storage_available <= 0
    }

    pub fn usage(&self) -> Usage {
        Usage {
            storage_available: self.storage_available,
            storage_used: self.storage_used,
            send_available: self.send_available,
            send_used: self.send_used,
            bandwidth: self.bandwidth,
        }
    }
}

/// Counters reported to the account holder.
#[derive(Serialize, Deserialize, Clone, Copy, FromRow, Debug, PartialEq, Eq)]
pub struct Usage {
    pub storage_available: i64,
    pub storage_used: i64,
    pub send_available: i64,
    pub send_used: i64,
    pub bandwidth: i64,
}

/// Input for signup.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: Option<String>,
    /// Client-derived login key; hashed before storage.
    pub login_key: Vec<u8>,
    pub protected_key: Vec<u8>,
    pub public_key: Vec<u8>,
    pub password_hint: Option<Vec<u8>>,
}

/// Subscription change pushed by the billing collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionUpdate {
    pub payment_id: String,
    pub tag: String,
    pub method: String,
    pub expiration: DateTime<Utc>,
    pub storage: i64,
    pub send: i64,
}
