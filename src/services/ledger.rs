//! Quota and bandwidth ledger.
//!
//! Every counter mutation is a single conditional `UPDATE ... RETURNING`, so
//! concurrent requests can never drive a counter past its limit or below
//! zero. Account lifecycle (signup, credentials, second factor, billing
//! identifiers) lives here too since it writes the same row.

use crate::{
    config::{AppConfig, SubscriptionCatalog},
    db::{is_unique_violation, violates_unique},
    models::account::{Account, NewAccount, SubscriptionUpdate, Usage},
};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

const ACCOUNT_COLUMNS: &str = "id, email, pw_hash, protected_key, public_key, pw_hint, \
     second_factor, recovery_hashes, payment_id, member_expiration, sub_tag, sub_method, \
     storage_available, storage_used, send_available, send_used, bandwidth, \
     last_upgraded_month, created_at";

const ACCOUNT_ID_LEN: usize = 16;
const PAYMENT_ID_LEN: usize = 16;
const ID_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account `{0}` not found")]
    AccountNotFound(String),
    #[error("an account with this email already exists")]
    AccountExists,
    #[error("the maximum number of accounts has been reached")]
    AccountLimitReached,
    #[error("account exceeded its storage limit")]
    StorageExceeded,
    #[error("account exceeded its monthly send limit")]
    SendExceeded,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("password hints require an email account")]
    HintRequiresEmail,
    #[error("payment id cannot change during an active subscription")]
    SubscriptionActive,
    #[error("unknown subscription tier `{0}`")]
    UnknownTier(String),
    #[error("could not allocate a unique identifier")]
    IdentifierExhausted,
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Quota knobs shared by every ledger operation.
#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    pub default_storage: i64,
    pub default_send: i64,
    /// Storage and send limits are enforced.
    pub metering_enabled: bool,
    /// Bandwidth counters are charged.
    pub bandwidth_tracking: bool,
    pub max_accounts: Option<u64>,
    pub bandwidth_multiplier: i64,
    pub bandwidth_monitor_days: i64,
    pub tiers: SubscriptionCatalog,
}

impl LedgerPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            default_storage: cfg.default_user_storage,
            default_send: cfg.default_user_send,
            metering_enabled: cfg.metering_enabled(),
            bandwidth_tracking: cfg.bandwidth_tracking(),
            max_accounts: cfg.max_accounts,
            bandwidth_multiplier: cfg.bandwidth_multiplier,
            bandwidth_monitor_days: cfg.bandwidth_monitor_days,
            tiers: cfg.tiers.clone(),
        }
    }

    /// Bandwidth granted per monitoring window for a storage allotment.
    pub fn bandwidth_window(&self, storage_available: i64) -> i64 {
        storage_available
            .saturating_mul(self.bandwidth_multiplier)
            .saturating_mul(self.bandwidth_monitor_days)
    }
}

#[derive(Clone, Copy, Debug)]
enum Quota {
    Storage,
    Send,
}

impl Quota {
    /// `(used, available)` column names.
    fn columns(self) -> (&'static str, &'static str) {
        match self {
            Quota::Storage => ("storage_used", "storage_available"),
            Quota::Send => ("send_used", "send_available"),
        }
    }

    fn exceeded(self) -> LedgerError {
        match self {
            Quota::Storage => LedgerError::StorageExceeded,
            Quota::Send => LedgerError::SendExceeded,
        }
    }
}

#[derive(Clone)]
pub struct LedgerService {
    pub(crate) db: Arc<SqlitePool>,
    pub(crate) policy: LedgerPolicy,
}

impl LedgerService {
    pub fn new(db: Arc<SqlitePool>, policy: LedgerPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    /// Adjust storage used by `delta` bytes. Returns the new usage.
    pub async fn charge_storage(&self, account_id: &str, delta: i64) -> LedgerResult<i64> {
        self.charge(Quota::Storage, account_id, delta).await
    }

    /// Adjust this month's send usage by `delta` bytes. Returns the new usage.
    pub async fn charge_send(&self, account_id: &str, delta: i64) -> LedgerResult<i64> {
        self.charge(Quota::Send, account_id, delta).await
    }

    async fn charge(&self, quota: Quota, account_id: &str, delta: i64) -> LedgerResult<i64> {
        let (used, available) = quota.columns();
        let sql = format!(
            "UPDATE accounts
             SET {used} = MAX({used} + ?1, 0)
             WHERE id = ?2
               AND (?1 <= 0 OR ?3 = 0 OR {available} <= 0 OR {used} + ?1 <= {available})
             RETURNING {used}"
        );

        let updated = sqlx::query_scalar::<_, i64>(&sql)
            .bind(delta)
            .bind(account_id)
            .bind(self.policy.metering_enabled)
            .fetch_optional(&*self.db)
            .await?;

        match updated {
            Some(now_used) => {
                debug!(account_id, ?quota, delta, now_used, "charged quota");
                Ok(now_used)
            }
            None => {
                self.ensure_exists(account_id).await?;
                info!(account_id, ?quota, delta, "quota exceeded");
                Err(quota.exceeded())
            }
        }
    }

    /// Subtract `delta` from the advisory bandwidth counter.
    ///
    /// Returns `None` when bandwidth is not tracked. Never blocks downloads.
    pub async fn charge_bandwidth(&self, account_id: &str, delta: i64) -> LedgerResult<Option<i64>> {
        if !self.policy.bandwidth_tracking {
            return Ok(None);
        }

        let remaining = sqlx::query_scalar::<_, i64>(
            "UPDATE accounts SET bandwidth = bandwidth - ? WHERE id = ? RETURNING bandwidth",
        )
        .bind(delta)
        .bind(account_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;

        if remaining < 0 {
            debug!(account_id, remaining, "account is over its bandwidth window");
        }
        Ok(Some(remaining))
    }

    async fn ensure_exists(&self, account_id: &str) -> LedgerResult<()> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&*self.db)
            .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(LedgerError::AccountNotFound(account_id.to_string())),
        }
    }

    /// Register an account with the default allotments.
    pub async fn create_account(&self, new: NewAccount) -> LedgerResult<Account> {
        let pw_hash = hash_secret(&new.login_key)?;
        let email = new
            .email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());
        let limit = self
            .policy
            .max_accounts
            .map(|max| i64::try_from(max).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO accounts (
                 id, email, pw_hash, protected_key, public_key, pw_hint, payment_id,
                 member_expiration, storage_available, send_available, bandwidth,
                 last_upgraded_month, created_at
             )
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, -1, ?
             WHERE ? < 0 OR (SELECT COUNT(*) FROM accounts) < ?
             RETURNING {ACCOUNT_COLUMNS}"
        );

        for attempt in 0..ID_ATTEMPTS {
            let inserted = sqlx::query_as::<_, Account>(&sql)
                .bind(generate_account_id())
                .bind(&email)
                .bind(&pw_hash)
                .bind(&new.protected_key)
                .bind(&new.public_key)
                .bind(&new.password_hint)
                .bind(generate_payment_id())
                .bind(DateTime::<Utc>::UNIX_EPOCH)
                .bind(self.policy.default_storage)
                .bind(self.policy.default_send)
                .bind(self.policy.bandwidth_window(self.policy.default_storage))
                .bind(now)
                .bind(limit)
                .bind(limit)
                .fetch_optional(&*self.db)
                .await;

            match inserted {
                Ok(Some(account)) => {
                    info!(account_id = %account.id, anonymous = account.email.is_none(), "account created");
                    return Ok(account);
                }
                Ok(None) => return Err(LedgerError::AccountLimitReached),
                Err(err) if violates_unique(&err, "accounts.email") => {
                    return Err(LedgerError::AccountExists);
                }
                Err(err) if is_unique_violation(&err) => {
                    debug!(attempt, "identifier collision, regenerating");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(LedgerError::IdentifierExhausted)
    }

    pub async fn get_account(&self, account_id: &str) -> LedgerResult<Account> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"
        ))
        .bind(account_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    pub async fn usage(&self, account_id: &str) -> LedgerResult<Usage> {
        sqlx::query_as::<_, Usage>(
            "SELECT storage_available, storage_used, send_available, send_used, bandwidth
             FROM accounts WHERE id = ?",
        )
        .bind(account_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    /// Check a login key against the account found by id or email.
    pub async fn verify_login(&self, identifier: &str, login_key: &[u8]) -> LedgerResult<Account> {
        let identifier = identifier.trim();
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1 OR email = lower(?1)"
        ))
        .bind(identifier)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(LedgerError::InvalidCredentials)?;

        if verify_secret(&account.pw_hash, login_key)? {
            Ok(account)
        } else {
            Err(LedgerError::InvalidCredentials)
        }
    }

    /// Rotate the login key and the key material it protects.
    pub async fn update_login(
        &self,
        account_id: &str,
        login_key: &[u8],
        protected_key: &[u8],
    ) -> LedgerResult<()> {
        let pw_hash = hash_secret(login_key)?;
        let result =
            sqlx::query("UPDATE accounts SET pw_hash = ?, protected_key = ? WHERE id = ?")
                .bind(pw_hash)
                .bind(protected_key)
                .bind(account_id)
                .execute(&*self.db)
                .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(account_id.to_string()));
        }
        Ok(())
    }

    pub async fn set_password_hint(&self, account_id: &str, hint: &[u8]) -> LedgerResult<()> {
        let result =
            sqlx::query("UPDATE accounts SET pw_hint = ? WHERE id = ? AND email IS NOT NULL")
                .bind(hint)
                .bind(account_id)
                .execute(&*self.db)
                .await?;
        if result.rows_affected() == 0 {
            self.ensure_exists(account_id).await?;
            return Err(LedgerError::HintRequiresEmail);
        }
        Ok(())
    }

    /// Enable a second factor. Recovery codes are stored hashed.
    pub async fn set_second_factor(
        &self,
        account_id: &str,
        secret: &[u8],
        recovery_codes: &[String],
    ) -> LedgerResult<()> {
        let hashes = recovery_codes
            .iter()
            .map(|code| hash_secret(code.as_bytes()))
            .collect::<LedgerResult<Vec<_>>>()?;
        let hashes = serde_json::to_string(&hashes).map_err(|e| LedgerError::Hash(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE accounts SET second_factor = ?, recovery_hashes = ? WHERE id = ?",
        )
        .bind(secret)
        .bind(hashes)
        .bind(account_id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(account_id.to_string()));
        }
        Ok(())
    }

    pub async fn remove_second_factor(&self, account_id: &str) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE accounts SET second_factor = NULL, recovery_hashes = NULL WHERE id = ?",
        )
        .bind(account_id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(account_id.to_string()));
        }
        Ok(())
    }

    /// Issue a fresh payment id unless a subscription is still running.
    pub async fn recycle_payment_id(&self, account_id: &str, now: DateTime<Utc>) -> LedgerResult<String> {
        for attempt in 0..ID_ATTEMPTS {
            let updated = sqlx::query_scalar::<_, String>(
                "UPDATE accounts SET payment_id = ?
                 WHERE id = ? AND (sub_method IS NULL OR member_expiration < ?)
                 RETURNING payment_id",
            )
            .bind(generate_payment_id())
            .bind(account_id)
            .bind(now)
            .fetch_optional(&*self.db)
            .await;

            match updated {
                Ok(Some(payment_id)) => return Ok(payment_id),
                Ok(None) => {
                    self.ensure_exists(account_id).await?;
                    return Err(LedgerError::SubscriptionActive);
                }
                Err(err) if is_unique_violation(&err) => {
                    debug!(attempt, "payment id collision, regenerating");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(LedgerError::IdentifierExhausted)
    }

    /// Remove the account row. Owned object rows cascade.
    pub async fn delete_account(&self, account_id: &str) -> LedgerResult<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(account_id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(account_id.to_string()));
        }
        info!(account_id, "account deleted");
        Ok(())
    }

    /// Apply a subscription change from the billing collaborator.
    pub async fn set_subscription(
        &self,
        update: &SubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        if self.policy.tiers.get(&update.tag).is_none() {
            return Err(LedgerError::UnknownTier(update.tag.clone()));
        }

        let result = sqlx::query(
            "UPDATE accounts
             SET sub_tag = ?, sub_method = ?, member_expiration = ?,
                 storage_available = ?, send_available = ?, bandwidth = ?,
                 last_upgraded_month = ?
             WHERE payment_id = ?",
        )
        .bind(&update.tag)
        .bind(&update.method)
        .bind(update.expiration)
        .bind(update.storage)
        .bind(update.send)
        .bind(self.policy.bandwidth_window(update.storage))
        .bind(super::membership::month_marker(now))
        .bind(&update.payment_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(update.payment_id.clone()));
        }
        info!(payment_id = %update.payment_id, tag = %update.tag, "subscription updated");
        Ok(())
    }
}

/// 16 random digits, never starting with zero.
pub fn generate_account_id() -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(ACCOUNT_ID_LEN);
    id.push(char::from(b'1' + rng.gen_range(0..9u8)));
    for _ in 1..ACCOUNT_ID_LEN {
        id.push(char::from(b'0' + rng.gen_range(0..10u8)));
    }
    id
}

pub fn generate_payment_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PAYMENT_ID_LEN)
        .map(char::from)
        .collect()
}

fn hash_secret(secret: &[u8]) -> LedgerResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret, &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| LedgerError::Hash(e.to_string()))
}

fn verify_secret(phc: &str, secret: &[u8]) -> LedgerResult<bool> {
    let parsed = PasswordHash::new(phc).map_err(|e| LedgerError::Hash(e.to_string()))?;
    Ok(Argon2::default().verify_password(secret, &parsed).is_ok())
}
