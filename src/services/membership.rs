//! Monthly membership reconciliation and the bandwidth window.
//!
//! Deciding what happens to an account is pure (`plan_reconciliation`);
//! applying it is one bulk `UPDATE` per tier plus one for lapsed accounts.

use super::ledger::{LedgerResult, LedgerService};
use chrono::{DateTime, Datelike, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// Accounts stay on their tier this long past expiration.
pub const GRACE_PERIOD_HOURS: i64 = 72;

/// Max ids bound into one statement.
const BATCH_SIZE: usize = 500;

/// `year * 100 + month`, the value stamped into `last_upgraded_month`.
pub fn month_marker(now: DateTime<Utc>) -> i64 {
    i64::from(now.year()) * 100 + i64::from(now.month())
}

/// An expiration on the 29th-31st falls due on the last day of shorter months.
pub fn rolls_over(now: DateTime<Utc>, expiration: DateTime<Utc>) -> bool {
    if expiration.day() < 29 || now.day() >= expiration.day() {
        return false;
    }
    let tomorrow = now + Duration::days(1);
    tomorrow.month() != now.month()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipAction {
    /// Lapsed past the grace period; back to the default tier.
    Revert,
    /// Renewal day; refresh the allotment for this tag.
    Refresh(String),
    /// Not due this run.
    Wait,
}

pub fn classify(
    now: DateTime<Utc>,
    expiration: DateTime<Utc>,
    sub_tag: Option<&str>,
) -> MembershipAction {
    if expiration + Duration::hours(GRACE_PERIOD_HOURS) < now {
        return MembershipAction::Revert;
    }
    if now.day() == expiration.day() || rolls_over(now, expiration) {
        return match sub_tag {
            Some(tag) => MembershipAction::Refresh(tag.to_string()),
            None => MembershipAction::Revert,
        };
    }
    MembershipAction::Wait
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MembershipRow {
    pub id: String,
    pub sub_tag: Option<String>,
    pub member_expiration: DateTime<Utc>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub revert: Vec<String>,
    pub refresh: BTreeMap<String, Vec<String>>,
}

pub fn plan_reconciliation(now: DateTime<Utc>, rows: &[MembershipRow]) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for row in rows {
        match classify(now, row.member_expiration, row.sub_tag.as_deref()) {
            MembershipAction::Revert => plan.revert.push(row.id.clone()),
            MembershipAction::Refresh(tag) => plan.refresh.entry(tag).or_default().push(row.id.clone()),
            MembershipAction::Wait => {}
        }
    }
    plan
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reverted: u64,
    pub refreshed: u64,
    pub skipped: u64,
}

impl LedgerService {
    /// Reset send usage and allotments for accounts due this month.
    ///
    /// Accounts already stamped with the current month are not touched,
    /// so repeated runs within a month change nothing.
    pub async fn reconcile_memberships(&self, now: DateTime<Utc>) -> LedgerResult<ReconcileReport> {
        let marker = month_marker(now);
        let rows = sqlx::query_as::<_, MembershipRow>(
            "SELECT id, sub_tag, member_expiration FROM accounts WHERE last_upgraded_month != ?",
        )
        .bind(marker)
        .fetch_all(&*self.db)
        .await?;

        let plan = plan_reconciliation(now, &rows);
        let mut report = ReconcileReport::default();

        match self
            .apply_allotment(&plan.revert, self.policy.default_storage, self.policy.default_send, marker)
            .await
        {
            Ok(n) => report.reverted = n,
            Err(err) => error!(error = %err, "failed to revert lapsed memberships"),
        }

        for (tag, ids) in &plan.refresh {
            let Some(tier) = self.policy.tiers.get(tag) else {
                warn!(tag, accounts = ids.len(), "unknown subscription tier, skipping");
                report.skipped += ids.len() as u64;
                continue;
            };
            match self.apply_allotment(ids, tier.storage, tier.send, marker).await {
                Ok(n) => report.refreshed += n,
                Err(err) => error!(tag, error = %err, "failed to refresh memberships"),
            }
        }

        if report != ReconcileReport::default() {
            info!(?report, marker, "memberships reconciled");
        }
        Ok(report)
    }

    async fn apply_allotment(
        &self,
        ids: &[String],
        storage: i64,
        send: i64,
        marker: i64,
    ) -> LedgerResult<u64> {
        let mut affected = 0;
        for batch in ids.chunks(BATCH_SIZE) {
            let mut builder = QueryBuilder::<Sqlite>::new("UPDATE accounts SET send_used = 0, send_available = ");
            builder.push_bind(send);
            builder.push(", storage_available = ");
            builder.push_bind(storage);
            builder.push(", last_upgraded_month = ");
            builder.push_bind(marker);
            builder.push(" WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in batch {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            affected += builder.build().execute(&*self.db).await?.rows_affected();
        }
        Ok(affected)
    }

    /// Start a new bandwidth window for every account.
    pub async fn reset_bandwidth_window(&self) -> LedgerResult<u64> {
        let result = sqlx::query("UPDATE accounts SET bandwidth = storage_available * ? * ?")
            .bind(self.policy.bandwidth_multiplier)
            .bind(self.policy.bandwidth_monitor_days)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }
}
