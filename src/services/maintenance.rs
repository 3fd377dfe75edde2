//! Background maintenance: bandwidth windows, membership reconciliation,
//! and the expired-object reaper.
//!
//! Each job runs in its own task on a fixed interval and stops when the
//! shared `CancellationToken` fires. Failures are logged and retried on the
//! next tick.

use super::{ledger::LedgerService, objects::ObjectRepo};
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct MaintenanceIntervals {
    pub reaper: Duration,
    pub reconcile: Duration,
    pub bandwidth_reset: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Reaper,
    Reconcile,
    BandwidthReset,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::Reaper => "reaper",
            Job::Reconcile => "reconcile",
            Job::BandwidthReset => "bandwidth_reset",
        }
    }
}

#[derive(Clone)]
pub struct Maintenance {
    ledger: LedgerService,
    objects: ObjectRepo,
    intervals: MaintenanceIntervals,
}

impl Maintenance {
    pub fn new(ledger: LedgerService, objects: ObjectRepo, intervals: MaintenanceIntervals) -> Self {
        Self {
            ledger,
            objects,
            intervals,
        }
    }

    /// Run every job until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut jobs = JoinSet::new();
        for (job, interval) in [
            (Job::Reaper, self.intervals.reaper),
            (Job::Reconcile, self.intervals.reconcile),
            (Job::BandwidthReset, self.intervals.bandwidth_reset),
        ] {
            jobs.spawn(self.clone().run_job(job, interval, shutdown.clone()));
        }
        while jobs.join_next().await.is_some() {}
    }

    async fn run_job(self, job: Job, interval: Duration, shutdown: CancellationToken) {
        info!(job = job.name(), interval_secs = interval.as_secs(), "maintenance job starting");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = shutdown.cancelled() => {
                    info!(job = job.name(), "maintenance job shutting down");
                    return;
                }
            }

            self.step(job).await;
        }
    }

    async fn step(&self, job: Job) {
        match job {
            Job::Reaper => self.reap_once().await,
            Job::Reconcile => self.reconcile_once().await,
            Job::BandwidthReset => self.reset_bandwidth_once().await,
        }
    }

    pub async fn reap_once(&self) {
        if let Err(err) = self.objects.reap_expired(Utc::now()).await {
            error!(error = %err, "expired object reaper failed");
        }
    }

    pub async fn reconcile_once(&self) {
        if let Err(err) = self.ledger.reconcile_memberships(Utc::now()).await {
            error!(error = %err, "membership reconciliation failed");
        }
    }

    pub async fn reset_bandwidth_once(&self) {
        match self.ledger.reset_bandwidth_window().await {
            Ok(accounts) => info!(accounts, "bandwidth window reset"),
            Err(err) => error!(error = %err, "bandwidth window reset failed"),
        }
    }
}
