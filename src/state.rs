use crate::{
    config::AppConfig,
    routes::{dispatch::Dispatcher, routes::Endpoint},
    services::{
        backend::ObjectBackend,
        download_service::DownloadService,
        ledger::{LedgerPolicy, LedgerService},
        maintenance::{Maintenance, MaintenanceIntervals},
        objects::ObjectRepo,
        retry::RetryPolicy,
        upload_service::{UploadService, UploadSettings},
    },
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared handles passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub config: Arc<AppConfig>,
    pub backend: Arc<dyn ObjectBackend>,
    pub ledger: LedgerService,
    pub objects: ObjectRepo,
    pub uploads: UploadService,
    pub downloads: DownloadService,
    pub dispatcher: Arc<Dispatcher<Endpoint>>,
}

impl AppState {
    pub fn new(config: AppConfig, db: SqlitePool, backend: Arc<dyn ObjectBackend>) -> Self {
        let db = Arc::new(db);
        let ledger = LedgerService::new(db.clone(), LedgerPolicy::from_config(&config));
        let retry = RetryPolicy {
            attempts: config.read_retries.max(1),
            base_delay: config.retry_base_delay,
            timeout: config.request_timeout,
        };
        let objects = ObjectRepo::new(db.clone(), backend.clone(), ledger.clone(), retry);
        let uploads = UploadService::new(
            objects.clone(),
            UploadSettings {
                debug: config.debug,
                finalize_wait: config.request_timeout,
                chunk_lease: config.request_timeout * 2,
            },
        );
        let downloads = DownloadService::new(objects.clone());

        Self {
            db,
            config: Arc::new(config),
            backend,
            ledger,
            objects,
            uploads,
            downloads,
            dispatcher: Arc::new(crate::routes::routes::dispatcher()),
        }
    }

    pub fn maintenance(&self) -> Maintenance {
        Maintenance::new(
            self.ledger.clone(),
            self.objects.clone(),
            MaintenanceIntervals {
                reaper: self.config.reaper_interval,
                reconcile: self.config.reconcile_interval,
                bandwidth_reset: self.config.bandwidth_reset_interval,
            },
        )
    }
}
