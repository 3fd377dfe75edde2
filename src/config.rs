use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const GIB: i64 = 1024 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,

    /// Storage granted to accounts without an active subscription.
    /// Zero or less turns off storage/send quota enforcement.
    pub default_user_storage: i64,
    /// Monthly send allowance for accounts without an active subscription.
    pub default_user_send: i64,
    /// Maximum number of accounts, `None` for unlimited.
    pub max_accounts: Option<u64>,

    pub bandwidth_multiplier: i64,
    pub bandwidth_monitor_days: i64,

    /// Upper bound for a single object-backend call.
    pub request_timeout: Duration,
    /// Attempts made for idempotent backend reads.
    pub read_retries: u32,
    pub retry_base_delay: Duration,

    pub reaper_interval: Duration,
    pub reconcile_interval: Duration,
    pub bandwidth_reset_interval: Duration,

    /// Shared secret expected from the billing collaborator.
    pub billing_secret: Option<String>,
    /// Enables second-granularity expirations.
    pub debug: bool,

    pub tiers: SubscriptionCatalog,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "End-to-end encrypted file drop server")]
pub struct Args {
    /// Host to bind to (overrides SEALDROP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SEALDROP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides SEALDROP_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SEALDROP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Default per-account storage in bytes (overrides SEALDROP_DEFAULT_USER_STORAGE)
    #[arg(long, allow_negative_numbers = true)]
    pub default_user_storage: Option<i64>,

    /// Default per-account monthly send in bytes (overrides SEALDROP_DEFAULT_USER_SEND)
    #[arg(long, allow_negative_numbers = true)]
    pub default_user_send: Option<i64>,

    /// Maximum number of accounts, negative for unlimited (overrides SEALDROP_MAX_ACCOUNTS)
    #[arg(long, allow_negative_numbers = true)]
    pub max_accounts: Option<i64>,

    /// Enable debug-only behavior such as second-long expirations
    #[arg(long)]
    pub debug: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8090,
            storage_dir: "./data/objects".into(),
            database_url: "sqlite://./data/meta/sealdrop.db".into(),
            default_user_storage: 0,
            default_user_send: 0,
            max_accounts: None,
            bandwidth_multiplier: 3,
            bandwidth_monitor_days: 7,
            request_timeout: Duration::from_secs(30),
            read_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            reaper_interval: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(60 * 60),
            bandwidth_reset_interval: Duration::from_secs(24 * 60 * 60),
            billing_secret: None,
            debug: false,
            tiers: SubscriptionCatalog::builtin(),
        }
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_host = env::var("SEALDROP_HOST").unwrap_or(defaults.host);
        let env_port = env_parse("SEALDROP_PORT", defaults.port)?;
        let env_storage = env::var("SEALDROP_STORAGE_DIR").unwrap_or(defaults.storage_dir);
        let env_db = env::var("SEALDROP_DATABASE_URL").unwrap_or(defaults.database_url);
        let env_user_storage =
            env_parse("SEALDROP_DEFAULT_USER_STORAGE", defaults.default_user_storage)?;
        let env_user_send = env_parse("SEALDROP_DEFAULT_USER_SEND", defaults.default_user_send)?;
        let env_max_accounts = env_parse("SEALDROP_MAX_ACCOUNTS", -1i64)?;
        let env_debug = env_parse("SEALDROP_DEBUG", 0u8)? == 1;

        let max_accounts = args.max_accounts.unwrap_or(env_max_accounts);

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            default_user_storage: args.default_user_storage.unwrap_or(env_user_storage),
            default_user_send: args.default_user_send.unwrap_or(env_user_send),
            max_accounts: u64::try_from(max_accounts).ok(),
            bandwidth_multiplier: env_parse(
                "SEALDROP_BANDWIDTH_MULTIPLIER",
                defaults.bandwidth_multiplier,
            )?,
            bandwidth_monitor_days: env_parse(
                "SEALDROP_BANDWIDTH_MONITOR_DAYS",
                defaults.bandwidth_monitor_days,
            )?,
            request_timeout: Duration::from_secs(env_parse(
                "SEALDROP_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            read_retries: env_parse("SEALDROP_READ_RETRIES", defaults.read_retries)?,
            retry_base_delay: defaults.retry_base_delay,
            reaper_interval: Duration::from_secs(env_parse(
                "SEALDROP_REAPER_INTERVAL_SECS",
                defaults.reaper_interval.as_secs(),
            )?),
            reconcile_interval: defaults.reconcile_interval,
            bandwidth_reset_interval: defaults.bandwidth_reset_interval,
            billing_secret: env::var("SEALDROP_BILLING_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            debug: args.debug || env_debug,
            tiers: defaults.tiers,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Quota checks only apply when a positive default storage is configured.
    pub fn metering_enabled(&self) -> bool {
        self.default_user_storage > 0
    }

    /// Bandwidth is tracked unless the default storage is negative.
    pub fn bandwidth_tracking(&self) -> bool {
        self.default_user_storage >= 0
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(default),
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

/// Allotments granted by one subscription product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub tag: String,
    pub storage: i64,
    pub send: i64,
}

/// Subscription products keyed by tag.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionCatalog {
    tiers: Vec<Tier>,
}

impl SubscriptionCatalog {
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        for (name, storage_gib, send_gib) in [
            ("novice", 100, 50),
            ("regular", 500, 250),
            ("advanced", 2000, 1000),
        ] {
            for period in ["monthly", "yearly"] {
                catalog = catalog.with_tier(Tier {
                    tag: format!("{name}-{period}"),
                    storage: storage_gib * GIB,
                    send: send_gib * GIB,
                });
            }
        }
        catalog
    }

    /// Add or replace a tier.
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tiers.retain(|t| t.tag != tier.tag);
        self.tiers.push(tier);
        self
    }

    pub fn get(&self, tag: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.tag == tag)
    }
}
