use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SCAN_BATCH: u32 = 100;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 8;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_CLAIM_LEASE_SECS: u64 = 600;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub publishers: PublishersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before giving up.
    /// Several scanners share one file, so this must comfortably exceed a claim.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Scanner cadence, retry budget and worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-item scans.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Upper bound on claims attempted per scan.
    #[serde(default = "default_scan_batch")]
    pub scan_batch: u32,
    /// Attempts allowed per occurrence before an item is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before retry N is `backoff_secs[N-1]`, clamped to the last entry.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    /// Per-platform publish call timeout.
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    /// Maximum publish workers running at once.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Capacity of the dispatch queue between scanner and workers.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// An in-flight claim older than this is presumed abandoned and charged a
    /// failed attempt. Never shorter than twice `publish_timeout_secs`.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            scan_batch: DEFAULT_SCAN_BATCH,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_secs: default_backoff_secs(),
            publish_timeout_secs: DEFAULT_PUBLISH_TIMEOUT_SECS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            claim_lease_secs: DEFAULT_CLAIM_LEASE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublishersConfig {
    /// Platforms published through a generic JSON webhook.
    #[serde(default)]
    pub webhooks: Vec<WebhookPublisherConfig>,
}

/// A platform whose publish call is a POST to a fixed endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPublisherConfig {
    /// Platform identifier as used in `ScheduleItem::platforms` (e.g. "twitter").
    pub platform: String,
    /// Endpoint receiving `{platform, content, media_refs}`.
    pub url: String,
    /// Optional bearer token sent in the Authorization header.
    pub token: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_scan_interval_secs() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}
fn default_scan_batch() -> u32 {
    DEFAULT_SCAN_BATCH
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_secs() -> Vec<u64> {
    vec![60, 300, 900]
}
fn default_publish_timeout_secs() -> u64 {
    DEFAULT_PUBLISH_TIMEOUT_SECS
}
fn default_worker_concurrency() -> usize {
    DEFAULT_WORKER_CONCURRENCY
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_claim_lease_secs() -> u64 {
    DEFAULT_CLAIM_LEASE_SECS
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__MAX_ATTEMPTS=5`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
