//! Engine configuration.
//!
//! Layered sources: struct defaults, then an optional `sessner` config
//! file, then `SESSNER_`-prefixed environment variables (separator `__`,
//! e.g. `SESSNER_LICENSE__BASE_URL`).

use serde::{Deserialize, Serialize};

use crate::Result;

pub const SANDBOX_BASE_URL: &str = "https://sandbox.merafsolutions.com";
pub const PRODUCTION_BASE_URL: &str = "https://prod.merafsolutions.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// Build-time toggle: sandbox for development, production for release.
    pub base_url: String,
    pub register_secret: String,
    pub retrieve_secret: String,
    pub validate_secret: String,
    pub timeout_secs: u64,
    /// Revalidation is skipped while the cached record is younger than
    /// this.
    pub fresh_window_days: i64,
    /// After this long without a successful validation the tier drops to
    /// FREE.
    pub grace_window_days: i64,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            base_url: if cfg!(debug_assertions) {
                SANDBOX_BASE_URL.to_owned()
            } else {
                PRODUCTION_BASE_URL.to_owned()
            },
            register_secret: String::new(),
            retrieve_secret: String::new(),
            validate_secret: String::new(),
            timeout_secs: 10,
            fresh_window_days: 7,
            grace_window_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cookie-leak sweeper period. Two minutes suits a suspendable host;
    /// a persistent host may shorten it.
    pub sweeper_interval_secs: u64,
    pub license_check_interval_secs: u64,
    pub dormant_cleanup_interval_secs: u64,
    pub keepalive_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweeper_interval_secs: 120,
            license_check_interval_secs: 86_400,
            dormant_cleanup_interval_secs: 3_600,
            keepalive_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Coalescing window for rapid mutation streams.
    pub debounce_millis: u64,
    /// Soft budget for the durable key-value layer.
    pub durable_quota_bytes: usize,
    /// Structural cleanup is suppressed this long after a restart so the
    /// host can reattach restored tabs.
    pub startup_grace_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_millis: 1_000,
            durable_quota_bytes: 10 * 1024 * 1024,
            startup_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub license: LicenseConfig,
    pub scheduler: SchedulerConfig,
    pub persistence: PersistenceConfig,
    /// Window for the noopener inheritance heuristic.
    pub recent_domain_window_millis: i64,
    /// Payloads above this compress on export.
    pub export_compress_threshold_bytes: usize,
    /// Hard cap on accepted import documents.
    pub import_max_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            license: LicenseConfig::default(),
            scheduler: SchedulerConfig::default(),
            persistence: PersistenceConfig::default(),
            recent_domain_window_millis: 30_000,
            export_compress_threshold_bytes: 100 * 1024,
            import_max_bytes: 50 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Defaults → optional `sessner.{toml,yaml,json}` file → environment.
    pub fn load() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(config::File::with_name("sessner").required(false))
            .add_source(config::Environment::with_prefix("SESSNER").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

impl From<config::ConfigError> for crate::Error {
    fn from(e: config::ConfigError) -> Self {
        crate::Error::InvalidInput(format!("configuration: {e}"))
    }
}
