use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};

/// Cron cadence used when `publisher.cadence` is not set: every minute.
pub const DEFAULT_CADENCE: &str = "* * * * *";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONFIG_FILE: &str = "vitrine.toml";
/// Env var naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "VITRINE_CONFIG";
/// Prefix for env overrides; nested keys use `__` (`VITRINE_STORE__URL`).
pub const ENV_PREFIX: &str = "VITRINE_";

/// Top-level config (vitrine.toml + VITRINE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VitrineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

/// Persistent store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `sqlite://<path>` or `sqlite::memory:`. Every publication run needs it;
    /// absence is reported when the first connection is attempted.
    pub url: Option<String>,
    /// How long a statement waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Create the `content_items` table on connect if it is missing.
    #[serde(default = "bool_true")]
    pub init_schema: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            init_schema: true,
        }
    }
}

impl StoreConfig {
    /// Store settings pointing at `url`, everything else defaulted.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// The configured address, treating blank strings as absent.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// Scheduled publication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Cron expression (5, 6 or 7 fields), `@every <n><unit>`, or an alias
    /// such as `@hourly`.
    #[serde(default = "default_cadence")]
    pub cadence: String,
    /// Shared secret the manual entrypoint asks for before running.
    /// The publication job itself never checks it.
    pub manual_token: Option<String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            cadence: default_cadence(),
            manual_token: None,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_cadence() -> String {
    DEFAULT_CADENCE.to_string()
}

impl VitrineConfig {
    /// Load config from a TOML file with VITRINE_* env var overrides.
    ///
    /// File lookup order:
    ///   1. Explicit path argument
    ///   2. `$VITRINE_CONFIG`
    ///   3. `./vitrine.toml`
    ///
    /// A missing file is not an error; env vars and defaults still apply.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        debug!(%path, "loading configuration");

        Self::figment(&path)
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// The provider stack used by [`VitrineConfig::load`].
    pub fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}
