use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use vows_common::DEFAULT_TEMPLATE_ID;
use vows_editor::{EngineConfig, DEFAULT_REALTIME_RETRY, DEFAULT_SLUG_DEBOUNCE, MAX_REALTIME_RETRY};

pub const DEFAULT_CONFIG_NAME: &str = "vows.config.json";

/// Vows configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Directory holding one `<owner>.json` document per owner
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Quiet period before the slug uniqueness lookup
    #[serde(default = "default_slug_debounce_ms")]
    pub slug_debounce_ms: u64,

    /// First resubscribe delay after the realtime channel drops
    #[serde(default = "default_realtime_retry_ms")]
    pub realtime_retry_ms: u64,

    /// Template given to documents created on first sign in
    #[serde(default = "default_template_id")]
    pub default_template_id: String,

    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_http_port() -> u16 {
    3030
}

fn default_slug_debounce_ms() -> u64 {
    DEFAULT_SLUG_DEBOUNCE.as_millis() as u64
}

fn default_realtime_retry_ms() -> u64 {
    DEFAULT_REALTIME_RETRY.as_millis() as u64
}

fn default_template_id() -> String {
    DEFAULT_TEMPLATE_ID.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load config from a directory
    pub fn load(cwd: &str) -> anyhow::Result<Self> {
        let config_path = PathBuf::from(cwd).join(DEFAULT_CONFIG_NAME);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            // Return default config if none exists
            Ok(Config::default())
        }
    }

    /// Get absolute path to the data directory
    pub fn get_data_dir(&self, cwd: &str) -> PathBuf {
        PathBuf::from(cwd).join(&self.data_dir)
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        let realtime_retry = Duration::from_millis(self.realtime_retry_ms);
        EngineConfig {
            slug_debounce: Duration::from_millis(self.slug_debounce_ms),
            realtime_retry,
            realtime_retry_max: realtime_retry.max(MAX_REALTIME_RETRY),
            default_template_id: self.default_template_id.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            slug_debounce_ms: default_slug_debounce_ms(),
            realtime_retry_ms: default_realtime_retry_ms(),
            default_template_id: default_template_id(),
            log_level: default_log_level(),
        }
    }
}
