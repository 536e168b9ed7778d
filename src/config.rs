//! Engine configuration
//!
//! Values come from defaults, optionally overridden by environment variables
//! (a `.env` file in the working directory is honoured through `dotenvy`).

use std::path::PathBuf;
use std::time::Duration;

use crate::db::{Database, DbResult, Slot};

pub const DEFAULT_API_BASE_URL: &str = "https://us-central1-shootsdb-11bb7.cloudfunctions.net";
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CLOUD_KEY_QUOTA: u64 = 1024;

const ENV_API_URL: &str = "SHOOTSCHEDULE_API_URL";
const ENV_DEBOUNCE_MS: &str = "SHOOTSCHEDULE_DEBOUNCE_MS";
const ENV_HTTP_TIMEOUT_SECS: &str = "SHOOTSCHEDULE_HTTP_TIMEOUT_SECS";
const ENV_DATA_DIR: &str = "SHOOTSCHEDULE_DATA_DIR";
const ENV_DEVICE_NAME: &str = "SHOOTSCHEDULE_DEVICE_NAME";

const DEVICE_ID_KEY: &str = "device_id";

/// Configuration for the synchronization engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the remote preference service
    pub api_base_url: String,

    /// Quiet period before a scheduled push fires
    pub debounce: Duration,

    /// Timeout for every HTTP request
    pub http_timeout: Duration,

    /// Directory holding the settings database
    pub data_dir: PathBuf,

    /// Human readable device name
    pub device_name: String,

    /// Stable device identifier (filled by [`EngineConfig::resolve_device_id`])
    pub device_id: Option<String>,

    /// Maximum number of keys the cloud replica accepts
    pub cloud_key_quota: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            data_dir: default_data_dir(),
            device_name: default_device_name(),
            device_id: None,
            cloud_key_quota: DEFAULT_CLOUD_KEY_QUOTA,
        }
    }
}

impl EngineConfig {
    /// Build configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            config.api_base_url = url.trim().trim_end_matches('/').to_string();
        }

        if let Some(ms) = parse_u64(&lookup, ENV_DEBOUNCE_MS) {
            config.debounce = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_u64(&lookup, ENV_HTTP_TIMEOUT_SECS) {
            config.http_timeout = Duration::from_secs(secs);
        }

        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(name) = lookup(ENV_DEVICE_NAME).filter(|v| !v.trim().is_empty()) {
            config.device_name = name;
        }

        config
    }

    /// Path of the settings database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("shootschedule.db")
    }

    /// Load the persisted device id, generating and storing one on first run
    pub fn resolve_device_id(&mut self, db: &Database) -> DbResult<String> {
        if let Some(id) = &self.device_id {
            return Ok(id.clone());
        }

        let id = match db.get_setting::<String>(Slot::Primary, DEVICE_ID_KEY) {
            Ok(Some(id)) => id,
            Ok(None) | Err(crate::db::DbError::Serialization(_)) => {
                let id = uuid::Uuid::new_v4().to_string();
                db.set_setting(Slot::Primary, DEVICE_ID_KEY, &id)?;
                log::info!("Generated new device id {}", id);
                id
            }
            Err(e) => return Err(e),
        };

        self.device_id = Some(id.clone());
        Ok(id)
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    match directories::ProjectDirs::from("com", "shootschedule", "shootschedule") {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => {
            log::warn!("Failed to get app directories, using current directory");
            PathBuf::from(".")
        }
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("{} Device", std::env::consts::OS))
}
