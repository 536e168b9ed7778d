//! # ShootSchedule Sync
//!
//! Preference and marked-event synchronization engine for ShootSchedule.
//! Keeps a user's marked events and filters consistent across the local
//! store, the cloud replica, the remote preference service and the calendar.

pub mod cache;
pub mod calendar;
pub mod catalog;
pub mod config;
pub mod db;
pub mod store;
pub mod sync;

use std::sync::Arc;

use cache::CloudHub;
use calendar::{CalendarReconciler, MemoryCalendar};
use catalog::InMemoryCatalog;
use config::EngineConfig;
use db::{Database, DbError};
use store::LocalPreferenceStore;
use sync::{PreferenceApiClient, PreferenceApiError, SyncCoordinator, SyncStatus};

pub use sync::{
    CalendarAccess, ConflictStrategy, FilterPreferences, IdentityProof, MarkedItemSet,
    PreferenceSnapshot, SyncError, SyncState, TemperatureUnit,
};

// ============================================================================
// Logging
// ============================================================================

/// Initialize the logger once; later calls are ignored
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

// ============================================================================
// Engine Bootstrap
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Failed to create data directory: {0}")]
    DataDir(#[from] std::io::Error),

    #[error("Database initialization failed: {0}")]
    Database(#[from] DbError),

    #[error("Failed to build API client: {0}")]
    Api(#[from] PreferenceApiError),
}

/// A fully wired engine: coordinator plus the in-process collaborators
pub struct Engine {
    pub config: EngineConfig,
    pub coordinator: SyncCoordinator,
    pub calendar: MemoryCalendar,
    pub catalog: InMemoryCatalog,
    pub cloud: CloudHub,
}

/// Open the database and build a coordinator from `config`
///
/// Nothing is loaded yet; call [`SyncCoordinator::start`] on the result.
pub fn bootstrap(mut config: EngineConfig) -> Result<Engine, BootstrapError> {
    std::fs::create_dir_all(&config.data_dir)?;

    let db_path = config.database_path();
    log::info!("Database path: {:?}", db_path);
    let db = Database::new(db_path)?;

    let device_id = config.resolve_device_id(&db)?;
    log::info!("Device: {} ({})", config.device_name, device_id);

    let cloud = CloudHub::with_quota(config.cloud_key_quota);
    let calendar = MemoryCalendar::new();
    let catalog = InMemoryCatalog::new();
    let remote = PreferenceApiClient::new(config.api_base_url.clone(), config.http_timeout)?;
    log::info!("Preference service: {}", remote.base_url());

    let local = LocalPreferenceStore::new(db);
    let reconciler = CalendarReconciler::new(
        Arc::new(calendar.clone()),
        Arc::new(catalog.clone()),
        local.clone(),
    );
    let coordinator = SyncCoordinator::new(
        local,
        Arc::new(cloud.device(device_id)),
        Arc::new(remote),
        reconciler,
        config.debounce,
    );

    Ok(Engine {
        config,
        coordinator,
        calendar,
        catalog,
        cloud,
    })
}

/// One sync pass: load, pull if signed in, flush pending pushes
pub async fn sync_once(engine: &Engine) -> SyncStatus {
    let coordinator = &engine.coordinator;
    coordinator.start().await;

    if coordinator.is_authenticated().await {
        coordinator.on_foreground().await;
    } else {
        log::info!("No stored session, skipping remote pull");
    }

    coordinator.flush().await;
    coordinator.shutdown();
    coordinator.status()
}

fn summarize(status: &SyncStatus) -> String {
    let mut line = format!(
        "state={} marked={} authenticated={} calendar={:?}",
        status.state.as_str(),
        status.marked_count,
        status.authenticated,
        status.calendar_access
    );
    if let Some(at) = status.last_pull_at {
        line.push_str(&format!(" last_pull={}", at.to_rfc3339()));
    }
    if let Some(error) = &status.last_error {
        line.push_str(&format!(" error=\"{}\"", error));
    }
    line
}

pub fn run() {
    init_logging();

    let config = EngineConfig::from_env();

    let engine = match bootstrap(config) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("Startup failed: {}", e);
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let status = runtime.block_on(sync_once(&engine));
    println!("{}", summarize(&status));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            api_base_url: "http://127.0.0.1:9".to_string(),
            debounce: Duration::from_millis(10),
            http_timeout: Duration::from_secs(1),
            data_dir: dir.join("data"),
            device_name: "test-device".to_string(),
            device_id: None,
            cloud_key_quota: 16,
        }
    }

    #[tokio::test]
    async fn test_bootstrap_creates_database_and_device_id() {
        let dir = tempfile::tempdir().unwrap();

        let engine = bootstrap(test_config(dir.path())).unwrap();
        let device_id = engine.config.device_id.clone().unwrap();
        assert!(engine.config.database_path().exists());

        // Same data dir keeps the same device
        let again = bootstrap(test_config(dir.path())).unwrap();
        assert_eq!(again.config.device_id, Some(device_id));
    }

    #[tokio::test]
    async fn test_sync_once_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let engine = bootstrap(test_config(dir.path())).unwrap();

        let status = sync_once(&engine).await;
        assert_eq!(status.state, SyncState::Idle);
        assert!(!status.authenticated);
        assert_eq!(status.marked_count, 0);
    }

    #[test]
    fn test_summary_line() {
        let status = SyncStatus {
            marked_count: 3,
            last_error: Some("offline".to_string()),
            ..Default::default()
        };
        let line = summarize(&status);
        assert!(line.starts_with("state=uninitialized marked=3"));
        assert!(line.ends_with("error=\"offline\""));
    }
}
