//! Cloud replicated key-value store
//!
//! A small key-value space that the platform replicates across every device
//! of a user. Writes are fire-and-forget; the only feedback is an
//! [`ExternalChange`] notification delivered to the *other* devices.
//!
//! [`CloudHub`] is an in-process replication backend (one per user account)
//! built on a moka cache with a key quota. [`CloudDeviceStore`] is the handle
//! a single device holds.

use async_trait::async_trait;
use moka::future::Cache;
use moka::notification::RemovalCause;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast;

use crate::config::DEFAULT_CLOUD_KEY_QUOTA;

/// Buffered notifications per device before slow receivers start lagging
const NOTIFICATION_BUFFER: usize = 64;

/// Why a key changed underneath this device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// Another device wrote the key
    ServerChange,
    /// Another device removed the key
    Removed,
    /// The key was dropped because the store exceeded its quota
    QuotaViolation,
}

/// Change notification for keys updated by someone other than this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalChange {
    pub changed_keys: Vec<String>,
    pub reason: ChangeReason,
}

/// Cloud-replicated key-value store as seen from one device
#[async_trait]
pub trait CloudKeyValueStore: Send + Sync {
    async fn set(&self, key: &str, data: Vec<u8>);

    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    async fn remove(&self, key: &str);

    /// Best-effort flush hint. Returns immediately, no completion guarantee.
    fn synchronize(&self);

    /// Notifications for changes made by other devices
    fn subscribe(&self) -> broadcast::Receiver<ExternalChange>;
}

// ============================================================================
// Hub
// ============================================================================

#[derive(Clone)]
struct CloudEntry {
    data: Arc<Vec<u8>>,
    digest: String,
}

type DeviceRegistry = Arc<StdMutex<HashMap<String, broadcast::Sender<ExternalChange>>>>;

/// In-process replicated key space shared by a user's devices
#[derive(Clone)]
pub struct CloudHub {
    cache: Arc<Cache<String, CloudEntry>>,
    devices: DeviceRegistry,
}

impl CloudHub {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_CLOUD_KEY_QUOTA)
    }

    /// Create a hub that keeps at most `max_keys` keys
    pub fn with_quota(max_keys: u64) -> Self {
        let devices: DeviceRegistry = Arc::new(StdMutex::new(HashMap::new()));
        let listener_devices = devices.clone();

        let cache = Cache::builder()
            .max_capacity(max_keys)
            .eviction_listener(move |key: Arc<String>, _value: CloudEntry, cause| {
                if cause == RemovalCause::Size {
                    log::warn!("Cloud key '{}' dropped: key quota exceeded", key);
                    broadcast_change(
                        &listener_devices,
                        None,
                        ExternalChange {
                            changed_keys: vec![key.as_ref().clone()],
                            reason: ChangeReason::QuotaViolation,
                        },
                    );
                }
            })
            .build();

        Self {
            cache: Arc::new(cache),
            devices,
        }
    }

    /// Handle for one device; the same id always shares one notification feed
    pub fn device(&self, device_id: impl Into<String>) -> CloudDeviceStore {
        let device_id = device_id.into();
        let sender = {
            let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
            devices
                .entry(device_id.clone())
                .or_insert_with(|| broadcast::channel(NOTIFICATION_BUFFER).0)
                .clone()
        };

        CloudDeviceStore {
            device_id,
            hub: self.clone(),
            sender,
        }
    }

    /// Number of keys currently stored
    pub async fn key_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    async fn write(&self, origin: &str, key: &str, data: Vec<u8>) {
        let digest = hex::encode(Sha256::digest(&data));

        if let Some(existing) = self.cache.get(key).await {
            if existing.digest == digest {
                log::debug!("Cloud key '{}' unchanged, skipping notification", key);
                return;
            }
        }

        self.cache
            .insert(
                key.to_string(),
                CloudEntry {
                    data: Arc::new(data),
                    digest,
                },
            )
            .await;

        broadcast_change(
            &self.devices,
            Some(origin),
            ExternalChange {
                changed_keys: vec![key.to_string()],
                reason: ChangeReason::ServerChange,
            },
        );
    }

    async fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).await.map(|entry| entry.data.as_ref().clone())
    }

    async fn delete(&self, origin: &str, key: &str) {
        if self.cache.remove(key).await.is_some() {
            broadcast_change(
                &self.devices,
                Some(origin),
                ExternalChange {
                    changed_keys: vec![key.to_string()],
                    reason: ChangeReason::Removed,
                },
            );
        }
    }
}

impl Default for CloudHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Deliver `change` to every registered device except `origin`
fn broadcast_change(devices: &DeviceRegistry, origin: Option<&str>, change: ExternalChange) {
    let devices = devices.lock().unwrap_or_else(|e| e.into_inner());
    for (device_id, sender) in devices.iter() {
        if Some(device_id.as_str()) == origin {
            continue;
        }
        // No receivers is fine: the device is not listening right now
        let _ = sender.send(change.clone());
    }
}

// ============================================================================
// Device handle
// ============================================================================

/// One device's view of the replicated key space
#[derive(Clone)]
pub struct CloudDeviceStore {
    device_id: String,
    hub: CloudHub,
    sender: broadcast::Sender<ExternalChange>,
}

impl CloudDeviceStore {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[async_trait]
impl CloudKeyValueStore for CloudDeviceStore {
    async fn set(&self, key: &str, data: Vec<u8>) {
        self.hub.write(&self.device_id, key, data).await;
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.hub.read(key).await
    }

    async fn remove(&self, key: &str) {
        self.hub.delete(&self.device_id, key).await;
    }

    fn synchronize(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let cache = self.hub.cache.clone();
            handle.spawn(async move {
                cache.run_pending_tasks().await;
            });
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ExternalChange> {
        self.sender.subscribe()
    }
}
