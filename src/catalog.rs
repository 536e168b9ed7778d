//! Event catalog
//!
//! The catalog is a read-only dataset of shooting events. The sync engine
//! only needs lookups by id (for calendar entries) and a full listing.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A single catalog event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEvent {
    pub id: i64,
    pub name: String,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub club_name: String,
    #[serde(default)]
    pub event_type: Option<String>,
    /// Notability tier ("State", "World", ...), absent for ordinary events
    #[serde(default)]
    pub shoot_type: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub club_email: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
}

impl CatalogEvent {
    /// "<eventType> <name>", or just the name
    pub fn display_label(&self) -> String {
        match self.event_type.as_deref().filter(|t| !t.is_empty()) {
            Some(event_type) => format!("{} {}", event_type, self.name),
            None => self.name.clone(),
        }
    }

    /// "City, RG" using whichever parts are known
    pub fn locality(&self) -> Option<String> {
        let parts: Vec<&str> = [self.city.as_deref(), self.region.as_deref()]
            .into_iter()
            .flatten()
            .filter(|p| is_present(p))
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    pub fn is_notable(&self) -> bool {
        self.shoot_type.as_deref().map_or(false, is_present)
    }

    /// Last day of the event (single-day events end on their start date)
    pub fn last_day(&self) -> NaiveDate {
        self.end_date.unwrap_or(self.start_date)
    }
}

/// Catalog fields use "none" as a placeholder for missing values
pub(crate) fn is_present(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && !value.eq_ignore_ascii_case("none")
}

/// Read access to the event catalog
#[async_trait]
pub trait EventCatalog: Send + Sync {
    /// Events for the given ids; unknown ids are silently absent
    async fn lookup_events_by_id(&self, ids: &BTreeSet<i64>) -> Result<Vec<CatalogEvent>, CatalogError>;

    async fn all_events(&self) -> Result<Vec<CatalogEvent>, CatalogError>;
}

/// Catalog held entirely in memory
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    events: Arc<RwLock<BTreeMap<i64, CatalogEvent>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = CatalogEvent>) -> Self {
        Self {
            events: Arc::new(RwLock::new(events.into_iter().map(|e| (e.id, e)).collect())),
        }
    }

    /// Load a catalog from a JSON array of events
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let events: Vec<CatalogEvent> = serde_json::from_str(json)?;
        log::info!("Loaded {} catalog events", events.len());
        Ok(Self::with_events(events))
    }

    /// Insert or replace an event
    pub async fn upsert(&self, event: CatalogEvent) {
        self.events.write().await.insert(event.id, event);
    }
}

#[async_trait]
impl EventCatalog for InMemoryCatalog {
    async fn lookup_events_by_id(&self, ids: &BTreeSet<i64>) -> Result<Vec<CatalogEvent>, CatalogError> {
        let events = self.events.read().await;
        Ok(ids.iter().filter_map(|id| events.get(id).cloned()).collect())
    }

    async fn all_events(&self) -> Result<Vec<CatalogEvent>, CatalogError> {
        Ok(self.events.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
pub(crate) fn sample_event(id: i64) -> CatalogEvent {
    CatalogEvent {
        id,
        name: format!("Spring Classic {}", id),
        start_date: NaiveDate::from_ymd_opt(2026, 4, 10).unwrap_or_default(),
        end_date: NaiveDate::from_ymd_opt(2026, 4, 12),
        club_name: "Rio Salado".to_string(),
        event_type: Some("NSCA".to_string()),
        shoot_type: None,
        address: Some("1 Range Rd".to_string()),
        city: Some("Mesa".to_string()),
        region: Some("AZ".to_string()),
        club_email: Some("club@example.com".to_string()),
        contact_name: Some("none".to_string()),
        contact_phone: Some("555-0100".to_string()),
        contact_email: None,
    }
}
