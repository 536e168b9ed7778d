//! Calendar reconciliation
//!
//! Projects the marked set into the calendar so that every marked event has
//! exactly one keyed entry and unmarked events have none. Every pass starts
//! with a dedup step, so repeated or racing passes converge instead of
//! accumulating duplicates.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::key;
use super::store::{CalendarEntry, CalendarEntryDraft, CalendarError, CalendarStore};
use crate::catalog::{is_present, CatalogEvent, EventCatalog};
use crate::store::LocalPreferenceStore;
use crate::sync::models::MarkedItemSet;

/// Title of the calendar holding the app's entries
pub const APP_CALENDAR_TITLE: &str = "ShootSchedule";

/// Reminder one day before the event starts
const ALARM_OFFSET_SECS: i64 = -86_400;

const FOOTER: &str = "Added by ShootSchedule";

/// Outcome counters of a reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl ReconcileStats {
    fn absorb(&mut self, other: ReconcileStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

/// Keeps calendar entries in step with the marked set
///
/// Every entry lives in a dedicated app calendar, found by its saved id,
/// then by title, and created on first use. Entries in other calendars are
/// never read or touched.
#[derive(Clone)]
pub struct CalendarReconciler {
    calendar: Arc<dyn CalendarStore>,
    catalog: Arc<dyn EventCatalog>,
    local: LocalPreferenceStore,
    app_calendar: Arc<Mutex<Option<String>>>,
}

impl CalendarReconciler {
    pub fn new(
        calendar: Arc<dyn CalendarStore>,
        catalog: Arc<dyn EventCatalog>,
        local: LocalPreferenceStore,
    ) -> Self {
        Self {
            calendar,
            catalog,
            local,
            app_calendar: Arc::new(Mutex::new(None)),
        }
    }

    pub fn calendar(&self) -> &Arc<dyn CalendarStore> {
        &self.calendar
    }

    // ========================================================================
    // App calendar
    // ========================================================================

    /// Id of the app calendar, creating the calendar if it does not exist
    pub async fn ensure_app_calendar(&self) -> Result<String, CalendarError> {
        match self.resolve_app_calendar(true).await? {
            Some(id) => Ok(id),
            None => Err(CalendarError::Store("app calendar unavailable".to_string())),
        }
    }

    /// Id of the app calendar, `None` when it was never created
    pub async fn find_app_calendar(&self) -> Result<Option<String>, CalendarError> {
        self.resolve_app_calendar(false).await
    }

    async fn resolve_app_calendar(&self, create: bool) -> Result<Option<String>, CalendarError> {
        let mut cached = self.app_calendar.lock().await;

        let candidates: Vec<String> = cached
            .iter()
            .cloned()
            .chain(self.local.load_app_calendar_id())
            .collect();
        for id in candidates {
            if self.calendar.calendar_by_id(&id).await?.is_some() {
                *cached = Some(id.clone());
                return Ok(Some(id));
            }
        }

        let found = self
            .calendar
            .calendars()
            .await?
            .into_iter()
            .find(|c| c.title == APP_CALENDAR_TITLE);

        let info = match found {
            Some(info) => {
                log::debug!("Found existing {} calendar", APP_CALENDAR_TITLE);
                info
            }
            None if create => {
                let info = self.calendar.create_calendar(APP_CALENDAR_TITLE).await?;
                log::info!("Created {} calendar {}", APP_CALENDAR_TITLE, info.id);
                info
            }
            None => {
                *cached = None;
                return Ok(None);
            }
        };

        if let Err(e) = self.local.save_app_calendar_id(&info.id) {
            log::warn!("Failed to save app calendar id: {}", e);
        }
        *cached = Some(info.id.clone());
        Ok(Some(info.id))
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Ensure exactly one up-to-date entry exists for `event`
    pub async fn mark_item(&self, event: &CatalogEvent) -> ReconcileStats {
        let mut stats = ReconcileStats::default();

        let calendar_id = match self.ensure_app_calendar().await {
            Ok(id) => id,
            Err(e) => {
                log::warn!("No app calendar for item {}: {}", event.id, e);
                stats.failed += 1;
                return stats;
            }
        };

        let survivor = match self.dedupe(&calendar_id, event.id, &mut stats).await {
            Ok(survivor) => survivor,
            Err(e) => {
                log::warn!("Calendar lookup failed for item {}: {}", event.id, e);
                stats.failed += 1;
                return stats;
            }
        };

        let draft = entry_draft(event);
        match survivor {
            Some(entry) => match self.calendar.update(&entry.id, draft).await {
                Ok(()) => {
                    log::debug!("Updated calendar entry for item {}", event.id);
                    stats.updated += 1;
                }
                Err(e) => {
                    log::warn!("Failed to update calendar entry for item {}: {}", event.id, e);
                    stats.failed += 1;
                }
            },
            None => match self.calendar.create(&calendar_id, draft).await {
                Ok(_) => {
                    log::info!("Created calendar entry for item {}", event.id);
                    stats.created += 1;
                }
                Err(e) => {
                    log::warn!("Failed to create calendar entry for item {}: {}", event.id, e);
                    stats.failed += 1;
                }
            },
        }

        stats
    }

    /// Delete every entry carrying the key for `item_id`
    pub async fn unmark_item(&self, item_id: i64) -> ReconcileStats {
        let mut stats = ReconcileStats::default();

        let lookup = match self.find_app_calendar().await {
            Ok(Some(calendar_id)) => self.calendar.find_by_item_key(&calendar_id, item_id).await,
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(e),
        };
        let entries = match lookup {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Calendar lookup failed for item {}: {}", item_id, e);
                stats.failed += 1;
                return stats;
            }
        };

        for entry in entries {
            self.delete_entry(&entry, item_id, &mut stats).await;
        }

        if stats.deleted > 0 {
            log::info!("Removed {} calendar entries for item {}", stats.deleted, item_id);
        }
        stats
    }

    /// Run [`Self::mark_item`] for every marked event the catalog knows
    pub async fn sync_marked(&self, marked: &MarkedItemSet) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        if marked.is_empty() {
            return stats;
        }

        let ids: BTreeSet<i64> = marked.iter().collect();
        let events = match self.catalog.lookup_events_by_id(&ids).await {
            Ok(events) => events,
            Err(e) => {
                log::error!("Catalog lookup failed, skipping calendar sync: {}", e);
                stats.failed += ids.len();
                return stats;
            }
        };

        let found: BTreeSet<i64> = events.iter().map(|e| e.id).collect();
        for missing in ids.difference(&found) {
            log::warn!("Marked item {} not in catalog, no calendar entry", missing);
        }

        for event in &events {
            stats.absorb(self.mark_item(event).await);
        }

        log::info!(
            "Calendar sync: {} created, {} updated, {} deleted, {} failed",
            stats.created,
            stats.updated,
            stats.deleted,
            stats.failed
        );
        stats
    }

    /// Bring the calendar from `previous` to `current`
    pub async fn reconcile(&self, previous: &MarkedItemSet, current: &MarkedItemSet) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        for removed in previous.difference(current) {
            stats.absorb(self.unmark_item(removed).await);
        }
        stats.absorb(self.sync_marked(current).await);
        stats
    }

    /// Delete every keyed entry of the app calendar
    pub async fn remove_all(&self) -> ReconcileStats {
        let mut stats = ReconcileStats::default();

        let lookup = match self.find_app_calendar().await {
            Ok(Some(calendar_id)) => self.calendar.find_all_keyed(&calendar_id).await,
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(e),
        };
        let entries = match lookup {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Calendar lookup failed, nothing removed: {}", e);
                stats.failed += 1;
                return stats;
            }
        };

        for entry in entries {
            let item_id = key::extract_item_key(&entry.notes).unwrap_or_default();
            self.delete_entry(&entry, item_id, &mut stats).await;
        }

        log::info!("Removed {} calendar entries", stats.deleted);
        stats
    }

    /// Delete all but the newest entry for `item_id` and return the newest
    async fn dedupe(
        &self,
        calendar_id: &str,
        item_id: i64,
        stats: &mut ReconcileStats,
    ) -> Result<Option<CalendarEntry>, CalendarError> {
        let mut entries = self.calendar.find_by_item_key(calendar_id, item_id).await?;
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut entries = entries.into_iter();
        let newest = entries.next();

        let duplicates: Vec<CalendarEntry> = entries.collect();
        if !duplicates.is_empty() {
            log::info!(
                "Found {} duplicate calendar entries for item {}",
                duplicates.len(),
                item_id
            );
        }
        for duplicate in duplicates {
            self.delete_entry(&duplicate, item_id, stats).await;
        }

        Ok(newest)
    }

    async fn delete_entry(&self, entry: &CalendarEntry, item_id: i64, stats: &mut ReconcileStats) {
        match self.calendar.delete(&entry.id).await {
            Ok(()) => stats.deleted += 1,
            Err(e) => {
                log::warn!(
                    "Failed to delete calendar entry {} for item {}: {}",
                    entry.id,
                    item_id,
                    e
                );
                stats.failed += 1;
            }
        }
    }
}

/// Calendar fields for a catalog event
pub fn entry_draft(event: &CatalogEvent) -> CalendarEntryDraft {
    let locality = event.locality();

    let mut body = vec![event.name.clone(), format!("Club: {}", event.club_name)];

    if let Some(locality) = &locality {
        body.push(format!("Location: {}", locality));
    }

    if let Some(event_type) = event.event_type.as_deref().filter(|t| !t.is_empty()) {
        match event.shoot_type.as_deref().filter(|t| is_present(t)) {
            Some(shoot_type) => body.push(format!("Type: {} {}", event_type, shoot_type)),
            None => body.push(format!("Type: {}", event_type)),
        }
    }

    if let Some(name) = present(&event.contact_name) {
        body.push(format!("Contact: {}", name));
    }
    if let Some(phone) = present(&event.contact_phone) {
        body.push(format!("Phone: {}", phone));
    }
    if let Some(email) = present(&event.contact_email).or_else(|| present(&event.club_email)) {
        body.push(format!("Email: {}", email));
    }

    body.push(String::new());
    body.push(FOOTER.to_string());

    let location = match (present(&event.address), &locality) {
        (Some(address), Some(locality)) => Some(format!("{}, {}", address, locality)),
        (Some(address), None) => Some(address.to_string()),
        (None, Some(locality)) => Some(locality.clone()),
        (None, None) => None,
    };

    let last_day = event.last_day();

    CalendarEntryDraft {
        title: event.display_label(),
        notes: key::embed_item_key(&body.join("\n"), event.id),
        location,
        url: present(&event.club_email).map(|email| format!("mailto:{}", email)),
        all_day: true,
        start_date: event.start_date,
        end_date: last_day.succ_opt().unwrap_or(last_day),
        alarm_offset_secs: Some(ALARM_OFFSET_SECS),
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| is_present(v))
}
