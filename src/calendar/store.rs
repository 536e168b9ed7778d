//! Calendar service interface and an in-memory calendar

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::RwLock;

use super::key;
use crate::sync::models::CalendarAccess;

/// Id of the calendar every [`MemoryCalendar`] starts with
pub const DEFAULT_CALENDAR_ID: &str = "default";

#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("Calendar access denied")]
    PermissionDenied,

    #[error("Calendar entry not found: {0}")]
    NotFound(String),

    #[error("Calendar store error: {0}")]
    Store(String),
}

/// A named calendar holding entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarInfo {
    pub id: String,
    pub title: String,
}

/// An entry as stored by the calendar service
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntry {
    pub id: String,
    pub calendar_id: String,
    pub title: String,
    pub notes: String,
    pub location: Option<String>,
    pub url: Option<String>,
    pub all_day: bool,
    pub start_date: NaiveDate,
    /// Exclusive end date
    pub end_date: NaiveDate,
    /// Alarm offset relative to the start, in seconds
    pub alarm_offset_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Field values for creating or updating an entry
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntryDraft {
    pub title: String,
    pub notes: String,
    pub location: Option<String>,
    pub url: Option<String>,
    pub all_day: bool,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub alarm_offset_secs: Option<i64>,
}

/// External calendar service
#[async_trait]
pub trait CalendarStore: Send + Sync {
    /// Current authorization without prompting
    async fn authorization(&self) -> CalendarAccess;

    /// Ask the user for access
    async fn request_access(&self) -> Result<CalendarAccess, CalendarError>;

    async fn calendar_by_id(&self, calendar_id: &str) -> Result<Option<CalendarInfo>, CalendarError>;

    async fn calendars(&self) -> Result<Vec<CalendarInfo>, CalendarError>;

    async fn create_calendar(&self, title: &str) -> Result<CalendarInfo, CalendarError>;

    /// Entries of `calendar_id` carrying the key for `item_id`
    async fn find_by_item_key(
        &self,
        calendar_id: &str,
        item_id: i64,
    ) -> Result<Vec<CalendarEntry>, CalendarError>;

    /// Entries of `calendar_id` carrying any item key
    async fn find_all_keyed(&self, calendar_id: &str) -> Result<Vec<CalendarEntry>, CalendarError>;

    async fn create(
        &self,
        calendar_id: &str,
        draft: CalendarEntryDraft,
    ) -> Result<CalendarEntry, CalendarError>;

    async fn update(&self, entry_id: &str, draft: CalendarEntryDraft) -> Result<(), CalendarError>;

    async fn delete(&self, entry_id: &str) -> Result<(), CalendarError>;
}

// ============================================================================
// In-memory calendar
// ============================================================================

/// Calendar kept in memory, used by the CLI and in tests
#[derive(Clone)]
pub struct MemoryCalendar {
    calendars: Arc<RwLock<Vec<CalendarInfo>>>,
    entries: Arc<RwLock<Vec<CalendarEntry>>>,
    access: Arc<RwLock<CalendarAccess>>,
    grant_on_request: bool,
    failing_items: Arc<StdMutex<HashSet<i64>>>,
}

impl MemoryCalendar {
    /// Calendar that already has access granted
    pub fn new() -> Self {
        Self::build(CalendarAccess::Granted, true)
    }

    /// Calendar whose access prompt is always declined
    pub fn denying() -> Self {
        Self::build(CalendarAccess::NotDetermined, false)
    }

    /// Calendar that has not prompted yet and grants on request
    pub fn undetermined() -> Self {
        Self::build(CalendarAccess::NotDetermined, true)
    }

    fn build(access: CalendarAccess, grant_on_request: bool) -> Self {
        let default = CalendarInfo {
            id: DEFAULT_CALENDAR_ID.to_string(),
            title: "Calendar".to_string(),
        };

        Self {
            calendars: Arc::new(RwLock::new(vec![default])),
            entries: Arc::new(RwLock::new(Vec::new())),
            access: Arc::new(RwLock::new(access)),
            grant_on_request,
            failing_items: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Add a calendar, bypassing access checks
    pub async fn add_calendar(&self, title: &str) -> CalendarInfo {
        let info = CalendarInfo {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
        };
        self.calendars.write().await.push(info.clone());
        info
    }

    pub async fn calendar_titled(&self, title: &str) -> Option<CalendarInfo> {
        self.calendars
            .read()
            .await
            .iter()
            .find(|c| c.title == title)
            .cloned()
    }

    /// Insert an entry as-is, bypassing access checks
    pub async fn insert_raw(&self, entry: CalendarEntry) {
        self.entries.write().await.push(entry);
    }

    pub async fn entries(&self) -> Vec<CalendarEntry> {
        self.entries.read().await.clone()
    }

    /// Entries for `item_id` across every calendar
    pub async fn entries_for(&self, item_id: i64) -> Vec<CalendarEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| key::carries_item_key(&e.notes, item_id))
            .cloned()
            .collect()
    }

    /// Make every write of an entry for `item_id` fail
    pub fn fail_writes_for(&self, item_id: i64) {
        self.failing_items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(item_id);
    }

    async fn ensure_access(&self) -> Result<(), CalendarError> {
        if *self.access.read().await == CalendarAccess::Granted {
            Ok(())
        } else {
            Err(CalendarError::PermissionDenied)
        }
    }

    fn check_failure(&self, notes: &str) -> Result<(), CalendarError> {
        let failing = self.failing_items.lock().unwrap_or_else(|e| e.into_inner());
        match key::extract_item_key(notes) {
            Some(id) if failing.contains(&id) => {
                Err(CalendarError::Store(format!("write rejected for item {}", id)))
            }
            _ => Ok(()),
        }
    }
}

impl Default for MemoryCalendar {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CalendarStore for MemoryCalendar {
    async fn authorization(&self) -> CalendarAccess {
        *self.access.read().await
    }

    async fn request_access(&self) -> Result<CalendarAccess, CalendarError> {
        let mut access = self.access.write().await;
        if *access == CalendarAccess::NotDetermined {
            *access = if self.grant_on_request {
                CalendarAccess::Granted
            } else {
                CalendarAccess::Denied
            };
        }
        Ok(*access)
    }

    async fn calendar_by_id(&self, calendar_id: &str) -> Result<Option<CalendarInfo>, CalendarError> {
        self.ensure_access().await?;
        Ok(self
            .calendars
            .read()
            .await
            .iter()
            .find(|c| c.id == calendar_id)
            .cloned())
    }

    async fn calendars(&self) -> Result<Vec<CalendarInfo>, CalendarError> {
        self.ensure_access().await?;
        Ok(self.calendars.read().await.clone())
    }

    async fn create_calendar(&self, title: &str) -> Result<CalendarInfo, CalendarError> {
        self.ensure_access().await?;
        Ok(self.add_calendar(title).await)
    }

    async fn find_by_item_key(
        &self,
        calendar_id: &str,
        item_id: i64,
    ) -> Result<Vec<CalendarEntry>, CalendarError> {
        self.ensure_access().await?;
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.calendar_id == calendar_id && key::carries_item_key(&e.notes, item_id))
            .cloned()
            .collect())
    }

    async fn find_all_keyed(&self, calendar_id: &str) -> Result<Vec<CalendarEntry>, CalendarError> {
        self.ensure_access().await?;
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.calendar_id == calendar_id && key::extract_item_key(&e.notes).is_some())
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        calendar_id: &str,
        draft: CalendarEntryDraft,
    ) -> Result<CalendarEntry, CalendarError> {
        self.ensure_access().await?;
        self.check_failure(&draft.notes)?;

        if !self.calendars.read().await.iter().any(|c| c.id == calendar_id) {
            return Err(CalendarError::NotFound(calendar_id.to_string()));
        }

        let entry = CalendarEntry {
            id: uuid::Uuid::new_v4().to_string(),
            calendar_id: calendar_id.to_string(),
            title: draft.title,
            notes: draft.notes,
            location: draft.location,
            url: draft.url,
            all_day: draft.all_day,
            start_date: draft.start_date,
            end_date: draft.end_date,
            alarm_offset_secs: draft.alarm_offset_secs,
            created_at: Utc::now(),
        };
        self.entries.write().await.push(entry.clone());
        Ok(entry)
    }

    async fn update(&self, entry_id: &str, draft: CalendarEntryDraft) -> Result<(), CalendarError> {
        self.ensure_access().await?;
        self.check_failure(&draft.notes)?;

        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| CalendarError::NotFound(entry_id.to_string()))?;

        entry.title = draft.title;
        entry.notes = draft.notes;
        entry.location = draft.location;
        entry.url = draft.url;
        entry.all_day = draft.all_day;
        entry.start_date = draft.start_date;
        entry.end_date = draft.end_date;
        entry.alarm_offset_secs = draft.alarm_offset_secs;
        Ok(())
    }

    async fn delete(&self, entry_id: &str) -> Result<(), CalendarError> {
        self.ensure_access().await?;

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.id != entry_id);
        if entries.len() == before {
            return Err(CalendarError::NotFound(entry_id.to_string()));
        }
        Ok(())
    }
}
