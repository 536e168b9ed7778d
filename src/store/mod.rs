//! Local preference store
//!
//! Durable replica of the marked set and preferences on this device. Every
//! write lands in both the primary and the backup slot; reads prefer the
//! primary slot and fall back to the backup when the primary is missing or
//! unreadable. Unreadable data is treated as absent, never as an error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::db::{Database, DbError, Slot};
use crate::sync::models::{FilterPreferences, MarkedItemSet, Session, TemperatureUnit};

const MARKED_ITEMS_KEY: &str = "marked_items";
const FILTERS_KEY: &str = "filter_preferences";
const TEMPERATURE_UNIT_KEY: &str = "temperature_unit";
const CALENDAR_SYNC_KEY: &str = "calendar_sync_enabled";
const SESSION_KEY: &str = "session";
const APP_CALENDAR_KEY: &str = "app_calendar_id";

/// Pre-cloud key holding a bare JSON array of marked ids
pub const LEGACY_MARKED_KEY: &str = "markedShoots";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Primary + backup persistence for user preferences
#[derive(Clone)]
pub struct LocalPreferenceStore {
    db: Database,
}

impl LocalPreferenceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // =========================================================================
    // MARKED ITEMS
    // =========================================================================

    pub fn save(&self, marked: &MarkedItemSet) -> StoreResult<()> {
        self.write_both(MARKED_ITEMS_KEY, marked)
    }

    /// `None` means "no data yet"
    pub fn load(&self) -> Option<MarkedItemSet> {
        self.read_with_fallback(MARKED_ITEMS_KEY)
    }

    /// Remove every stored preference from both slots
    ///
    /// The device id and the app calendar id survive; they belong to the
    /// installation, not the user.
    pub fn clear(&self) -> StoreResult<()> {
        for key in [
            MARKED_ITEMS_KEY,
            FILTERS_KEY,
            TEMPERATURE_UNIT_KEY,
            CALENDAR_SYNC_KEY,
            SESSION_KEY,
            LEGACY_MARKED_KEY,
        ] {
            self.db.delete_setting(Slot::Primary, key)?;
            self.db.delete_setting(Slot::Backup, key)?;
        }
        Ok(())
    }

    /// Return and delete the legacy marked-set copy, if any
    pub fn take_legacy(&self) -> StoreResult<Option<MarkedItemSet>> {
        let legacy = match self.db.get_setting::<Vec<i64>>(Slot::Primary, LEGACY_MARKED_KEY) {
            Ok(value) => value.map(|ids| ids.into_iter().collect()),
            Err(DbError::Serialization(e)) => {
                log::warn!("Discarding unreadable legacy marked set: {}", e);
                None
            }
            Err(e) => return Err(e.into()),
        };

        self.db.delete_setting(Slot::Primary, LEGACY_MARKED_KEY)?;
        Ok(legacy)
    }

    // =========================================================================
    // PREFERENCES
    // =========================================================================

    pub fn save_filters(&self, filters: &FilterPreferences) -> StoreResult<()> {
        self.write_both(FILTERS_KEY, filters)
    }

    /// Stored filters, or defaults when none are readable
    pub fn load_filters(&self) -> FilterPreferences {
        self.read_with_fallback(FILTERS_KEY).unwrap_or_default()
    }

    pub fn save_temperature_unit(&self, unit: TemperatureUnit) -> StoreResult<()> {
        self.write_both(TEMPERATURE_UNIT_KEY, &unit)
    }

    pub fn load_temperature_unit(&self) -> TemperatureUnit {
        self.read_with_fallback(TEMPERATURE_UNIT_KEY)
            .unwrap_or_default()
    }

    pub fn save_calendar_sync_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.write_both(CALENDAR_SYNC_KEY, &enabled)
    }

    pub fn load_calendar_sync_enabled(&self) -> bool {
        self.read_with_fallback(CALENDAR_SYNC_KEY).unwrap_or(false)
    }

    /// Id of the calendar holding the app's entries
    pub fn save_app_calendar_id(&self, calendar_id: &str) -> StoreResult<()> {
        self.write_both(APP_CALENDAR_KEY, &calendar_id)
    }

    pub fn load_app_calendar_id(&self) -> Option<String> {
        self.read_with_fallback(APP_CALENDAR_KEY)
    }

    // =========================================================================
    // SESSION
    // =========================================================================

    pub fn save_session(&self, session: &Session) -> StoreResult<()> {
        self.write_both(SESSION_KEY, session)
    }

    pub fn load_session(&self) -> Option<Session> {
        self.read_with_fallback(SESSION_KEY)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn write_both<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        self.db.set_setting(Slot::Primary, key, value)?;
        self.db.set_setting(Slot::Backup, key, value)?;
        Ok(())
    }

    fn read_with_fallback<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        for slot in [Slot::Primary, Slot::Backup] {
            match self.db.get_setting::<T>(slot, key) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => log::warn!("Unreadable {:?} value for '{}': {}", slot, key, e),
            }
        }
        None
    }
}
