//! Calendar projection of marked events
//!
//! - key: `ItemID:<id>` correlation key embedded in entry notes
//! - store: calendar service interface plus an in-memory calendar
//! - reconciler: dedup-then-act reconciliation against the marked set,
//!   confined to the app's own calendar

pub mod key;
pub mod reconciler;
pub mod store;

pub use reconciler::{entry_draft, CalendarReconciler, ReconcileStats, APP_CALENDAR_TITLE};
pub use store::{
    CalendarEntry, CalendarEntryDraft, CalendarError, CalendarInfo, CalendarStore, MemoryCalendar,
    DEFAULT_CALENDAR_ID,
};
