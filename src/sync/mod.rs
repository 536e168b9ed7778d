//! Sync Module - Preference & Marked-Item Synchronization
//!
//! Keeps a user's marked items and filter preferences consistent across:
//! - The local store (primary + backup slots)
//! - The cloud key-value replica shared by the user's devices
//! - The remote preference service (debounced push, pull on sign-in/foreground)
//! - The device calendar (one entry per marked item)
//!
//! Architecture:
//! - Single coordinator: every mutation is serialized behind one async mutex
//! - Last write wins: a pull fully replaces local state
//! - Failures are logged and absorbed; sync never blocks the UI

pub mod api;
pub mod manager;
pub mod models;
pub mod scheduler;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use models::{
    normalize_month, normalize_region, Affiliation, AssociationRequest, AssociationResponse,
    CalendarAccess, ConflictStrategy, FilterPreferences, FilterSettings, IdentityProof,
    MarkedItemSet, PreferenceSnapshot, Session, SyncState, SyncStatus, TemperatureUnit,
};

pub use api::{PreferenceApiClient, PreferenceApiError, RemotePreferences};
pub use manager::{SignInOutcome, SignInPath, SyncCoordinator, SyncError, CLOUD_MARKED_KEY};
pub use scheduler::PushScheduler;
