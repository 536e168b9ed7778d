//! Sync Data Models
//!
//! Defines the state that is synchronized across devices and the remote
//! preference service:
//! - MarkedItemSet: ids of the events a user marked
//! - FilterPreferences: catalog filters (local form, including view-only flags)
//! - PreferenceSnapshot: the unit exchanged with the remote service
//! - Session / IdentityProof: sign-in material
//! - SyncStatus / SyncState: observable coordinator state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ============================================================================
// Marked Items
// ============================================================================

/// Set of marked event ids (membership only, no ordering semantics)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkedItemSet(BTreeSet<i64>);

impl MarkedItemSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.0.contains(&id)
    }

    /// Returns `true` if the id was not already marked
    pub fn insert(&mut self, id: i64) -> bool {
        self.0.insert(id)
    }

    /// Returns `true` if the id was marked
    pub fn remove(&mut self, id: i64) -> bool {
        self.0.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.iter().copied()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.0.iter().copied().collect()
    }

    /// Ids present in `self` but not in `other`
    pub fn difference(&self, other: &MarkedItemSet) -> Vec<i64> {
        self.0.difference(&other.0).copied().collect()
    }

    pub fn union(&self, other: &MarkedItemSet) -> MarkedItemSet {
        MarkedItemSet(self.0.union(&other.0).copied().collect())
    }
}

impl FromIterator<i64> for MarkedItemSet {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        MarkedItemSet(iter.into_iter().collect())
    }
}

// ============================================================================
// Filter Preferences
// ============================================================================

/// Sanctioning body an event is shot under
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Affiliation {
    #[serde(rename = "NSCA")]
    Nsca,
    #[serde(rename = "NSSA")]
    Nssa,
    #[serde(rename = "ATA")]
    Ata,
}

impl Affiliation {
    pub fn code(&self) -> &'static str {
        match self {
            Affiliation::Nsca => "NSCA",
            Affiliation::Nssa => "NSSA",
            Affiliation::Ata => "ATA",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "NSCA" => Some(Affiliation::Nsca),
            "NSSA" => Some(Affiliation::Nssa),
            "ATA" => Some(Affiliation::Ata),
            _ => None,
        }
    }
}

/// Catalog filters as held on the device
///
/// `show_marked_only` is a view toggle. It is persisted locally but never
/// leaves the device (see [`FilterPreferences::to_wire`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterPreferences {
    pub search_text: String,
    pub affiliations: BTreeSet<Affiliation>,
    pub months: BTreeSet<u8>,
    pub regions: BTreeSet<String>,
    pub future_only: bool,
    pub notable_only: bool,
    pub show_marked_only: bool,
}

impl Default for FilterPreferences {
    fn default() -> Self {
        Self {
            search_text: String::new(),
            affiliations: BTreeSet::new(),
            months: BTreeSet::new(),
            regions: BTreeSet::new(),
            future_only: true,
            notable_only: false,
            show_marked_only: false,
        }
    }
}

impl FilterPreferences {
    /// Remote form of these filters, without the view-only flag
    pub fn to_wire(&self) -> FilterSettings {
        FilterSettings {
            search: self.search_text.clone(),
            shoot_types: self.affiliations.iter().map(|a| a.code().to_string()).collect(),
            months: self.months.iter().map(|m| *m as i64).collect(),
            states: self.regions.iter().cloned().collect(),
            notable: self.notable_only,
            future: self.future_only,
        }
    }

    /// Replace every synced field with the remote values
    ///
    /// Unknown affiliation codes, out-of-range months and malformed region
    /// codes are dropped. `show_marked_only` is left untouched.
    pub fn apply_wire(&mut self, wire: &FilterSettings) {
        self.search_text = wire.search.clone();
        self.affiliations = wire
            .shoot_types
            .iter()
            .filter_map(|code| Affiliation::from_code(code))
            .collect();
        self.months = wire.months.iter().filter_map(|m| normalize_month(*m)).collect();
        self.regions = wire
            .states
            .iter()
            .filter_map(|s| normalize_region(s))
            .collect();
        self.notable_only = wire.notable;
        self.future_only = wire.future;
    }
}

/// Month number in 1..=12
pub fn normalize_month(month: i64) -> Option<u8> {
    if (1..=12).contains(&month) {
        Some(month as u8)
    } else {
        None
    }
}

/// Two-letter region code, upper-cased
pub fn normalize_region(region: &str) -> Option<String> {
    let region = region.trim();
    if region.len() == 2 && region.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(region.to_ascii_uppercase())
    } else {
        None
    }
}

/// Filter settings as exchanged with the remote service
///
/// Fields missing from a payload take their defaults. Fields this struct
/// does not know about (including a remote `marked` flag) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterSettings {
    pub search: String,
    pub shoot_types: Vec<String>,
    pub months: Vec<i64>,
    pub states: Vec<String>,
    pub notable: bool,
    pub future: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        FilterPreferences::default().to_wire()
    }
}

// ============================================================================
// Preference Snapshot
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Fahrenheit,
    Celsius,
}

impl TemperatureUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemperatureUnit::Fahrenheit => "fahrenheit",
            TemperatureUnit::Celsius => "celsius",
        }
    }
}

/// Full preference bundle exchanged with the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceSnapshot {
    /// Empty when embedded in an association response
    #[serde(default)]
    pub user_id: String,

    #[serde(default)]
    pub filter_settings: FilterSettings,

    #[serde(default, alias = "markedShoots")]
    pub marked_items: MarkedItemSet,

    #[serde(default)]
    pub temperature_unit: TemperatureUnit,

    /// `None` when the server has no value; the local flag is then kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_sync_enabled: Option<bool>,
}

// ============================================================================
// Identity & Session
// ============================================================================

/// Identity material handed over by the sign-in flow
///
/// The token is wiped from memory when the proof is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IdentityProof {
    pub identity_id: String,
    pub identity_token: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl IdentityProof {
    pub fn new(identity_id: impl Into<String>, identity_token: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            identity_token: identity_token.into(),
            email: None,
            display_name: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Both the identity id and the token are present
    pub fn is_complete(&self) -> bool {
        !self.identity_id.trim().is_empty() && !self.identity_token.trim().is_empty()
    }
}

impl fmt::Debug for IdentityProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityProof")
            .field("identity_id", &self.identity_id)
            .field("identity_token", &"<redacted>")
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Request body of the association endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationRequest<'a> {
    pub identity_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<&'a str>,
    pub identity_proof: &'a str,
}

impl<'a> From<&'a IdentityProof> for AssociationRequest<'a> {
    fn from(proof: &'a IdentityProof) -> Self {
        Self {
            identity_id: &proof.identity_id,
            email: proof.email.as_deref(),
            display_name: proof.display_name.as_deref(),
            identity_proof: &proof.identity_token,
        }
    }
}

/// Response of the association endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationResponse {
    pub user_id: String,
    #[serde(default)]
    pub is_new_user: bool,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub created_at: Option<String>,
    /// Present only when the service already stores preferences for the user
    pub preferences: Option<PreferenceSnapshot>,
}

/// Signed-in session, persisted across restarts
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub identity_id: String,
    pub identity_token: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub signed_in_at: DateTime<Utc>,
}

impl Session {
    pub fn from_association(proof: &IdentityProof, response: &AssociationResponse) -> Self {
        Self {
            user_id: response.user_id.clone(),
            identity_id: proof.identity_id.clone(),
            identity_token: proof.identity_token.clone(),
            email: response.email.clone().or_else(|| proof.email.clone()),
            display_name: response
                .display_name
                .clone()
                .or_else(|| proof.display_name.clone()),
            signed_in_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("identity_id", &self.identity_id)
            .field("email", &self.email)
            .field("signed_in_at", &self.signed_in_at)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Sync Status
// ============================================================================

/// Coordinator lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Uninitialized,
    Loaded,
    Idle,
    Syncing,
    SignedOut,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Uninitialized => "uninitialized",
            SyncState::Loaded => "loaded",
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::SignedOut => "signedout",
        }
    }
}

/// Calendar authorization as last observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarAccess {
    #[default]
    NotDetermined,
    Granted,
    Denied,
}

/// Snapshot of coordinator state for the UI layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub marked_count: usize,
    pub authenticated: bool,
    pub calendar_access: CalendarAccess,
    pub last_push_at: Option<DateTime<Utc>>,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ============================================================================
// Conflict Resolution
// ============================================================================

/// How an incoming snapshot is combined with in-memory state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Keep in-memory state, ignore the snapshot
    UseLocal,

    /// Replace in-memory state with the snapshot
    UseServer,

    /// Union of marked sets, server filters and settings
    Merge,
}

// ============================================================================
// Tests
// ============================================================================
