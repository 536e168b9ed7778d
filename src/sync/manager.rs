//! Sync Coordinator - Orchestrates preference synchronization
//!
//! Owns the authoritative in-memory marked set and filters and keeps the
//! replicas in step:
//! - Local store (primary + backup slots) and cloud replica, written on every edit
//! - Remote preference service, pushed after a debounce window and pulled
//!   on sign-in and app foreground
//! - Calendar, reconciled whenever the marked set changes
//!
//! Every mutation goes through one async mutex, so triggers coming from the
//! UI, the network and the cloud replica are applied one after another.
//! Network calls are made with the mutex released. Changes to the marked set
//! that also touch the calendar additionally hold the projection lock until
//! the calendar has caught up, so calendar writes land in mutation order.
//! A pulled snapshot is only applied if the session that fetched it is still
//! the current one. Failures are logged and absorbed; only `sign_in` reports
//! an error to the caller.

use super::api::{PreferenceApiError, RemotePreferences};
use super::models::{
    Affiliation, CalendarAccess, ConflictStrategy, FilterPreferences, IdentityProof,
    MarkedItemSet, PreferenceSnapshot, Session, SyncState, SyncStatus, TemperatureUnit,
};
use super::models::{normalize_month, normalize_region};
use super::scheduler::PushScheduler;
use crate::cache::{ChangeReason, CloudKeyValueStore, ExternalChange};
use crate::calendar::CalendarReconciler;
use crate::store::LocalPreferenceStore;
use chrono::Utc;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

/// Cloud replica key of the marked set
pub const CLOUD_MARKED_KEY: &str = "markedShoots";

/// In-memory state guarded by the coordinator mutex
#[derive(Default)]
struct CoordinatorState {
    marked: MarkedItemSet,
    filters: FilterPreferences,
    temperature_unit: TemperatureUnit,
    calendar_sync_enabled: bool,
    session: Option<Session>,
}

/// Which sign-in path ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInPath {
    /// The service had preferences; they replaced local state
    Pulled,
    /// The service had nothing; local state was kept and a push scheduled
    AdoptedLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInOutcome {
    pub user_id: String,
    pub is_new_user: bool,
    pub path: SignInPath,
}

/// Sync coordinator - single owner of preference state
#[derive(Clone)]
pub struct SyncCoordinator {
    local: LocalPreferenceStore,
    cloud: Arc<dyn CloudKeyValueStore>,
    remote: Arc<dyn RemotePreferences>,
    reconciler: CalendarReconciler,
    scheduler: PushScheduler,
    state: Arc<Mutex<CoordinatorState>>,
    /// Held from a marked-set change until its calendar projection is done.
    /// Always taken before `state`.
    projection: Arc<Mutex<()>>,
    status: Arc<watch::Sender<SyncStatus>>,
    listener: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl SyncCoordinator {
    pub fn new(
        local: LocalPreferenceStore,
        cloud: Arc<dyn CloudKeyValueStore>,
        remote: Arc<dyn RemotePreferences>,
        reconciler: CalendarReconciler,
        debounce: Duration,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());

        Self {
            local,
            cloud,
            remote,
            reconciler,
            scheduler: PushScheduler::new(debounce),
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            projection: Arc::new(Mutex::new(())),
            status: Arc::new(status),
            listener: Arc::new(StdMutex::new(None)),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load persisted state and start listening for cloud changes
    pub async fn start(&self) {
        self.load().await;
        self.start_cloud_listener();
    }

    /// Load state from the replicas. No network call is made.
    pub async fn load(&self) {
        let mut state = self.state.lock().await;

        state.marked = self.load_marked().await;
        state.filters = self.local.load_filters();
        state.temperature_unit = self.local.load_temperature_unit();
        state.calendar_sync_enabled = self.local.load_calendar_sync_enabled();
        state.session = self.local.load_session();

        let marked_count = state.marked.len();
        let authenticated = state.session.is_some();
        drop(state);

        let calendar_access = self.reconciler.calendar().authorization().await;
        self.update_status(|s| {
            s.state = SyncState::Loaded;
            s.marked_count = marked_count;
            s.authenticated = authenticated;
            s.calendar_access = calendar_access;
        });
        log::info!(
            "Preferences loaded: {} marked items, authenticated: {}",
            marked_count,
            authenticated
        );

        self.set_state(SyncState::Idle);
    }

    /// Cloud replica, then local primary, backup and legacy slots
    async fn load_marked(&self) -> MarkedItemSet {
        if let Some(bytes) = self.cloud.get(CLOUD_MARKED_KEY).await {
            match serde_json::from_slice::<MarkedItemSet>(&bytes) {
                Ok(marked) => {
                    log::debug!("Loaded {} marked items from cloud replica", marked.len());
                    if let Err(e) = self.local.save(&marked) {
                        log::warn!("Failed to refresh local marked set: {}", e);
                    }
                    self.discard_legacy();
                    return marked;
                }
                Err(e) => log::warn!("Ignoring unreadable cloud marked set: {}", e),
            }
        }

        if let Some(marked) = self.local.load() {
            log::info!("Migrating {} marked items from local store to cloud", marked.len());
            self.write_cloud(&marked).await;
            self.discard_legacy();
            return marked;
        }

        match self.local.take_legacy() {
            Ok(Some(marked)) => {
                log::info!("Migrating {} marked items from legacy slot", marked.len());
                if let Err(e) = self.local.save(&marked) {
                    log::warn!("Failed to save migrated marked set: {}", e);
                }
                self.write_cloud(&marked).await;
                marked
            }
            Ok(None) => MarkedItemSet::new(),
            Err(e) => {
                log::warn!("Failed to read legacy marked set: {}", e);
                MarkedItemSet::new()
            }
        }
    }

    /// Drop the legacy slot once a newer copy has won
    fn discard_legacy(&self) {
        match self.local.take_legacy() {
            Ok(Some(stale)) => log::info!(
                "Discarded legacy marked set ({} items), newer copy exists",
                stale.len()
            ),
            Ok(None) => {}
            Err(e) => log::warn!("Failed to remove legacy marked set: {}", e),
        }
    }

    /// Spawn the task that applies cloud change notifications
    pub fn start_cloud_listener(&self) {
        let mut receiver = self.cloud.subscribe();
        let this = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(change) => this.on_cloud_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Missed {} cloud notifications, reloading", skipped);
                        this.on_cloud_change(ExternalChange {
                            changed_keys: vec![CLOUD_MARKED_KEY.to_string()],
                            reason: ChangeReason::ServerChange,
                        })
                        .await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = listener.replace(handle) {
            previous.abort();
        }
    }

    /// Stop background work: the cloud listener and any pending push
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.scheduler.cancel();
    }

    /// Wait until no push is pending or in flight
    pub async fn flush(&self) {
        self.scheduler.wait_idle().await;
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Associate an identity and run either the pull or the adopt-local path
    pub async fn sign_in(&self, proof: IdentityProof) -> Result<SignInOutcome, SyncError> {
        self.set_state(SyncState::Syncing);

        let association = match self.remote.associate_user(&proof).await {
            Ok(association) => association,
            Err(e) => {
                log::error!("Sign-in failed: {}", e);
                self.update_status(|s| s.last_error = Some(e.to_string()));
                self.finish_sync();
                return Err(e.into());
            }
        };

        let session = Session::from_association(&proof, &association);
        if let Err(e) = self.local.save_session(&session) {
            log::warn!("Failed to persist session: {}", e);
        }
        self.state.lock().await.session = Some(session.clone());
        self.update_status(|s| {
            s.authenticated = true;
            s.last_error = None;
        });

        let path = match association.preferences {
            Some(mut snapshot) => {
                log::info!("Applying stored preferences for user {}", association.user_id);
                snapshot.user_id = association.user_id.clone();
                if self
                    .apply_snapshot_if(snapshot, ConflictStrategy::UseServer, Some(&session))
                    .await
                {
                    self.update_status(|s| s.last_pull_at = Some(Utc::now()));
                }
                SignInPath::Pulled
            }
            None => {
                log::info!(
                    "No stored preferences for user {}, adopting local state",
                    association.user_id
                );
                self.schedule_push();
                SignInPath::AdoptedLocal
            }
        };

        self.finish_sync();

        Ok(SignInOutcome {
            user_id: association.user_id,
            is_new_user: association.is_new_user,
            path,
        })
    }

    /// Clear every replica and in-memory state, cancel pending pushes
    pub async fn sign_out(&self) {
        self.scheduler.cancel();
        let _projection = self.projection.lock().await;

        let calendar_was_enabled = {
            let mut state = self.state.lock().await;
            let enabled = state.calendar_sync_enabled;
            *state = CoordinatorState::default();

            if let Err(e) = self.local.clear() {
                log::error!("Failed to clear local preferences: {}", e);
            }
            self.cloud.remove(CLOUD_MARKED_KEY).await;
            self.cloud.synchronize();
            enabled
        };

        if calendar_was_enabled {
            self.reconciler.remove_all().await;
        }

        self.update_status(|s| {
            s.state = SyncState::SignedOut;
            s.marked_count = 0;
            s.authenticated = false;
            s.last_error = None;
        });
        log::info!("Signed out, all preference replicas cleared");
    }

    pub async fn current_user_id(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.user_id.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    // ========================================================================
    // Marked items
    // ========================================================================

    /// Mark an item. Returns `false` if it was already marked.
    pub async fn mark(&self, item_id: i64) -> bool {
        let _projection = self.projection.lock().await;
        let (marked, calendar_enabled) = {
            let mut state = self.state.lock().await;
            if !state.marked.insert(item_id) {
                return false;
            }
            self.persist_marked(&state.marked).await;
            (state.marked.clone(), state.calendar_sync_enabled)
        };

        log::debug!("Marked item {} ({} marked)", item_id, marked.len());
        self.update_status(|s| s.marked_count = marked.len());
        self.schedule_push();

        if calendar_enabled {
            let single: MarkedItemSet = [item_id].into_iter().collect();
            self.reconciler.sync_marked(&single).await;
        }
        true
    }

    /// Unmark an item. Returns `false` if it was not marked.
    pub async fn unmark(&self, item_id: i64) -> bool {
        let _projection = self.projection.lock().await;
        let (count, calendar_enabled) = {
            let mut state = self.state.lock().await;
            if !state.marked.remove(item_id) {
                return false;
            }
            self.persist_marked(&state.marked).await;

            // Nothing left to show
            if state.marked.is_empty() && state.filters.show_marked_only {
                state.filters.show_marked_only = false;
                if let Err(e) = self.local.save_filters(&state.filters) {
                    log::warn!("Failed to save filters: {}", e);
                }
            }
            (state.marked.len(), state.calendar_sync_enabled)
        };

        log::debug!("Unmarked item {} ({} marked)", item_id, count);
        self.update_status(|s| s.marked_count = count);
        self.schedule_push();

        if calendar_enabled {
            self.reconciler.unmark_item(item_id).await;
        }
        true
    }

    /// Flip the mark of an item, returning whether it is now marked
    pub async fn toggle_marked(&self, item_id: i64) -> bool {
        if self.is_marked(item_id).await {
            self.unmark(item_id).await;
            false
        } else {
            self.mark(item_id).await;
            true
        }
    }

    pub async fn is_marked(&self, item_id: i64) -> bool {
        self.state.lock().await.marked.contains(item_id)
    }

    pub async fn marked_items(&self) -> MarkedItemSet {
        self.state.lock().await.marked.clone()
    }

    // ========================================================================
    // Filters & settings
    // ========================================================================

    pub async fn filters(&self) -> FilterPreferences {
        self.state.lock().await.filters.clone()
    }

    pub async fn set_search_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.update_filters(true, |f| f.search_text = text).await;
    }

    pub async fn set_affiliations(&self, affiliations: impl IntoIterator<Item = Affiliation>) {
        let affiliations = affiliations.into_iter().collect();
        self.update_filters(true, |f| f.affiliations = affiliations).await;
    }

    /// Months outside 1..=12 are dropped
    pub async fn set_months(&self, months: impl IntoIterator<Item = i64>) {
        let months = months.into_iter().filter_map(normalize_month).collect();
        self.update_filters(true, |f| f.months = months).await;
    }

    /// Codes are upper-cased; anything but two ASCII letters is dropped
    pub async fn set_regions<S: AsRef<str>>(&self, regions: impl IntoIterator<Item = S>) {
        let regions = regions
            .into_iter()
            .filter_map(|r| normalize_region(r.as_ref()))
            .collect();
        self.update_filters(true, |f| f.regions = regions).await;
    }

    pub async fn set_future_only(&self, enabled: bool) {
        self.update_filters(true, |f| f.future_only = enabled).await;
    }

    pub async fn set_notable_only(&self, enabled: bool) {
        self.update_filters(true, |f| f.notable_only = enabled).await;
    }

    /// View-only toggle: saved on this device, never pushed
    pub async fn set_show_marked_only(&self, enabled: bool) {
        self.update_filters(false, |f| f.show_marked_only = enabled).await;
    }

    pub async fn reset_filters(&self) {
        self.update_filters(true, |f| *f = FilterPreferences::default()).await;
    }

    async fn update_filters<F>(&self, push: bool, change: F)
    where
        F: FnOnce(&mut FilterPreferences),
    {
        {
            let mut state = self.state.lock().await;
            let before = state.filters.clone();
            change(&mut state.filters);
            if state.filters == before {
                return;
            }
            if let Err(e) = self.local.save_filters(&state.filters) {
                log::warn!("Failed to save filters: {}", e);
            }
        }

        if push {
            self.schedule_push();
        }
    }

    pub async fn temperature_unit(&self) -> TemperatureUnit {
        self.state.lock().await.temperature_unit
    }

    pub async fn set_temperature_unit(&self, unit: TemperatureUnit) {
        {
            let mut state = self.state.lock().await;
            if state.temperature_unit == unit {
                return;
            }
            state.temperature_unit = unit;
            if let Err(e) = self.local.save_temperature_unit(unit) {
                log::warn!("Failed to save temperature unit: {}", e);
            }
        }
        self.schedule_push();
    }

    pub async fn calendar_sync_enabled(&self) -> bool {
        self.state.lock().await.calendar_sync_enabled
    }

    /// Turn calendar projection on or off
    ///
    /// Enabling asks for calendar access; when access is refused the flag
    /// stays off and the returned access is `Denied`.
    pub async fn set_calendar_sync_enabled(&self, enabled: bool) -> CalendarAccess {
        let access = {
            let _projection = self.projection.lock().await;
            self.switch_calendar(enabled).await
        };
        self.schedule_push();
        access
    }

    /// Caller holds the projection lock
    async fn switch_calendar(&self, enabled: bool) -> CalendarAccess {
        let calendar = self.reconciler.calendar().clone();

        if !enabled {
            self.store_calendar_flag(false).await;
            self.reconciler.remove_all().await;
            return calendar.authorization().await;
        }

        let access = match calendar.request_access().await {
            Ok(access) => access,
            Err(e) => {
                log::warn!("Calendar access request failed: {}", e);
                CalendarAccess::Denied
            }
        };
        self.update_status(|s| s.calendar_access = access);

        if access != CalendarAccess::Granted {
            log::warn!("Calendar access not granted, calendar sync stays off");
            self.store_calendar_flag(false).await;
            return access;
        }

        if let Err(e) = self.reconciler.ensure_app_calendar().await {
            log::warn!("Failed to prepare app calendar: {}", e);
        }

        let marked = {
            let mut state = self.state.lock().await;
            state.calendar_sync_enabled = true;
            if let Err(e) = self.local.save_calendar_sync_enabled(true) {
                log::warn!("Failed to save calendar flag: {}", e);
            }
            state.marked.clone()
        };
        self.reconciler.sync_marked(&marked).await;
        access
    }

    async fn store_calendar_flag(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        state.calendar_sync_enabled = enabled;
        if let Err(e) = self.local.save_calendar_sync_enabled(enabled) {
            log::warn!("Failed to save calendar flag: {}", e);
        }
    }

    // ========================================================================
    // Inbound changes
    // ========================================================================

    /// Pull remote preferences after the app returns to the foreground
    pub async fn on_foreground(&self) {
        let Some(session) = self.state.lock().await.session.clone() else {
            log::debug!("Foreground pull skipped, not signed in");
            return;
        };

        self.set_state(SyncState::Syncing);

        match self
            .remote
            .fetch_preferences(&session.user_id, &session.identity_token)
            .await
        {
            Ok(Some(snapshot)) => {
                log::info!(
                    "Pulled preferences ({} marked items)",
                    snapshot.marked_items.len()
                );
                if self
                    .apply_snapshot_if(snapshot, ConflictStrategy::UseServer, Some(&session))
                    .await
                {
                    self.update_status(|s| {
                        s.last_pull_at = Some(Utc::now());
                        s.last_error = None;
                    });
                }
            }
            Ok(None) => log::debug!("No remote preferences yet"),
            Err(e) => {
                log::warn!("Foreground pull failed: {}", e);
                self.update_status(|s| s.last_error = Some(e.to_string()));
            }
        }

        self.finish_sync();
    }

    /// Apply a cloud replica change made by another device
    pub async fn on_cloud_change(&self, change: ExternalChange) {
        if !change.changed_keys.iter().any(|k| k == CLOUD_MARKED_KEY) {
            return;
        }

        if change.reason == ChangeReason::QuotaViolation {
            log::warn!("Cloud replica dropped the marked set, rewriting it");
            let marked = self.state.lock().await.marked.clone();
            self.write_cloud(&marked).await;
            return;
        }

        let _projection = self.projection.lock().await;
        let Some(bytes) = self.cloud.get(CLOUD_MARKED_KEY).await else {
            log::debug!("Cloud marked set removed remotely ({:?}), keeping local state", change.reason);
            return;
        };

        let incoming: MarkedItemSet = match serde_json::from_slice(&bytes) {
            Ok(marked) => marked,
            Err(e) => {
                log::warn!("Ignoring unreadable cloud marked set: {}", e);
                return;
            }
        };

        let (previous, calendar_enabled) = {
            let mut state = self.state.lock().await;
            if state.marked == incoming {
                return;
            }
            let previous = std::mem::replace(&mut state.marked, incoming.clone());
            if let Err(e) = self.local.save(&incoming) {
                log::warn!("Failed to refresh local marked set: {}", e);
            }
            (previous, state.calendar_sync_enabled)
        };

        log::info!(
            "Applied cloud change: {} -> {} marked items",
            previous.len(),
            incoming.len()
        );
        self.update_status(|s| s.marked_count = incoming.len());

        if calendar_enabled {
            self.reconciler.reconcile(&previous, &incoming).await;
        }
    }

    /// Single entry point for applying a remote snapshot
    pub async fn apply_snapshot(&self, snapshot: PreferenceSnapshot, strategy: ConflictStrategy) {
        self.apply_snapshot_if(snapshot, strategy, None).await;
    }

    /// Apply `snapshot` unless the session that fetched it has ended
    ///
    /// With `owner` set, the snapshot is dropped when the current session is
    /// a different one or none at all. Returns whether anything was applied.
    async fn apply_snapshot_if(
        &self,
        snapshot: PreferenceSnapshot,
        strategy: ConflictStrategy,
        owner: Option<&Session>,
    ) -> bool {
        if strategy == ConflictStrategy::UseLocal {
            log::debug!("Keeping local state, snapshot ignored");
            return false;
        }

        let _projection = self.projection.lock().await;
        let (previous, current, calendar_was_enabled) = {
            let mut state = self.state.lock().await;
            if let Some(owner) = owner {
                if !is_same_session(state.session.as_ref(), owner) {
                    log::info!(
                        "Session for user {} ended during pull, snapshot discarded",
                        owner.user_id
                    );
                    return false;
                }
            }
            let previous = state.marked.clone();

            state.marked = match strategy {
                ConflictStrategy::Merge => previous.union(&snapshot.marked_items),
                _ => snapshot.marked_items.clone(),
            };
            state.filters.apply_wire(&snapshot.filter_settings);
            state.temperature_unit = snapshot.temperature_unit;

            self.persist_marked(&state.marked).await;
            if let Err(e) = self.local.save_filters(&state.filters) {
                log::warn!("Failed to save filters: {}", e);
            }
            if let Err(e) = self.local.save_temperature_unit(state.temperature_unit) {
                log::warn!("Failed to save temperature unit: {}", e);
            }

            (previous, state.marked.clone(), state.calendar_sync_enabled)
        };

        log::info!(
            "Applied snapshot ({:?}): {} -> {} marked items",
            strategy,
            previous.len(),
            current.len()
        );
        self.update_status(|s| s.marked_count = current.len());

        match snapshot
            .calendar_sync_enabled
            .filter(|enabled| *enabled != calendar_was_enabled)
        {
            Some(enabled) => {
                self.switch_calendar(enabled).await;
            }
            None if calendar_was_enabled => {
                self.reconciler.reconcile(&previous, &current).await;
            }
            None => {}
        }
        true
    }

    // ========================================================================
    // Outbound push
    // ========================================================================

    /// Snapshot of current state as it would be pushed
    pub async fn snapshot(&self) -> PreferenceSnapshot {
        let state = self.state.lock().await;
        build_snapshot(&state)
    }

    fn schedule_push(&self) {
        let this = self.clone();
        self.scheduler.schedule(move || async move {
            this.push_now().await;
        });
    }

    /// Push current state immediately, if signed in
    async fn push_now(&self) {
        let (session, snapshot) = {
            let state = self.state.lock().await;
            match &state.session {
                Some(session) => (session.clone(), build_snapshot(&state)),
                None => {
                    log::debug!("Push skipped, not signed in");
                    return;
                }
            }
        };

        self.set_state(SyncState::Syncing);

        match self
            .remote
            .push_preferences(&session.user_id, &session.identity_token, &snapshot)
            .await
        {
            Ok(()) => self.update_status(|s| {
                s.last_push_at = Some(Utc::now());
                s.last_error = None;
            }),
            Err(e) => {
                log::warn!("Preference push failed: {}", e);
                self.update_status(|s| s.last_error = Some(e.to_string()));
            }
        }

        self.finish_sync();
    }

    // ========================================================================
    // Replicas
    // ========================================================================

    async fn persist_marked(&self, marked: &MarkedItemSet) {
        if let Err(e) = self.local.save(marked) {
            log::error!("Failed to save marked items locally: {}", e);
        }
        self.write_cloud(marked).await;
    }

    async fn write_cloud(&self, marked: &MarkedItemSet) {
        match serde_json::to_vec(marked) {
            Ok(bytes) => {
                self.cloud.set(CLOUD_MARKED_KEY, bytes).await;
                self.cloud.synchronize();
            }
            Err(e) => log::error!("Failed to encode marked items: {}", e),
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        self.update_status(|s| s.state = state);
    }

    /// Back to idle, unless a sign-out happened meanwhile
    fn finish_sync(&self) {
        self.update_status(|s| {
            if s.state == SyncState::Syncing {
                s.state = SyncState::Idle;
            }
        });
    }

    fn update_status<F: FnOnce(&mut SyncStatus)>(&self, change: F) {
        self.status.send_modify(|status| {
            let before = status.state;
            change(status);
            if before != status.state {
                log::debug!("Sync state {} -> {}", before.as_str(), status.state.as_str());
            }
        });
    }
}

fn is_same_session(current: Option<&Session>, owner: &Session) -> bool {
    current.is_some_and(|s| s.user_id == owner.user_id && s.signed_in_at == owner.signed_in_at)
}

fn build_snapshot(state: &CoordinatorState) -> PreferenceSnapshot {
    PreferenceSnapshot {
        user_id: state
            .session
            .as_ref()
            .map(|s| s.user_id.clone())
            .unwrap_or_default(),
        filter_settings: state.filters.to_wire(),
        marked_items: state.marked.clone(),
        temperature_unit: state.temperature_unit,
        calendar_sync_enabled: Some(state.calendar_sync_enabled),
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Sign-in failed: {0}")]
    SignIn(#[from] PreferenceApiError),
}

impl SyncError {
    /// The identity proof lacked an id or token
    pub fn is_missing_credentials(&self) -> bool {
        matches!(self, SyncError::SignIn(PreferenceApiError::MissingCredentials))
    }
}
