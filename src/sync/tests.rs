//! Integration Tests for Sync Module
//!
//! Covers the coordinator end to end:
//! - Load precedence and migration between replicas
//! - Sign-in pull / adopt-local paths
//! - Debounced pushes and full-replace pulls
//! - Cloud change propagation between devices
//! - Calendar projection and sign-out cleanup
//! - HTTP contract with the real client (mockito)

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::cache::{CloudHub, CloudKeyValueStore};
    use crate::calendar::{
        CalendarEntry, CalendarEntryDraft, CalendarError, CalendarInfo, CalendarReconciler,
        CalendarStore, MemoryCalendar, APP_CALENDAR_TITLE, DEFAULT_CALENDAR_ID,
    };
    use crate::catalog::{sample_event, InMemoryCatalog};
    use crate::db::{Database, Slot};
    use crate::store::{LocalPreferenceStore, LEGACY_MARKED_KEY};
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use mockito::{Matcher, Server};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    // ========================================================================
    // Fakes
    // ========================================================================

    /// In-process preference service
    #[derive(Default)]
    struct FakeRemote {
        users: StdMutex<HashMap<String, String>>,
        stored: StdMutex<HashMap<String, PreferenceSnapshot>>,
        pushes: StdMutex<Vec<PreferenceSnapshot>>,
        offline: AtomicBool,
        calls: AtomicUsize,
        fetch_delay_ms: AtomicU64,
    }

    impl FakeRemote {
        fn store(&self, user_id: &str, ids: &[i64]) {
            self.store_snapshot(PreferenceSnapshot {
                user_id: user_id.to_string(),
                filter_settings: FilterSettings::default(),
                marked_items: ids.iter().copied().collect(),
                temperature_unit: TemperatureUnit::Fahrenheit,
                calendar_sync_enabled: None,
            });
        }

        fn store_snapshot(&self, snapshot: PreferenceSnapshot) {
            self.stored
                .lock()
                .unwrap()
                .insert(snapshot.user_id.clone(), snapshot);
        }

        fn set_fetch_delay(&self, delay: Duration) {
            self.fetch_delay_ms
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }

        fn stored(&self, user_id: &str) -> Option<PreferenceSnapshot> {
            self.stored.lock().unwrap().get(user_id).cloned()
        }

        fn pushes(&self) -> Vec<PreferenceSnapshot> {
            self.pushes.lock().unwrap().clone()
        }

        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check_online(&self) -> Result<(), PreferenceApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                Err(PreferenceApiError::ServerError {
                    status: 503,
                    message: "offline".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RemotePreferences for FakeRemote {
        async fn associate_user(
            &self,
            proof: &IdentityProof,
        ) -> Result<AssociationResponse, PreferenceApiError> {
            if !proof.is_complete() {
                return Err(PreferenceApiError::MissingCredentials);
            }
            self.check_online()?;

            let (user_id, is_new_user) = {
                let mut users = self.users.lock().unwrap();
                let is_new = !users.contains_key(&proof.identity_id);
                let user_id = users
                    .entry(proof.identity_id.clone())
                    .or_insert_with(|| format!("user-{}", proof.identity_id))
                    .clone();
                (user_id, is_new)
            };

            Ok(AssociationResponse {
                preferences: self.stored(&user_id),
                user_id,
                is_new_user,
                email: None,
                display_name: None,
                created_at: None,
            })
        }

        async fn fetch_preferences(
            &self,
            user_id: &str,
            _token: &str,
        ) -> Result<Option<PreferenceSnapshot>, PreferenceApiError> {
            self.check_online()?;
            let snapshot = self.stored(user_id);
            let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(snapshot)
        }

        async fn push_preferences(
            &self,
            user_id: &str,
            _token: &str,
            snapshot: &PreferenceSnapshot,
        ) -> Result<(), PreferenceApiError> {
            self.check_online()?;
            self.stored
                .lock()
                .unwrap()
                .insert(user_id.to_string(), snapshot.clone());
            self.pushes.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    /// Calendar whose entry creation takes a while
    struct SlowCalendar {
        inner: MemoryCalendar,
        create_delay: Duration,
    }

    #[async_trait]
    impl CalendarStore for SlowCalendar {
        async fn authorization(&self) -> CalendarAccess {
            self.inner.authorization().await
        }

        async fn request_access(&self) -> Result<CalendarAccess, CalendarError> {
            self.inner.request_access().await
        }

        async fn calendar_by_id(&self, calendar_id: &str) -> Result<Option<CalendarInfo>, CalendarError> {
            self.inner.calendar_by_id(calendar_id).await
        }

        async fn calendars(&self) -> Result<Vec<CalendarInfo>, CalendarError> {
            self.inner.calendars().await
        }

        async fn create_calendar(&self, title: &str) -> Result<CalendarInfo, CalendarError> {
            self.inner.create_calendar(title).await
        }

        async fn find_by_item_key(
            &self,
            calendar_id: &str,
            item_id: i64,
        ) -> Result<Vec<CalendarEntry>, CalendarError> {
            self.inner.find_by_item_key(calendar_id, item_id).await
        }

        async fn find_all_keyed(&self, calendar_id: &str) -> Result<Vec<CalendarEntry>, CalendarError> {
            self.inner.find_all_keyed(calendar_id).await
        }

        async fn create(
            &self,
            calendar_id: &str,
            draft: CalendarEntryDraft,
        ) -> Result<CalendarEntry, CalendarError> {
            tokio::time::sleep(self.create_delay).await;
            self.inner.create(calendar_id, draft).await
        }

        async fn update(&self, entry_id: &str, draft: CalendarEntryDraft) -> Result<(), CalendarError> {
            self.inner.update(entry_id, draft).await
        }

        async fn delete(&self, entry_id: &str) -> Result<(), CalendarError> {
            self.inner.delete(entry_id).await
        }
    }

    struct Harness {
        db: Database,
        local: LocalPreferenceStore,
        cloud: Arc<dyn CloudKeyValueStore>,
        calendar: MemoryCalendar,
        remote: Arc<FakeRemote>,
        coordinator: SyncCoordinator,
    }

    fn harness_on(
        hub: &CloudHub,
        device: &str,
        calendar: MemoryCalendar,
        remote: Arc<FakeRemote>,
    ) -> Harness {
        let db = Database::in_memory().unwrap();
        harness_with_db(db, hub, device, calendar, remote)
    }

    fn harness_with_db(
        db: Database,
        hub: &CloudHub,
        device: &str,
        calendar: MemoryCalendar,
        remote: Arc<FakeRemote>,
    ) -> Harness {
        let store: Arc<dyn CalendarStore> = Arc::new(calendar.clone());
        build_harness(db, hub, device, calendar, store, remote)
    }

    fn build_harness(
        db: Database,
        hub: &CloudHub,
        device: &str,
        calendar: MemoryCalendar,
        store: Arc<dyn CalendarStore>,
        remote: Arc<FakeRemote>,
    ) -> Harness {
        let local = LocalPreferenceStore::new(db.clone());
        let cloud: Arc<dyn CloudKeyValueStore> = Arc::new(hub.device(device));
        let catalog = InMemoryCatalog::with_events((1..=60).map(sample_event));
        let reconciler = CalendarReconciler::new(store, Arc::new(catalog), local.clone());

        let coordinator = SyncCoordinator::new(
            local.clone(),
            cloud.clone(),
            remote.clone(),
            reconciler,
            Duration::from_secs(1),
        );

        Harness {
            db,
            local,
            cloud,
            calendar,
            remote,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_on(
            &CloudHub::new(),
            "phone",
            MemoryCalendar::new(),
            Arc::new(FakeRemote::default()),
        )
    }

    fn proof() -> IdentityProof {
        IdentityProof::new("apple-1", "token-1").with_email("shooter@example.com")
    }

    const USER: &str = "user-apple-1";

    async fn cloud_marked(cloud: &Arc<dyn CloudKeyValueStore>) -> Option<Vec<i64>> {
        cloud
            .get(CLOUD_MARKED_KEY)
            .await
            .and_then(|bytes| serde_json::from_slice::<Vec<i64>>(&bytes).ok())
    }

    // ========================================================================
    // Load precedence
    // ========================================================================

    #[tokio::test]
    async fn test_first_run_starts_empty() {
        let h = harness();
        h.coordinator.load().await;

        assert!(h.coordinator.marked_items().await.is_empty());
        assert_eq!(h.coordinator.status().state, SyncState::Idle);
        assert!(!h.coordinator.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_cloud_replica_takes_precedence() {
        let h = harness();
        h.local.save(&[1].into_iter().collect()).unwrap();
        h.cloud.set(CLOUD_MARKED_KEY, b"[9]".to_vec()).await;

        h.coordinator.load().await;

        assert_eq!(h.coordinator.marked_items().await.ids(), vec![9]);
        assert_eq!(h.local.load().map(|m| m.ids()), Some(vec![9]));
    }

    #[tokio::test]
    async fn test_local_copy_migrates_into_cloud() {
        let h = harness();
        h.local.save(&[3].into_iter().collect()).unwrap();

        h.coordinator.load().await;

        assert_eq!(h.coordinator.marked_items().await.ids(), vec![3]);
        assert_eq!(cloud_marked(&h.cloud).await, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_backup_slot_used_when_primary_corrupted() {
        let h = harness();
        h.local.save(&[5, 6].into_iter().collect()).unwrap();
        h.db.set_raw_setting(Slot::Primary, "marked_items", "corrupt")
            .unwrap();

        h.coordinator.load().await;
        assert_eq!(h.coordinator.marked_items().await.ids(), vec![5, 6]);
    }

    #[tokio::test]
    async fn test_legacy_slot_migration() {
        let h = harness();
        h.db.set_setting(Slot::Primary, LEGACY_MARKED_KEY, &vec![11, 12])
            .unwrap();

        h.coordinator.load().await;

        assert_eq!(h.coordinator.marked_items().await.ids(), vec![11, 12]);
        assert_eq!(cloud_marked(&h.cloud).await, Some(vec![11, 12]));
        assert_eq!(h.local.load().map(|m| m.ids()), Some(vec![11, 12]));
        let legacy: Option<Vec<i64>> = h.db.get_setting(Slot::Primary, LEGACY_MARKED_KEY).unwrap();
        assert!(legacy.is_none());
    }

    #[tokio::test]
    async fn test_legacy_slot_dropped_when_local_copy_wins() {
        let h = harness();
        h.local.save(&[3].into_iter().collect()).unwrap();
        h.db.set_setting(Slot::Primary, LEGACY_MARKED_KEY, &vec![11, 12])
            .unwrap();

        h.coordinator.load().await;

        assert_eq!(h.coordinator.marked_items().await.ids(), vec![3]);
        let legacy: Option<Vec<i64>> = h.db.get_setting(Slot::Primary, LEGACY_MARKED_KEY).unwrap();
        assert!(legacy.is_none());
    }

    #[tokio::test]
    async fn test_legacy_slot_dropped_when_cloud_copy_wins() {
        let h = harness();
        h.cloud.set(CLOUD_MARKED_KEY, b"[9]".to_vec()).await;
        h.db.set_setting(Slot::Primary, LEGACY_MARKED_KEY, &vec![11, 12])
            .unwrap();

        h.coordinator.load().await;

        assert_eq!(h.coordinator.marked_items().await.ids(), vec![9]);
        let legacy: Option<Vec<i64>> = h.db.get_setting(Slot::Primary, LEGACY_MARKED_KEY).unwrap();
        assert!(legacy.is_none());
    }

    // ========================================================================
    // Marking
    // ========================================================================

    #[tokio::test]
    async fn test_mark_unmark_idempotent() {
        let h = harness();
        h.coordinator.load().await;

        assert!(h.coordinator.mark(7).await);
        assert!(!h.coordinator.mark(7).await);
        assert_eq!(h.coordinator.marked_items().await.ids(), vec![7]);

        assert!(h.coordinator.unmark(7).await);
        assert!(!h.coordinator.unmark(7).await);
        assert!(h.coordinator.marked_items().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_mark_writes_replicas_without_network() {
        let h = harness();
        h.coordinator.load().await;

        h.coordinator.mark(42).await;
        h.coordinator.flush().await;

        assert_eq!(h.local.load().map(|m| m.ids()), Some(vec![42]));
        let backup: Option<Vec<i64>> = h.db.get_setting(Slot::Backup, "marked_items").unwrap();
        assert_eq!(backup, Some(vec![42]));
        assert_eq!(cloud_marked(&h.cloud).await, Some(vec![42]));
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unmarking_last_item_clears_show_marked_only() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.mark(1).await;
        h.coordinator.set_show_marked_only(true).await;

        h.coordinator.unmark(1).await;

        assert!(!h.coordinator.filters().await.show_marked_only);
        assert!(!h.local.load_filters().show_marked_only);
    }

    #[tokio::test]
    async fn test_toggle_marked() {
        let h = harness();
        h.coordinator.load().await;

        assert!(h.coordinator.toggle_marked(3).await);
        assert!(h.coordinator.is_marked(3).await);
        assert!(!h.coordinator.toggle_marked(3).await);
        assert!(!h.coordinator.is_marked(3).await);
    }

    // ========================================================================
    // Sign-in
    // ========================================================================

    #[tokio::test]
    async fn test_sign_in_missing_credentials() {
        let h = harness();
        h.coordinator.load().await;

        let err = h
            .coordinator
            .sign_in(IdentityProof::new("apple-1", ""))
            .await
            .unwrap_err();

        assert!(err.is_missing_credentials());
        assert!(!h.coordinator.is_authenticated().await);
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_association_is_idempotent() {
        let h = harness();
        h.coordinator.load().await;

        let first = h.coordinator.sign_in(proof()).await.unwrap();
        let second = h.coordinator.sign_in(proof()).await.unwrap();

        assert_eq!(first.user_id, second.user_id);
        assert!(first.is_new_user);
        assert!(!second.is_new_user);
        h.coordinator.flush().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_pull_replaces_local_state() {
        let h = harness();
        h.remote.store(USER, &[4]);
        h.coordinator.load().await;
        for id in [1, 2, 3] {
            h.coordinator.mark(id).await;
        }

        let outcome = h.coordinator.sign_in(proof()).await.unwrap();

        assert_eq!(outcome.path, SignInPath::Pulled);
        assert_eq!(h.coordinator.marked_items().await.ids(), vec![4]);
        assert_eq!(h.local.load().map(|m| m.ids()), Some(vec![4]));
        assert_eq!(cloud_marked(&h.cloud).await, Some(vec![4]));
        assert_eq!(h.coordinator.current_user_id().await.as_deref(), Some(USER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_adopts_local_state_and_pushes() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.mark(8).await;
        h.coordinator.mark(9).await;

        let outcome = h.coordinator.sign_in(proof()).await.unwrap();
        assert_eq!(outcome.path, SignInPath::AdoptedLocal);

        h.coordinator.flush().await;
        let pushes = h.remote.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].marked_items.ids(), vec![8, 9]);
        assert_eq!(pushes[0].user_id, USER);
        assert!(h.coordinator.status().last_push_at.is_some());
    }

    #[tokio::test]
    async fn test_session_survives_restart() {
        let hub = CloudHub::new();
        let remote = Arc::new(FakeRemote::default());
        let db = Database::in_memory().unwrap();

        let first = harness_with_db(db.clone(), &hub, "phone", MemoryCalendar::new(), remote.clone());
        first.coordinator.load().await;
        first.coordinator.sign_in(proof()).await.unwrap();
        first.coordinator.shutdown();

        let second = harness_with_db(db, &hub, "phone", MemoryCalendar::new(), remote);
        second.coordinator.load().await;
        assert!(second.coordinator.is_authenticated().await);
        assert_eq!(second.coordinator.current_user_id().await.as_deref(), Some(USER));
        assert!(second.coordinator.status().authenticated);
    }

    // ========================================================================
    // Debounced push
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_edits_produces_one_push() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();

        for id in 1..=5 {
            h.coordinator.mark(id).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        h.coordinator.set_regions(["tx", "fl"]).await;
        h.coordinator.set_months([3, 4, 13]).await;

        h.coordinator.flush().await;

        let pushes = h.remote.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].marked_items.ids(), vec![1, 2, 3, 4, 5]);
        assert_eq!(
            pushes[0].filter_settings.states,
            vec!["FL".to_string(), "TX".to_string()]
        );
        assert_eq!(pushes[0].filter_settings.months, vec![3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_push_when_signed_out() {
        let h = harness();
        h.coordinator.load().await;

        h.coordinator.mark(1).await;
        h.coordinator.set_search_text("sporting").await;
        h.coordinator.flush().await;

        assert!(h.remote.pushes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_marked_set_is_pushed() {
        let h = harness();
        h.remote.store(USER, &[1, 2]);
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();

        h.coordinator.unmark(1).await;
        h.coordinator.unmark(2).await;
        h.coordinator.flush().await;

        let pushes = h.remote.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].marked_items.len(), 0);
        assert_eq!(h.remote.stored(USER).map(|s| s.marked_items.len()), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_show_marked_only_is_never_pushed() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();
        h.coordinator.flush().await;
        let baseline = h.remote.pushes().len();

        h.coordinator.set_show_marked_only(true).await;
        h.coordinator.flush().await;
        assert_eq!(h.remote.pushes().len(), baseline);

        h.coordinator.set_notable_only(true).await;
        h.coordinator.flush().await;
        let pushes = h.remote.pushes();
        assert_eq!(pushes.len(), baseline + 1);

        let json = serde_json::to_value(pushes.last().unwrap()).unwrap();
        let filters = json["filterSettings"].as_object().unwrap();
        assert_eq!(filters["notable"], true);
        assert!(!filters.contains_key("marked"));
        assert!(h.coordinator.filters().await.show_marked_only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_push_is_absorbed() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();
        h.coordinator.flush().await;

        h.remote.set_offline(true);
        h.coordinator.mark(5).await;
        h.coordinator.flush().await;

        let status = h.coordinator.status();
        assert_eq!(status.state, SyncState::Idle);
        assert!(status.last_error.is_some());
        assert!(h.coordinator.is_marked(5).await);
    }

    // ========================================================================
    // Pull
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_foreground_pull_is_full_replace() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();
        h.coordinator.flush().await;

        for id in [1, 2, 3] {
            h.coordinator.mark(id).await;
        }
        h.coordinator.flush().await;

        h.remote.store(USER, &[4]);
        h.coordinator.on_foreground().await;

        assert_eq!(h.coordinator.marked_items().await.ids(), vec![4]);
        assert!(h.coordinator.status().last_pull_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_mark_lost_on_foreground_pull() {
        let h = harness();
        h.remote.store(USER, &[7]);
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();

        h.remote.set_offline(true);
        h.coordinator.mark(42).await;
        h.coordinator.flush().await;
        assert_eq!(h.local.load().map(|m| m.ids()), Some(vec![7, 42]));

        // Another device overwrote the server copy meanwhile
        h.remote.set_offline(false);
        h.remote.store(USER, &[7, 8]);
        h.coordinator.on_foreground().await;

        assert_eq!(h.coordinator.marked_items().await.ids(), vec![7, 8]);
        assert_eq!(h.local.load().map(|m| m.ids()), Some(vec![7, 8]));
    }

    #[tokio::test]
    async fn test_foreground_without_session_makes_no_call() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.on_foreground().await;
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_failure_is_absorbed() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();
        h.coordinator.mark(1).await;
        h.coordinator.flush().await;

        h.remote.set_offline(true);
        h.coordinator.on_foreground().await;

        assert_eq!(h.coordinator.marked_items().await.ids(), vec![1]);
        assert_eq!(h.coordinator.status().state, SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_during_pull_discards_snapshot() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();
        h.coordinator.flush().await;

        h.remote.store(USER, &[1, 2, 3]);
        h.remote.set_fetch_delay(Duration::from_millis(50));

        let coordinator = h.coordinator.clone();
        let pull = tokio::spawn(async move { coordinator.on_foreground().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.coordinator.sign_out().await;
        pull.await.unwrap();

        assert!(h.coordinator.marked_items().await.is_empty());
        assert!(!h.coordinator.is_authenticated().await);
        assert!(h.local.load().is_none());
        assert!(cloud_marked(&h.cloud).await.is_none());
        assert_eq!(h.coordinator.status().state, SyncState::SignedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulled_calendar_flag_toggles_projection() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();
        h.coordinator.flush().await;

        let mut snapshot = PreferenceSnapshot {
            user_id: USER.to_string(),
            filter_settings: FilterSettings::default(),
            marked_items: [1, 2].into_iter().collect(),
            temperature_unit: TemperatureUnit::Fahrenheit,
            calendar_sync_enabled: Some(true),
        };
        h.remote.store_snapshot(snapshot.clone());
        h.coordinator.on_foreground().await;

        assert!(h.coordinator.calendar_sync_enabled().await);
        assert!(h.local.load_calendar_sync_enabled());
        assert_eq!(h.calendar.entries_for(1).await.len(), 1);
        assert_eq!(h.calendar.entries_for(2).await.len(), 1);

        snapshot.calendar_sync_enabled = Some(false);
        h.remote.store_snapshot(snapshot);
        h.coordinator.on_foreground().await;

        assert!(!h.coordinator.calendar_sync_enabled().await);
        assert!(!h.local.load_calendar_sync_enabled());
        assert!(h.calendar.entries_for(1).await.is_empty());
        assert!(h.calendar.entries_for(2).await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_snapshot_strategies() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.mark(1).await;
        h.coordinator.set_show_marked_only(true).await;

        let mut incoming = h.coordinator.snapshot().await;
        incoming.marked_items = [2].into_iter().collect();
        incoming.temperature_unit = TemperatureUnit::Celsius;
        incoming.filter_settings.search = "fitasc".to_string();

        h.coordinator
            .apply_snapshot(incoming.clone(), ConflictStrategy::UseLocal)
            .await;
        assert_eq!(h.coordinator.marked_items().await.ids(), vec![1]);

        h.coordinator
            .apply_snapshot(incoming.clone(), ConflictStrategy::Merge)
            .await;
        assert_eq!(h.coordinator.marked_items().await.ids(), vec![1, 2]);

        h.coordinator
            .apply_snapshot(incoming, ConflictStrategy::UseServer)
            .await;
        assert_eq!(h.coordinator.marked_items().await.ids(), vec![2]);
        assert_eq!(h.coordinator.temperature_unit().await, TemperatureUnit::Celsius);

        let filters = h.coordinator.filters().await;
        assert_eq!(filters.search_text, "fitasc");
        assert!(filters.show_marked_only);
    }

    // ========================================================================
    // Cloud replica
    // ========================================================================

    #[tokio::test]
    async fn test_cloud_change_reaches_other_device() {
        let hub = CloudHub::new();
        let remote = Arc::new(FakeRemote::default());
        let phone = harness_on(&hub, "phone", MemoryCalendar::new(), remote.clone());
        let tablet = harness_on(&hub, "tablet", MemoryCalendar::new(), remote);

        phone.coordinator.start().await;
        tablet.coordinator.start().await;

        phone.coordinator.mark(5).await;

        let mut applied = false;
        for _ in 0..100 {
            if tablet.coordinator.marked_items().await.ids() == vec![5] {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(applied, "tablet never saw the phone's change");
        assert_eq!(tablet.local.load().map(|m| m.ids()), Some(vec![5]));
        assert_eq!(phone.coordinator.marked_items().await.ids(), vec![5]);

        phone.coordinator.shutdown();
        tablet.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_cloud_removal_keeps_local_state() {
        let hub = CloudHub::new();
        let remote = Arc::new(FakeRemote::default());
        let phone = harness_on(&hub, "phone", MemoryCalendar::new(), remote.clone());
        let tablet = harness_on(&hub, "tablet", MemoryCalendar::new(), remote);
        phone.coordinator.load().await;
        tablet.coordinator.load().await;

        phone.coordinator.mark(3).await;
        tablet
            .coordinator
            .on_cloud_change(crate::cache::ExternalChange {
                changed_keys: vec![CLOUD_MARKED_KEY.to_string()],
                reason: crate::cache::ChangeReason::ServerChange,
            })
            .await;
        assert_eq!(tablet.coordinator.marked_items().await.ids(), vec![3]);

        phone.cloud.remove(CLOUD_MARKED_KEY).await;
        tablet
            .coordinator
            .on_cloud_change(crate::cache::ExternalChange {
                changed_keys: vec![CLOUD_MARKED_KEY.to_string()],
                reason: crate::cache::ChangeReason::Removed,
            })
            .await;
        assert_eq!(tablet.coordinator.marked_items().await.ids(), vec![3]);
    }

    #[tokio::test]
    async fn test_quota_drop_rewrites_cloud_copy() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.mark(3).await;

        h.cloud.remove(CLOUD_MARKED_KEY).await;
        assert!(cloud_marked(&h.cloud).await.is_none());

        h.coordinator
            .on_cloud_change(crate::cache::ExternalChange {
                changed_keys: vec![CLOUD_MARKED_KEY.to_string()],
                reason: crate::cache::ChangeReason::QuotaViolation,
            })
            .await;

        assert_eq!(cloud_marked(&h.cloud).await, Some(vec![3]));
        assert_eq!(h.coordinator.marked_items().await.ids(), vec![3]);
        h.coordinator.shutdown();
    }

    // ========================================================================
    // Calendar
    // ========================================================================

    fn stale_entry(id: &str, calendar_id: &str, item_id: i64, age_minutes: i64) -> CalendarEntry {
        let day = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        CalendarEntry {
            id: id.to_string(),
            calendar_id: calendar_id.to_string(),
            title: "stale".to_string(),
            notes: crate::calendar::key::embed_item_key("", item_id),
            location: None,
            url: None,
            all_day: true,
            start_date: day,
            end_date: day,
            alarm_offset_secs: None,
            created_at: Utc::now() - chrono::Duration::minutes(age_minutes),
        }
    }

    #[tokio::test]
    async fn test_calendar_denied_keeps_flag_off() {
        let h = harness_on(
            &CloudHub::new(),
            "phone",
            MemoryCalendar::denying(),
            Arc::new(FakeRemote::default()),
        );
        h.coordinator.load().await;

        let access = h.coordinator.set_calendar_sync_enabled(true).await;

        assert_eq!(access, CalendarAccess::Denied);
        assert!(!h.coordinator.calendar_sync_enabled().await);
        assert_eq!(h.coordinator.status().calendar_access, CalendarAccess::Denied);
        h.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_enabling_calendar_dedups_and_creates() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.mark(7).await;
        h.coordinator.mark(8).await;

        let app = h.calendar.add_calendar(APP_CALENDAR_TITLE).await.id;
        h.calendar.insert_raw(stale_entry("old", &app, 7, 30)).await;
        h.calendar.insert_raw(stale_entry("new", &app, 7, 5)).await;
        h.calendar.insert_raw(stale_entry("older", &app, 7, 60)).await;

        let access = h.coordinator.set_calendar_sync_enabled(true).await;
        assert_eq!(access, CalendarAccess::Granted);

        let for_seven = h.calendar.entries_for(7).await;
        assert_eq!(for_seven.len(), 1);
        assert_eq!(for_seven[0].id, "new");
        assert_eq!(h.calendar.entries_for(8).await.len(), 1);
        assert!(h.local.load_calendar_sync_enabled());
        h.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_mark_and_unmark_follow_calendar() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.set_calendar_sync_enabled(true).await;

        h.coordinator.mark(9).await;
        assert_eq!(h.calendar.entries_for(9).await.len(), 1);

        // Duplicate left behind by an earlier race
        let app = h.calendar.calendar_titled(APP_CALENDAR_TITLE).await.unwrap().id;
        h.calendar.insert_raw(stale_entry("dup", &app, 9, 1)).await;
        h.coordinator.unmark(9).await;
        assert!(h.calendar.entries_for(9).await.is_empty());
        h.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_disabling_calendar_removes_keyed_entries_only() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.set_calendar_sync_enabled(true).await;
        h.coordinator.mark(1).await;
        h.coordinator.mark(2).await;

        let mut personal = stale_entry("dentist", DEFAULT_CALENDAR_ID, 0, 1);
        personal.notes = "Dentist".to_string();
        h.calendar.insert_raw(personal).await;

        h.coordinator.set_calendar_sync_enabled(false).await;

        let left = h.calendar.entries().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "dentist");
        h.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_enabling_calendar_creates_app_calendar() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.mark(4).await;
        assert!(h.calendar.calendar_titled(APP_CALENDAR_TITLE).await.is_none());

        h.coordinator.set_calendar_sync_enabled(true).await;

        let app = h.calendar.calendar_titled(APP_CALENDAR_TITLE).await.unwrap();
        assert_eq!(h.local.load_app_calendar_id(), Some(app.id.clone()));
        let entries = h.calendar.entries_for(4).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].calendar_id, app.id);

        // Toggling again reuses the same calendar
        h.coordinator.set_calendar_sync_enabled(false).await;
        h.coordinator.set_calendar_sync_enabled(true).await;
        let titled: Vec<_> = h
            .calendar
            .calendars()
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.title == APP_CALENDAR_TITLE)
            .collect();
        assert_eq!(titled.len(), 1);
        h.coordinator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_mark_then_unmark_leaves_no_entry() {
        let calendar = MemoryCalendar::new();
        let slow: Arc<dyn CalendarStore> = Arc::new(SlowCalendar {
            inner: calendar.clone(),
            create_delay: Duration::from_millis(20),
        });
        let h = build_harness(
            Database::in_memory().unwrap(),
            &CloudHub::new(),
            "phone",
            calendar,
            slow,
            Arc::new(FakeRemote::default()),
        );
        h.coordinator.load().await;
        h.coordinator.set_calendar_sync_enabled(true).await;

        let marker = h.coordinator.clone();
        let mark = tokio::spawn(async move { marker.mark(5).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let unmarker = h.coordinator.clone();
        let unmark = tokio::spawn(async move { unmarker.unmark(5).await });

        assert!(mark.await.unwrap());
        assert!(unmark.await.unwrap());

        assert!(!h.coordinator.is_marked(5).await);
        assert!(h.calendar.entries_for(5).await.is_empty());
        h.coordinator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_reconciles_calendar() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();
        h.coordinator.set_calendar_sync_enabled(true).await;
        h.coordinator.mark(1).await;
        h.coordinator.mark(2).await;
        h.coordinator.flush().await;

        h.remote.store(USER, &[2, 3]);
        h.coordinator.on_foreground().await;

        assert!(h.calendar.entries_for(1).await.is_empty());
        assert_eq!(h.calendar.entries_for(2).await.len(), 1);
        assert_eq!(h.calendar.entries_for(3).await.len(), 1);
        // Server omitted the flag: local value kept
        assert!(h.coordinator.calendar_sync_enabled().await);
    }

    // ========================================================================
    // Sign-out
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_clears_everything() {
        let h = harness();
        h.coordinator.load().await;
        h.coordinator.sign_in(proof()).await.unwrap();
        h.coordinator.set_calendar_sync_enabled(true).await;
        h.coordinator.flush().await;
        let pushes_before = h.remote.pushes().len();

        h.coordinator.mark(1).await;
        let mut personal = stale_entry("dentist", DEFAULT_CALENDAR_ID, 0, 1);
        personal.notes = "Dentist".to_string();
        h.calendar.insert_raw(personal).await;

        h.coordinator.sign_out().await;
        h.coordinator.flush().await;

        assert_eq!(h.remote.pushes().len(), pushes_before);
        assert!(h.coordinator.marked_items().await.is_empty());
        assert!(!h.coordinator.is_authenticated().await);
        assert!(h.local.load().is_none());
        assert!(h.local.load_session().is_none());
        assert!(cloud_marked(&h.cloud).await.is_none());
        assert_eq!(h.calendar.entries().await.len(), 1);

        let status = h.coordinator.status();
        assert_eq!(status.state, SyncState::SignedOut);
        assert_eq!(status.marked_count, 0);
        assert!(!status.authenticated);
    }

    #[tokio::test]
    async fn test_status_updates_are_observable() {
        let h = harness();
        let mut rx = h.coordinator.subscribe_status();
        h.coordinator.load().await;
        h.coordinator.mark(1).await;
        h.coordinator.mark(2).await;

        assert!(rx.has_changed().unwrap());
        let status = rx.borrow_and_update().clone();
        assert_eq!(status.marked_count, 2);
        assert_eq!(status.calendar_access, CalendarAccess::Granted);
    }

    // ========================================================================
    // HTTP contract (mockito)
    // ========================================================================

    #[tokio::test]
    async fn test_sign_in_pull_over_http() {
        let mut server = Server::new_async().await;
        let associate = server
            .mock("POST", "/associate")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "userId": "user-77",
                    "isNewUser": false,
                    "preferences": {
                        "filterSettings": {"states": ["GA"], "shootTypes": ["NSSA"], "marked": true},
                        "markedShoots": [21, 22],
                        "temperatureUnit": "celsius"
                    }
                }"#,
            )
            .create_async()
            .await;
        let push = server
            .mock("POST", "/syncPreferences")
            .match_header("authorization", "Bearer token-1")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "userId": "user-77",
                "markedItems": [21, 22, 23]
            })))
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .expect(1)
            .create_async()
            .await;

        let db = Database::in_memory().unwrap();
        let local = LocalPreferenceStore::new(db);
        let hub = CloudHub::new();
        let client = PreferenceApiClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let calendar = MemoryCalendar::new();
        let reconciler = CalendarReconciler::new(
            Arc::new(calendar),
            Arc::new(InMemoryCatalog::new()),
            local.clone(),
        );
        let coordinator = SyncCoordinator::new(
            local,
            Arc::new(hub.device("phone")),
            Arc::new(client),
            reconciler,
            Duration::from_millis(50),
        );

        coordinator.load().await;
        let outcome = coordinator.sign_in(proof()).await.unwrap();
        assert_eq!(outcome.path, SignInPath::Pulled);
        assert_eq!(coordinator.marked_items().await.ids(), vec![21, 22]);
        assert_eq!(coordinator.temperature_unit().await, TemperatureUnit::Celsius);
        assert!(!coordinator.filters().await.show_marked_only);

        coordinator.mark(23).await;
        coordinator.flush().await;

        associate.assert_async().await;
        push.assert_async().await;
    }

    #[tokio::test]
    async fn test_sign_in_server_error_is_reported() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/associate")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = PreferenceApiClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let local = LocalPreferenceStore::new(Database::in_memory().unwrap());
        let coordinator = SyncCoordinator::new(
            local.clone(),
            Arc::new(CloudHub::new().device("phone")),
            Arc::new(client),
            CalendarReconciler::new(
                Arc::new(MemoryCalendar::new()),
                Arc::new(InMemoryCatalog::new()),
                local,
            ),
            Duration::from_millis(50),
        );
        coordinator.load().await;

        let err = coordinator.sign_in(proof()).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::SignIn(PreferenceApiError::ServerError { status: 500, .. })
        ));
        assert!(!coordinator.is_authenticated().await);
        assert!(coordinator.status().last_error.is_some());
    }
}
