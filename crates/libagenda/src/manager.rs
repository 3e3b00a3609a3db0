use agenda_protocol::ServerMessage;
use agenda_protocol::model::{Period, Schedule, ScheduleResponse};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::Services;
use crate::cache::{SCHEDULE_PREFIX, schedule_key};
use crate::error::AgendaError;
use crate::notify::{Notification, NotificationQueue};
use crate::schedule;
use crate::session::{SessionHandle, SessionId};
use crate::store::StoreError;
use crate::visitor;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Outbound messages buffered per session before pushes are dropped.
    pub queue_capacity: usize,
    /// Deadline for a single inbound event.
    pub event_timeout: Duration,
    pub notify_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            event_timeout: Duration::from_secs(10),
            notify_capacity: 32,
        }
    }
}

/// Outcome of one broadcast pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Registry of live sessions plus the shared collaborators they act on.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    services: Arc<Services>,
    settings: ManagerSettings,
    /// Bumped by every invalidation; a rebuild only caches its result if
    /// no invalidation happened since it started reading storage.
    schedule_generation: RwLock<u64>,
    notifications: NotificationQueue,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(services: Arc<Services>, settings: ManagerSettings) -> Arc<Self> {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let notifications = NotificationQueue::start(
            Arc::clone(&services.notifier),
            settings.notify_capacity,
            &tracker,
            cancel.child_token(),
        );
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            services,
            settings,
            schedule_generation: RwLock::new(0),
            notifications,
            tracker,
            cancel,
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn event_timeout(&self) -> Duration {
        self.settings.event_timeout
    }

    /// A fresh, unregistered session whose eviction token hangs off the manager's.
    pub fn new_session(
        &self,
        remote_addr: SocketAddr,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<ServerMessage>) {
        let (handle, rx) = SessionHandle::new(
            remote_addr,
            self.settings.queue_capacity,
            self.cancel.child_token(),
        );
        (Arc::new(handle), rx)
    }

    pub async fn add(&self, session: Arc<SessionHandle>) {
        let id = session.id();
        let addr = session.remote_addr();
        let total = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(id, session);
            sessions.len()
        };
        tracing::info!(session_id = %id, %addr, total, "session registered");
    }

    /// Evict a session and cancel its token. Safe to call more than once.
    pub async fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.write().await.remove(&id);
        match removed {
            Some(session) => {
                session.cancel_token().cancel();
                tracing::info!(session_id = %id, "session evicted");
                true
            }
            None => false,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cached schedule for `period`, rebuilt from storage on a miss.
    ///
    /// Cache failures never fail the request; they are logged and the
    /// schedule is rebuilt.
    pub async fn fetch_schedule(&self, period: &Period) -> Result<Schedule, AgendaError> {
        let key = schedule_key(period);
        match self.services.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Schedule>(&raw) {
                Ok(schedule) => return Ok(schedule),
                Err(e) => tracing::warn!(%key, error = %e, "discarding unreadable cached schedule"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(%key, error = %e, "cache read failed, rebuilding schedule"),
        }

        let generation = *self.schedule_generation.read().await;
        let availability = self.services.storage.fetch_newest_availability().await?;
        let tasks = self
            .services
            .storage
            .fetch_tasks_in_range(period.start, period.end)
            .await?;
        let schedule = schedule::build(&availability, &tasks);

        // held across the write so an invalidation cannot slip in between
        let current = self.schedule_generation.read().await;
        if *current != generation {
            tracing::debug!(%key, "schedules invalidated during rebuild, not caching");
            return Ok(schedule);
        }
        match serde_json::to_string(&schedule) {
            Ok(raw) => {
                if let Err(e) = self.services.cache.set(&key, raw).await {
                    tracing::warn!(%key, error = %e, "cache write failed");
                }
            }
            Err(e) => tracing::warn!(%key, error = %e, "could not serialize schedule for cache"),
        }
        Ok(schedule)
    }

    /// Drop every cached schedule after a mutation.
    pub async fn invalidate_schedules(&self) {
        let mut generation = self.schedule_generation.write().await;
        *generation += 1;
        if let Err(e) = self.services.cache.delete_prefix(SCHEDULE_PREFIX).await {
            tracing::warn!(error = %e, "failed to invalidate cached schedules");
        }
    }

    /// Run a storage change and its follow-up steps on the manager's tracker.
    ///
    /// The caller may stop waiting once its event deadline passes; a change
    /// that committed still gets its invalidation, notifications and broadcast.
    pub async fn run_mutation<T, F>(&self, change: F) -> Result<T, AgendaError>
    where
        F: Future<Output = Result<T, AgendaError>> + Send + 'static,
        T: Send + 'static,
    {
        self.tracker.spawn(change).await.map_err(|e| {
            AgendaError::Store(StoreError::Backend(format!("mutation task failed: {e}")))
        })?
    }

    /// Push a fresh schedule for `affected` to every session viewing an
    /// overlapping period.
    pub async fn broadcast(&self, affected: &Period) -> Result<BroadcastReport, AgendaError> {
        let agenda = self.fetch_schedule(affected).await?;
        let msg = ServerMessage::BroadcastSchedule(ScheduleResponse {
            current_period: affected.clone(),
            agenda,
        });

        let mut report = BroadcastReport::default();
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            let Some(viewing) = session.period().await else {
                continue;
            };
            if !viewing.overlaps(affected) {
                continue;
            }
            match session.try_push(msg.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    tracing::warn!(session_id = %session.id(), "outbound queue full, skipping broadcast");
                }
                Err(TrySendError::Closed(_)) => {
                    report.dropped += 1;
                    tracing::debug!(session_id = %session.id(), "outbound queue closed, skipping broadcast");
                }
            }
        }
        tracing::debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            start = %affected.start,
            end = %affected.end,
            "schedule broadcast"
        );
        Ok(report)
    }

    /// Run `broadcast` in the background on the manager's tracker.
    pub fn schedule_broadcast(self: &Arc<Self>, affected: Period) {
        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = manager.cancel.cancelled() => {}
                result = manager.broadcast(&affected) => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "schedule broadcast failed");
                    }
                }
            }
        });
    }

    /// Count a visit from `ip` in the background.
    pub fn track_visit(self: &Arc<Self>, ip: IpAddr) {
        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            match visitor::record_visit(&manager.services, ip).await {
                Ok(v) => tracing::debug!(uid = %v.uid, visits = v.visit_count, "visit recorded"),
                Err(e) => tracing::warn!(%ip, error = %e, "failed to record visit"),
            }
        });
    }

    /// Queue a notification; drops it with a warning when the queue is full.
    pub fn notify(&self, notification: Notification) {
        self.notifications.enqueue(notification);
    }

    /// Cancel every session and background task, then wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.sessions.write().await.clear();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("session manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, CacheError, MemoryCache};
    use crate::cipher::CipherSettings;
    use crate::notify::LogMailer;
    use crate::store::{SqliteStorage, Storage};
    use agenda_protocol::model::{Availability, Task, TaskMethod, TaskUpdate, Visitor};
    use async_trait::async_trait;
    use chrono::{DateTime, FixedOffset};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;
    use tokio::sync::{Notify, oneshot};
    use uuid::Uuid;

    fn ts(raw: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(raw).unwrap()
    }

    fn period(start: &str, end: &str) -> Period {
        Period::between(ts(start), ts(end))
    }

    fn services_with_cache(cache: Arc<dyn Cache>) -> (Arc<Services>, SqliteStorage) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let services = Arc::new(Services {
            storage: Arc::new(storage.clone()),
            cache,
            notifier: Arc::new(LogMailer),
            cipher: CipherSettings::default(),
        });
        (services, storage)
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn booked(tid: &str, start: &str, end: &str) -> Task {
        Task {
            id: Uuid::new_v4(),
            tid: tid.into(),
            start: ts(start),
            end: ts(end),
            detail: String::new(),
            method: TaskMethod::Phone,
            owner: "o".into(),
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Parks the first range read after it has taken its snapshot.
    struct GatedStorage {
        inner: SqliteStorage,
        armed: AtomicBool,
        parked: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Storage for GatedStorage {
        async fn fetch_tasks_in_range(
            &self,
            start: DateTime<FixedOffset>,
            end: DateTime<FixedOffset>,
        ) -> Result<Vec<Task>, StoreError> {
            let tasks = self.inner.fetch_tasks_in_range(start, end).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                self.release.notified().await;
            }
            Ok(tasks)
        }
        async fn fetch_newest_availability(&self) -> Result<Vec<Availability>, StoreError> {
            self.inner.fetch_newest_availability().await
        }
        async fn fetch_task(&self, tid: &str) -> Result<Task, StoreError> {
            self.inner.fetch_task(tid).await
        }
        async fn insert_task(&self, task: &Task, deadline: Instant) -> Result<(), StoreError> {
            self.inner.insert_task(task, deadline).await
        }
        async fn update_task(
            &self,
            tid: &str,
            update: &TaskUpdate,
            deadline: Instant,
        ) -> Result<Task, StoreError> {
            self.inner.update_task(tid, update, deadline).await
        }
        async fn delete_task(&self, tid: &str, deadline: Instant) -> Result<u64, StoreError> {
            self.inner.delete_task(tid, deadline).await
        }
        async fn record_visit(&self, uid: &str, address: &str) -> Result<Visitor, StoreError> {
            self.inner.record_visit(uid, address).await
        }
        async fn mark_visitor_booked(&self, uid: &str) -> Result<(), StoreError> {
            self.inner.mark_visitor_booked(uid).await
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn set(&self, _key: &str, _value: String) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_cancels() {
        let (services, _) = services_with_cache(Arc::new(MemoryCache::new()));
        let manager = SessionManager::new(services, ManagerSettings::default());
        let (session, _rx) = manager.new_session(addr(4000));
        manager.add(Arc::clone(&session)).await;
        assert_eq!(manager.session_count().await, 1);

        assert!(manager.remove(session.id()).await);
        assert!(!manager.remove(session.id()).await);
        assert!(session.is_cancelled());
        assert_eq!(manager.session_count().await, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_only_overlapping_sessions() {
        let (services, _) = services_with_cache(Arc::new(MemoryCache::new()));
        let manager = SessionManager::new(services, ManagerSettings::default());

        let (mon_wed, mut rx_a) = manager.new_session(addr(1));
        let (thu_fri, mut rx_b) = manager.new_session(addr(2));
        let (idle, mut rx_c) = manager.new_session(addr(3));
        mon_wed
            .set_period(period("2025-03-03T00:00:00Z", "2025-03-05T00:00:00Z"))
            .await;
        thu_fri
            .set_period(period("2025-03-06T00:00:00Z", "2025-03-08T00:00:00Z"))
            .await;
        for s in [&mon_wed, &thu_fri, &idle] {
            manager.add(Arc::clone(s)).await;
        }

        let tue_thu = period("2025-03-04T00:00:00Z", "2025-03-06T00:00:00Z");
        let report = manager.broadcast(&tue_thu).await.unwrap();
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 0 });

        match rx_a.try_recv().unwrap() {
            ServerMessage::BroadcastSchedule(resp) => assert_eq!(resp.current_period, tue_thu),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());

        let thu_only = period("2025-03-06T00:00:00Z", "2025-03-07T00:00:00Z");
        let report = manager.broadcast(&thu_only).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_is_skipped_not_awaited() {
        let (services, _) = services_with_cache(Arc::new(MemoryCache::new()));
        let settings = ManagerSettings {
            queue_capacity: 1,
            ..ManagerSettings::default()
        };
        let manager = SessionManager::new(services, settings);
        let week = period("2025-03-03T00:00:00Z", "2025-03-10T00:00:00Z");

        let (slow, _rx_slow) = manager.new_session(addr(1));
        let (fast, mut rx_fast) = manager.new_session(addr(2));
        slow.set_period(week.clone()).await;
        fast.set_period(week.clone()).await;
        manager.add(Arc::clone(&slow)).await;
        manager.add(Arc::clone(&fast)).await;

        let first = manager.broadcast(&week).await.unwrap();
        assert_eq!(first.delivered, 2);
        rx_fast.try_recv().unwrap();

        let second = manager.broadcast(&week).await.unwrap();
        assert_eq!(second, BroadcastReport { delivered: 1, dropped: 1 });
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn fetch_schedule_survives_cache_outage() {
        let (services, storage) = services_with_cache(Arc::new(BrokenCache));
        let manager = SessionManager::new(services, ManagerSettings::default());
        storage
            .insert_task(
                &booked("t1", "2025-03-04T09:00:00Z", "2025-03-04T10:00:00Z"),
                later(),
            )
            .await
            .unwrap();

        let schedule = manager
            .fetch_schedule(&period("2025-03-03T00:00:00Z", "2025-03-10T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(schedule.tasks().count(), 1);
        manager.invalidate_schedules().await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn fetch_schedule_fills_and_reads_cache() {
        let cache = Arc::new(MemoryCache::new());
        let (services, _) = services_with_cache(cache.clone());
        let manager = SessionManager::new(services, ManagerSettings::default());
        let week = period("2025-03-03T00:00:00Z", "2025-03-10T00:00:00Z");

        let built = manager.fetch_schedule(&week).await.unwrap();
        assert_eq!(cache.len().await, 1);
        let cached = manager.fetch_schedule(&week).await.unwrap();
        assert_eq!(built, cached);

        manager.invalidate_schedules().await;
        assert!(cache.is_empty().await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn rebuild_overtaken_by_invalidation_is_not_cached() {
        let gated = Arc::new(GatedStorage {
            inner: SqliteStorage::open_in_memory().unwrap(),
            armed: AtomicBool::new(true),
            parked: Notify::new(),
            release: Notify::new(),
        });
        let cache = Arc::new(MemoryCache::new());
        let services = Arc::new(Services {
            storage: gated.clone(),
            cache: cache.clone(),
            notifier: Arc::new(LogMailer),
            cipher: CipherSettings::default(),
        });
        let manager = SessionManager::new(services, ManagerSettings::default());
        let week = period("2025-03-03T00:00:00Z", "2025-03-10T00:00:00Z");

        let viewer = {
            let manager = Arc::clone(&manager);
            let week = week.clone();
            tokio::spawn(async move { manager.fetch_schedule(&week).await })
        };
        gated.parked.notified().await;

        // a booking lands while the viewer holds its empty snapshot
        gated
            .inner
            .insert_task(
                &booked("t1", "2025-03-05T10:00:00Z", "2025-03-05T11:00:00Z"),
                later(),
            )
            .await
            .unwrap();
        manager.invalidate_schedules().await;
        gated.release.notify_one();

        let snapshot = viewer.await.unwrap().unwrap();
        assert_eq!(snapshot.tasks().count(), 0);
        assert!(cache.is_empty().await);

        let fresh = manager.fetch_schedule(&week).await.unwrap();
        assert_eq!(fresh.tasks().count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn mutation_finishes_after_caller_stops_waiting() {
        let (services, _) = services_with_cache(Arc::new(MemoryCache::new()));
        let manager = SessionManager::new(services, ManagerSettings::default());
        let (done_tx, done_rx) = oneshot::channel();

        let waiting = manager.run_mutation(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = done_tx.send(());
            Ok::<(), AgendaError>(())
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(10), waiting)
                .await
                .is_err()
        );

        tokio::time::timeout(Duration::from_secs(2), done_rx)
            .await
            .unwrap()
            .unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_scheduled_broadcasts() {
        let (services, _) = services_with_cache(Arc::new(MemoryCache::new()));
        let manager = SessionManager::new(services, ManagerSettings::default());
        let (session, mut rx) = manager.new_session(addr(9));
        let week = period("2025-03-03T00:00:00Z", "2025-03-10T00:00:00Z");
        session.set_period(week.clone()).await;
        manager.add(Arc::clone(&session)).await;

        manager.schedule_broadcast(week);
        let pushed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(matches!(pushed, Some(ServerMessage::BroadcastSchedule(_))));

        manager.shutdown().await;
        assert!(session.is_cancelled());
        assert_eq!(manager.session_count().await, 0);
    }
}
