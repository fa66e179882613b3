//! Stale-event regeneration queue.
//!
//! When an upstream fact changes (a favorite is renamed or deleted, a
//! user's configuration changes) the affected events are flagged stale and
//! a job is queued that regenerates every whole UTC day they touch. Jobs run
//! either synchronously via [`InvalidationQueue::run_pending`] or on an
//! [`InvalidationWorker`] thread. Failures end the job in
//! [`JobStatus::Failed`] with a message; they never escape the worker.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::service::{covering_days, Clock, SystemClock, TimelineService};
use crate::store::EventStore;
use crate::timeline::{LocationRef, TimelineEvent};
use crate::{Result, TimelineError, UserId};

/// Default bound on retained job records.
pub const DEFAULT_MAX_JOBS: usize = 1_000;
/// Default time terminal job records are kept (seconds).
pub const DEFAULT_RETENTION_SECONDS: i64 = 24 * 3600;

/// Time span of one event that must be regenerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleEvent {
    pub user_id: UserId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl StaleEvent {
    pub fn from_event(user_id: UserId, event: &TimelineEvent) -> Self {
        Self {
            user_id,
            start: event.start(),
            end: event.end(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Progress of one regeneration job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub user_id: UserId,
    /// Whole UTC days to regenerate, oldest first
    pub days: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    pub status: JobStatus,
    pub days_done: usize,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Bounded job-record store.
///
/// Records are kept by id; terminal records are additionally indexed by
/// finish time so eviction always removes the oldest terminal record first
/// in `O(log n)`. Queued and running jobs are never evicted.
#[derive(Debug)]
pub struct JobRegistry {
    max_jobs: usize,
    retention: Duration,
    jobs: BTreeMap<JobId, JobRecord>,
    terminal: BTreeSet<(DateTime<Utc>, JobId)>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JOBS, Duration::seconds(DEFAULT_RETENTION_SECONDS))
    }
}

impl JobRegistry {
    pub fn new(max_jobs: usize, retention: Duration) -> Self {
        Self {
            max_jobs,
            retention,
            jobs: BTreeMap::new(),
            terminal: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: JobId) -> Option<&JobRecord> {
        self.jobs.get(&id)
    }

    pub fn insert(&mut self, record: JobRecord, now: DateTime<Utc>) {
        self.jobs.insert(record.id, record);
        self.evict(now);
    }

    fn get_mut(&mut self, id: JobId) -> Result<&mut JobRecord> {
        self.jobs.get_mut(&id).ok_or_else(|| TimelineError::NotFound {
            entity: "Job",
            id: id.0.to_string(),
        })
    }

    pub fn mark_running(&mut self, id: JobId) -> Result<()> {
        self.get_mut(id)?.status = JobStatus::Running;
        Ok(())
    }

    pub fn record_progress(&mut self, id: JobId, days_done: usize) -> Result<()> {
        self.get_mut(id)?.days_done = days_done;
        Ok(())
    }

    /// Move a job to a terminal state and index it for eviction.
    pub fn finish(
        &mut self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(previous) = self.get_mut(id)?.finished_at {
            self.terminal.remove(&(previous, id));
        }
        let record = self.get_mut(id)?;
        record.status = status;
        record.error = error;
        record.finished_at = Some(now);
        self.terminal.insert((now, id));
        self.evict(now);
        Ok(())
    }

    /// Drop terminal records past retention, then the oldest terminal
    /// records while over capacity.
    pub fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        while let Some(&(finished, id)) = self.terminal.first() {
            let expired = finished < cutoff;
            let over_capacity = self.jobs.len() > self.max_jobs;
            if !expired && !over_capacity {
                break;
            }
            self.terminal.pop_first();
            self.jobs.remove(&id);
            debug!("[JobRegistry] evicted job {}", id.0);
        }
    }
}

pub struct InvalidationQueue {
    service: Arc<TimelineService>,
    events: Arc<dyn EventStore>,
    registry: Mutex<JobRegistry>,
    pending: Mutex<VecDeque<JobId>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl InvalidationQueue {
    pub fn new(service: Arc<TimelineService>, events: Arc<dyn EventStore>) -> Self {
        Self {
            service,
            events,
            registry: Mutex::new(JobRegistry::default()),
            pending: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = Mutex::new(registry);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn registry(&self) -> MutexGuard<'_, JobRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<JobId>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flag the events stale and queue one job per affected user.
    pub fn mark_stale_and_queue(&self, stale: &[StaleEvent]) -> Result<Vec<JobId>> {
        let mut by_user: BTreeMap<UserId, BTreeSet<(DateTime<Utc>, DateTime<Utc>)>> = BTreeMap::new();
        for event in stale {
            let end = event.end.max(event.start + Duration::seconds(1));
            self.events.mark_stale(event.user_id, event.start, end)?;
            by_user
                .entry(event.user_id)
                .or_default()
                .extend(covering_days(event.start, end));
        }

        let now = self.clock.now();
        let mut ids = Vec::with_capacity(by_user.len());
        for (user_id, days) in by_user {
            let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
            info!(
                "[InvalidationQueue] job {} queued for {}: {} days",
                id.0,
                user_id,
                days.len()
            );
            self.registry().insert(
                JobRecord {
                    id,
                    user_id,
                    days: days.into_iter().collect(),
                    status: JobStatus::Queued,
                    days_done: 0,
                    error: None,
                    queued_at: now,
                    finished_at: None,
                },
                now,
            );
            self.pending().push_back(id);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Invalidate every stay of `user` attached to a favorite.
    pub fn favorite_changed(&self, user: UserId, favorite_id: i64) -> Result<Option<JobId>> {
        let stale: Vec<StaleEvent> = self
            .events
            .find_stays_by_location(user, LocationRef::Favorite(favorite_id))?
            .iter()
            .map(|s| StaleEvent {
                user_id: user,
                start: s.start,
                end: s.end(),
            })
            .collect();
        Ok(self.mark_stale_and_queue(&stale)?.into_iter().next())
    }

    /// Invalidate a user's whole timeline after a configuration change.
    pub fn config_changed(&self, user: UserId) -> Result<Option<JobId>> {
        let Some((start, end)) = self.events.event_bounds(user)? else {
            return Ok(None);
        };
        let stale = StaleEvent {
            user_id: user,
            start,
            end,
        };
        Ok(self.mark_stale_and_queue(&[stale])?.into_iter().next())
    }

    pub fn status(&self, id: JobId) -> Option<JobRecord> {
        self.registry().get(id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Run every queued job on the calling thread. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(id) = self.pending().pop_front() else {
                break;
            };
            self.run_job(id);
            ran += 1;
        }
        ran
    }

    fn run_job(&self, id: JobId) {
        let job = {
            let mut registry = self.registry();
            if registry.mark_running(id).is_err() {
                warn!("[InvalidationQueue] job {} vanished before running", id.0);
                return;
            }
            registry.get(id).cloned()
        };
        let Some(job) = job else {
            return;
        };

        for (done, (start, end)) in job.days.iter().enumerate() {
            if let Err(e) = self.service.force_regenerate(job.user_id, *start, *end) {
                warn!(
                    "[InvalidationQueue] job {} failed on {}: {}",
                    id.0,
                    start.date_naive(),
                    e
                );
                self.registry()
                    .finish(id, JobStatus::Failed, Some(e.to_string()), self.clock.now())
                    .ok();
                return;
            }
            self.registry().record_progress(id, done + 1).ok();
        }

        info!("[InvalidationQueue] job {} completed ({} days)", id.0, job.days.len());
        self.registry()
            .finish(id, JobStatus::Completed, None, self.clock.now())
            .ok();
    }
}

enum WorkerMessage {
    Run,
    Shutdown,
}

/// Background thread draining an [`InvalidationQueue`].
pub struct InvalidationWorker {
    queue: Arc<InvalidationQueue>,
    sender: mpsc::Sender<WorkerMessage>,
    handle: Option<JoinHandle<()>>,
}

impl InvalidationWorker {
    pub fn start(queue: Arc<InvalidationQueue>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let worker_queue = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            while let Ok(message) = receiver.recv() {
                match message {
                    WorkerMessage::Run => {
                        worker_queue.run_pending();
                    }
                    WorkerMessage::Shutdown => break,
                }
            }
            debug!("[InvalidationWorker] stopped");
        });
        Self {
            queue,
            sender,
            handle: Some(handle),
        }
    }

    /// Queue stale events and wake the worker.
    pub fn submit(&self, stale: &[StaleEvent]) -> Result<Vec<JobId>> {
        let ids = self.queue.mark_stale_and_queue(stale)?;
        self.notify();
        Ok(ids)
    }

    /// Wake the worker for jobs queued directly on the queue.
    pub fn notify(&self) {
        self.sender.send(WorkerMessage::Run).ok();
    }

    /// Finish queued work and stop the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.send(WorkerMessage::Shutdown).ok();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("[InvalidationWorker] worker thread panicked");
            }
        }
    }
}

impl Drop for InvalidationWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayeredConfigStore;
    use crate::detection::ClusterTimelineGenerator;
    use crate::service::FixedClock;
    use crate::store::MemoryStore;
    use crate::timeline::TimelineStay;
    use crate::{GpsPoint, TrackPoint};
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, d, h, 0, 0).unwrap()
    }

    fn record(id: u64, now: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: JobId(id),
            user_id: UserId::nil(),
            days: Vec::new(),
            status: JobStatus::Queued,
            days_done: 0,
            error: None,
            queued_at: now,
            finished_at: None,
        }
    }

    fn queue(store: &Arc<MemoryStore>) -> InvalidationQueue {
        let clock = Arc::new(FixedClock::at(at(20, 12)));
        let service = TimelineService::new(
            store.clone(),
            store.clone(),
            Arc::new(LayeredConfigStore::default()),
            Arc::new(ClusterTimelineGenerator),
        )
        .with_clock(clock.clone());
        InvalidationQueue::new(Arc::new(service), store.clone()).with_clock(clock)
    }

    fn seed(store: &MemoryStore, user: UserId) {
        let mut t = at(10, 8);
        let mut points = Vec::new();
        while t <= at(10, 12) {
            points.push(TrackPoint::new(t, 52.52, 13.405).with_accuracy(8.0));
            t += Duration::minutes(5);
        }
        store.add_points(user, points).unwrap();
    }

    #[test]
    fn test_registry_evicts_oldest_terminal_first() {
        let mut registry = JobRegistry::new(2, Duration::hours(1));
        let now = at(15, 12);
        registry.insert(record(1, now), now);
        registry.insert(record(2, now), now);
        registry.finish(JobId(2), JobStatus::Completed, None, now).unwrap();
        registry.finish(JobId(1), JobStatus::Completed, None, now + Duration::seconds(1)).unwrap();

        registry.insert(record(3, now), now + Duration::seconds(2));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(JobId(2)).is_none());
        assert!(registry.get(JobId(1)).is_some());
    }

    #[test]
    fn test_registry_never_evicts_active_jobs() {
        let mut registry = JobRegistry::new(1, Duration::hours(1));
        let now = at(15, 12);
        registry.insert(record(1, now), now);
        registry.insert(record(2, now), now);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_retention_window() {
        let mut registry = JobRegistry::new(10, Duration::hours(1));
        let now = at(15, 12);
        registry.insert(record(1, now), now);
        registry.finish(JobId(1), JobStatus::Failed, Some("boom".into()), now).unwrap();
        registry.evict(now + Duration::minutes(30));
        assert!(registry.get(JobId(1)).is_some());
        registry.evict(now + Duration::hours(2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_events_grouped_into_days() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(&store);
        let alice = UserId::new_v4();
        let bob = UserId::new_v4();

        let ids = queue
            .mark_stale_and_queue(&[
                StaleEvent { user_id: alice, start: at(10, 22), end: at(11, 7) },
                StaleEvent { user_id: alice, start: at(11, 9), end: at(11, 10) },
                StaleEvent { user_id: bob, start: at(12, 9), end: at(12, 10) },
            ])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(queue.pending_count(), 2);

        let alice_job = ids
            .iter()
            .filter_map(|id| queue.status(*id))
            .find(|job| job.user_id == alice)
            .unwrap();
        assert_eq!(alice_job.days, vec![(at(10, 0), at(11, 0)), (at(11, 0), at(12, 0))]);
        assert_eq!(alice_job.status, JobStatus::Queued);
    }

    #[test]
    fn test_favorite_change_regenerates() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new_v4();
        seed(&store, user);
        let mut stay = TimelineStay::new(at(10, 8), at(10, 9), GpsPoint::new(52.52, 13.405));
        stay.location_name = "Old favorite".to_string();
        stay.location_ref = Some(LocationRef::Favorite(5));
        store.persist(user, TimelineEvent::Stay(stay)).unwrap();

        let queue = queue(&store);
        let id = queue.favorite_changed(user, 5).unwrap().unwrap();
        assert!(store.all_events(user).unwrap()[0].is_stale());

        assert_eq!(queue.run_pending(), 1);
        let job = queue.status(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.days_done, 1);

        let events = store.all_events(user).unwrap();
        assert!(events.iter().all(|e| !e.is_stale()));
        assert_eq!(events[0].end(), at(10, 12));
    }

    struct BrokenConfig;

    impl crate::config::ConfigStore for BrokenConfig {
        fn effective_config(&self, _user: UserId) -> Result<Arc<crate::TimelineConfig>> {
            Err(TimelineError::Persistence("settings table missing".to_string()))
        }
    }

    #[test]
    fn test_failed_job_records_error() {
        let store = Arc::new(MemoryStore::new());
        let service = TimelineService::new(
            store.clone(),
            store.clone(),
            Arc::new(BrokenConfig),
            Arc::new(ClusterTimelineGenerator),
        );
        let queue = InvalidationQueue::new(Arc::new(service), store.clone());
        let user = UserId::new_v4();

        let ids = queue
            .mark_stale_and_queue(&[StaleEvent { user_id: user, start: at(10, 8), end: at(10, 9) }])
            .unwrap();
        queue.run_pending();

        let job = queue.status(ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("settings table missing"));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_config_change_without_events_queues_nothing() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(&store);
        assert_eq!(queue.config_changed(UserId::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_worker_runs_jobs() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new_v4();
        seed(&store, user);
        let queue = Arc::new(queue(&store));

        let worker = InvalidationWorker::start(queue.clone());
        let ids = worker
            .submit(&[StaleEvent { user_id: user, start: at(10, 8), end: at(10, 12) }])
            .unwrap();
        worker.shutdown();

        assert_eq!(queue.status(ids[0]).unwrap().status, JobStatus::Completed);
        assert_eq!(store.all_events(user).unwrap().len(), 1);
    }
}
