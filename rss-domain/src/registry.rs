use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::attempt::{AppMapId, TaskAttempt, TaskAttemptState};
use super::error::{Result, RssError};

// ---------------------------------------------------------------------------
// AttemptSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of one attempt, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSnapshot {
    // ---
    pub app_map_id: AppMapId,
    pub attempt_id: i64,
    pub state: TaskAttemptState,
}

// ---------------------------------------------------------------------------
// TaskAttemptRegistry
// ---------------------------------------------------------------------------

/// Every attempt the server has seen, keyed by logical map task.
///
/// One registry per server process, constructed at startup and shared by
/// `Arc` with the connection handlers, the admission controller and the
/// application cleanup task.
///
/// The outer map is sharded (`DashMap`), so lookups for unrelated map tasks
/// rarely touch the same lock; state transitions happen on the returned
/// [`TaskAttempt`] under its own mutex, outside any map lock.
#[derive(Debug, Default)]
pub struct TaskAttemptRegistry {
    // ---
    attempts: DashMap<AppMapId, HashMap<i64, Arc<TaskAttempt>>>,

    /// Last protocol activity per application id.
    app_activity: DashMap<String, Instant>,

    /// Attempts currently in `StartUpload`, maintained by their transitions.
    in_flight: Arc<AtomicUsize>,
}

// ---

impl TaskAttemptRegistry {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    // ---

    /// Return the attempt, creating it in `NotStarted` if unseen.
    ///
    /// Creation happens under the shard's entry lock, so racing callers
    /// with the same key all receive the same record.
    pub fn get_or_create(&self, app_map_id: &AppMapId, attempt_id: i64) -> Arc<TaskAttempt> {
        // ---
        let attempt = {
            let mut attempts = self.attempts.entry(app_map_id.clone()).or_default();
            Arc::clone(attempts.entry(attempt_id).or_insert_with(|| {
                tracing::debug!(%app_map_id, attempt_id, "registering task attempt");
                Arc::new(TaskAttempt::tracked(
                    app_map_id.clone(),
                    attempt_id,
                    Arc::clone(&self.in_flight),
                ))
            }))
        };
        self.record_activity(&app_map_id.app_id);
        attempt
    }

    // ---

    /// Look up an attempt that must already exist.
    pub fn get(&self, app_map_id: &AppMapId, attempt_id: i64) -> Result<Arc<TaskAttempt>> {
        // ---
        let attempt = self
            .attempts
            .get(app_map_id)
            .and_then(|attempts| attempts.get(&attempt_id).cloned())
            .ok_or_else(|| RssError::UnknownAttempt {
                app_map_id: app_map_id.clone(),
                attempt_id,
            })?;
        self.record_activity(&app_map_id.app_id);
        Ok(attempt)
    }

    // ---

    /// All attempts recorded for one map task, ordered by attempt id.
    pub fn attempts_of(&self, app_map_id: &AppMapId) -> Vec<Arc<TaskAttempt>> {
        // ---
        let mut out: Vec<Arc<TaskAttempt>> = self
            .attempts
            .get(app_map_id)
            .map(|attempts| attempts.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|a| a.attempt_id());
        out
    }

    /// Snapshot of every attempt.  Order is unspecified.
    pub fn snapshot(&self) -> Vec<AttemptSnapshot> {
        // ---
        self.attempts
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .values()
                    .map(|a| AttemptSnapshot {
                        app_map_id: a.app_map_id().clone(),
                        attempt_id: a.attempt_id(),
                        state: a.state(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of attempts currently between start-upload and finish-upload.
    pub fn in_flight_uploads(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.attempts.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---

    /// Drop every attempt of `app_id`.  Returns how many were removed.
    pub fn remove_application(&self, app_id: &str) -> usize {
        // ---
        let mut removed = 0;
        self.attempts.retain(|key, attempts| {
            if key.app_id == app_id {
                removed += attempts.len();
                attempts.values().for_each(|a| a.detach());
                false
            } else {
                true
            }
        });
        self.app_activity.remove(app_id);
        tracing::info!(app_id, removed, "removed application task attempts");
        removed
    }

    /// Remove every application with no activity for at least `max_idle`.
    /// Applications with an upload in progress are kept regardless.
    /// Returns the expired application ids.
    pub fn expire_idle_applications(&self, max_idle: Duration) -> Vec<String> {
        // ---
        let now = Instant::now();
        let idle: Vec<String> = self
            .app_activity
            .iter()
            .filter(|e| now.saturating_duration_since(*e.value()) >= max_idle)
            .map(|e| e.key().clone())
            .collect();

        let mut expired = Vec::with_capacity(idle.len());
        for app_id in idle {
            if self.has_upload_in_progress(&app_id) {
                tracing::debug!(%app_id, "idle application still uploading; kept");
                continue;
            }
            self.remove_application(&app_id);
            expired.push(app_id);
        }
        expired
    }

    /// Note activity for `app_id` without touching any attempt, e.g. for a
    /// record frame of an upload in progress.
    pub fn record_activity(&self, app_id: &str) {
        self.app_activity.insert(app_id.to_string(), Instant::now());
    }

    // ---

    fn has_upload_in_progress(&self, app_id: &str) -> bool {
        self.attempts.iter().any(|entry| {
            entry.key().app_id == app_id
                && entry
                    .value()
                    .values()
                    .any(|a| a.state() == TaskAttemptState::StartUpload)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn get_or_create_returns_same_record() {
        let reg = TaskAttemptRegistry::new();
        let id = AppMapId::new("app", 1);

        let a = reg.get_or_create(&id, 10);
        a.mark_start_upload().unwrap();

        let b = reg.get_or_create(&id, 10);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.state(), TaskAttemptState::StartUpload);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn get_unknown_attempt_is_invalid_state() {
        let reg = TaskAttemptRegistry::new();
        let id = AppMapId::new("app", 1);
        reg.get_or_create(&id, 1);

        let err = reg.get(&id, 2).unwrap_err();
        assert!(matches!(err, RssError::UnknownAttempt { attempt_id: 2, .. }));
        assert!(err.is_invalid_state());

        assert!(reg.get(&AppMapId::new("other", 1), 1).is_err());
    }

    #[test]
    fn attempts_of_same_map_task_are_independent() {
        // ---
        let reg = TaskAttemptRegistry::new();
        let id = AppMapId::new("app", 5);

        let first = reg.get_or_create(&id, 1);
        let speculative = reg.get_or_create(&id, 2);

        first.mark_start_upload().unwrap();
        first.mark_finish_upload().unwrap();
        first.mark_committed().unwrap();

        assert_eq!(speculative.state(), TaskAttemptState::NotStarted);
        speculative.mark_start_upload().unwrap();
        assert_eq!(first.state(), TaskAttemptState::Committed);

        let ids: Vec<i64> = reg.attempts_of(&id).iter().map(|a| a.attempt_id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn racing_get_or_create_yields_one_record() {
        // ---
        let reg = Arc::new(TaskAttemptRegistry::new());
        let id = AppMapId::new("race", 0);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let id = id.clone();
                std::thread::spawn(move || reg.get_or_create(&id, 42))
            })
            .collect();

        let records: Vec<Arc<TaskAttempt>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(records.iter().all(|r| Arc::ptr_eq(r, &records[0])));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn in_flight_counts_only_started_uploads() {
        let reg = TaskAttemptRegistry::new();
        let id = AppMapId::new("app", 1);

        reg.get_or_create(&id, 1).mark_start_upload().unwrap();
        reg.get_or_create(&id, 2).mark_start_upload().unwrap();
        reg.get_or_create(&id, 3);

        let done = reg.get_or_create(&id, 4);
        done.mark_start_upload().unwrap();
        done.mark_finish_upload().unwrap();

        assert_eq!(reg.in_flight_uploads(), 2);
        assert_eq!(reg.snapshot().len(), 4);
    }

    #[test]
    fn remove_application_drops_only_that_app() {
        let reg = TaskAttemptRegistry::new();
        reg.get_or_create(&AppMapId::new("a", 1), 1);
        reg.get_or_create(&AppMapId::new("a", 2), 1);
        reg.get_or_create(&AppMapId::new("b", 1), 1);

        assert_eq!(reg.remove_application("a"), 2);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(&AppMapId::new("b", 1), 1).is_ok());
    }

    #[test]
    fn in_flight_count_follows_transitions() {
        // ---
        let reg = TaskAttemptRegistry::new();
        let id = AppMapId::new("app", 1);

        let a = reg.get_or_create(&id, 1);
        a.mark_start_upload().unwrap();
        assert!(a.mark_start_upload().is_err());
        assert_eq!(reg.in_flight_uploads(), 1);

        assert!(a.mark_committed().is_err());
        assert_eq!(reg.in_flight_uploads(), 1);

        a.mark_finish_upload().unwrap();
        a.mark_committed().unwrap();
        assert_eq!(reg.in_flight_uploads(), 0);
    }

    #[test]
    fn removed_attempts_leave_the_in_flight_count() {
        // ---
        let reg = TaskAttemptRegistry::new();
        let held = reg.get_or_create(&AppMapId::new("gone", 1), 1);
        held.mark_start_upload().unwrap();
        reg.get_or_create(&AppMapId::new("kept", 1), 1)
            .mark_start_upload()
            .unwrap();
        assert_eq!(reg.in_flight_uploads(), 2);

        reg.remove_application("gone");
        assert_eq!(reg.in_flight_uploads(), 1);

        // A handler still holding the removed attempt must not skew the count.
        held.mark_finish_upload().unwrap();
        assert_eq!(reg.in_flight_uploads(), 1);
    }

    #[test]
    fn uploading_application_is_never_expired() {
        // ---
        let reg = TaskAttemptRegistry::new();
        let busy = reg.get_or_create(&AppMapId::new("busy", 1), 1);
        busy.mark_start_upload().unwrap();
        reg.get_or_create(&AppMapId::new("busy", 2), 1);
        reg.get_or_create(&AppMapId::new("idle", 1), 1);

        assert_eq!(reg.expire_idle_applications(Duration::ZERO), vec!["idle".to_string()]);
        assert_eq!(reg.len(), 2);

        busy.mark_finish_upload().unwrap();
        assert_eq!(reg.expire_idle_applications(Duration::ZERO), vec!["busy".to_string()]);
        assert!(reg.is_empty());
    }

    #[test]
    fn record_activity_postpones_expiry() {
        // ---
        let reg = TaskAttemptRegistry::new();
        reg.get_or_create(&AppMapId::new("app", 1), 1);
        std::thread::sleep(Duration::from_millis(150));

        reg.record_activity("app");
        assert!(reg.expire_idle_applications(Duration::from_millis(100)).is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn expire_idle_applications_honours_max_idle() {
        let reg = TaskAttemptRegistry::new();
        reg.get_or_create(&AppMapId::new("a", 1), 1);
        reg.get_or_create(&AppMapId::new("b", 1), 1);

        assert!(reg.expire_idle_applications(Duration::from_secs(3600)).is_empty());
        assert_eq!(reg.len(), 2);

        let mut expired = reg.expire_idle_applications(Duration::ZERO);
        expired.sort();
        assert_eq!(expired, vec!["a".to_string(), "b".to_string()]);
        assert!(reg.is_empty());
    }
}
