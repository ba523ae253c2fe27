use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::error::{Result, RssError};

// ---------------------------------------------------------------------------
// AppMapId
// ---------------------------------------------------------------------------

/// A logical map task within an application, independent of attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppMapId {
    // ---
    pub app_id: String,
    pub map_id: i32,
}

// ---

impl AppMapId {
    // ---
    pub fn new(app_id: impl Into<String>, map_id: i32) -> Self {
        Self {
            app_id: app_id.into(),
            map_id,
        }
    }
}

// ---

impl fmt::Display for AppMapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id, self.map_id)
    }
}

// ---------------------------------------------------------------------------
// TaskAttemptState
// ---------------------------------------------------------------------------

/// Upload progress of one task attempt.
///
/// Declaration order is the progress order; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskAttemptState {
    // ---
    NotStarted,
    StartUpload,
    FinishUpload,
    Committed,
}

// ---

impl fmt::Display for TaskAttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskAttemptState::NotStarted => "NOT_STARTED",
            TaskAttemptState::StartUpload => "START_UPLOAD",
            TaskAttemptState::FinishUpload => "FINISH_UPLOAD",
            TaskAttemptState::Committed => "COMMITTED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// TaskAttempt
// ---------------------------------------------------------------------------

/// State of a single task attempt on the server.
///
/// Owned by [`TaskAttemptRegistry`](crate::TaskAttemptRegistry) and handed
/// out as `Arc<TaskAttempt>`.  Every transition runs under the attempt's own
/// mutex, so concurrent protocol events for the same attempt are serialised
/// while different attempts never contend.
#[derive(Debug)]
pub struct TaskAttempt {
    // ---
    app_map_id: AppMapId,
    attempt_id: i64,
    inner: Mutex<AttemptInner>,
}

#[derive(Debug)]
struct AttemptInner {
    state: TaskAttemptState,

    /// Owner's count of attempts in `StartUpload`.  `None` when untracked
    /// or detached.
    in_flight: Option<Arc<AtomicUsize>>,
}

// ---

impl TaskAttempt {
    // ---
    pub fn new(app_map_id: AppMapId, attempt_id: i64) -> Self {
        Self::with_counter(app_map_id, attempt_id, None)
    }

    /// An attempt that keeps `in_flight` equal to the number of tracked
    /// attempts in `StartUpload`.
    pub(crate) fn tracked(
        app_map_id: AppMapId,
        attempt_id: i64,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self::with_counter(app_map_id, attempt_id, Some(in_flight))
    }

    fn with_counter(
        app_map_id: AppMapId,
        attempt_id: i64,
        in_flight: Option<Arc<AtomicUsize>>,
    ) -> Self {
        Self {
            app_map_id,
            attempt_id,
            inner: Mutex::new(AttemptInner {
                state: TaskAttemptState::NotStarted,
                in_flight,
            }),
        }
    }

    pub fn app_map_id(&self) -> &AppMapId {
        &self.app_map_id
    }

    pub fn attempt_id(&self) -> i64 {
        self.attempt_id
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> TaskAttemptState {
        self.lock().state
    }

    // ---

    /// `NotStarted → StartUpload`.  Any other origin means the attempt tried
    /// to re-open an upload it already began.
    pub fn mark_start_upload(&self) -> Result<()> {
        self.transition(TaskAttemptState::StartUpload, |s| {
            s == TaskAttemptState::NotStarted
        })
    }

    /// `StartUpload → FinishUpload`.
    pub fn mark_finish_upload(&self) -> Result<()> {
        self.transition(TaskAttemptState::FinishUpload, |s| {
            s == TaskAttemptState::StartUpload
        })
    }

    /// `{NotStarted, FinishUpload, Committed} → Committed`.
    ///
    /// Committing from `NotStarted` covers an attempt with zero records.
    /// A started but unfinished upload holds incomplete data and is refused.
    pub fn mark_committed(&self) -> Result<()> {
        self.transition(TaskAttemptState::Committed, |s| {
            s != TaskAttemptState::StartUpload
        })
    }

    pub fn is_committed(&self) -> bool {
        self.state() == TaskAttemptState::Committed
    }

    /// `true` from `FinishUpload` on, so a committed attempt still reports
    /// its upload as finished.
    pub fn is_finished_upload(&self) -> bool {
        self.state() >= TaskAttemptState::FinishUpload
    }

    // ---

    fn transition<F>(&self, target: TaskAttemptState, allowed_from: F) -> Result<()>
    where
        F: FnOnce(TaskAttemptState) -> bool,
    {
        let mut inner = self.lock();
        let from = inner.state;
        if !allowed_from(from) {
            return Err(RssError::InvalidState {
                app_map_id: self.app_map_id.clone(),
                attempt_id: self.attempt_id,
                current: from,
                target,
            });
        }
        inner.state = target;

        if let Some(in_flight) = &inner.in_flight {
            if target == TaskAttemptState::StartUpload {
                in_flight.fetch_add(1, Ordering::Relaxed);
            } else if from == TaskAttemptState::StartUpload {
                in_flight.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Stop contributing to the owner's in-flight count.  Called when the
    /// owner drops the attempt while a handler may still hold it.
    pub(crate) fn detach(&self) {
        let mut inner = self.lock();
        if let Some(in_flight) = inner.in_flight.take() {
            if inner.state == TaskAttemptState::StartUpload {
                in_flight.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    // The guarded value is plain data, so a poisoned lock still holds a
    // valid state.
    fn lock(&self) -> std::sync::MutexGuard<'_, AttemptInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---

impl fmt::Display for TaskAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TaskAttempt{{app_map_id={}, attempt_id={}, state={}}}",
            self.app_map_id,
            self.attempt_id,
            self.state()
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
