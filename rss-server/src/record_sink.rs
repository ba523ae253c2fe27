use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

// ---

use rss_domain::{AppMapId, Result};
use rss_protocol::Record;

// ---------------------------------------------------------------------------
// RecordSink
// ---------------------------------------------------------------------------

/// Where uploaded records go.  The storage engine proper sits behind this;
/// the server only needs append, commit and teardown.
pub trait RecordSink: Send + Sync {
    // ---
    fn append(&self, app_map_id: &AppMapId, attempt_id: i64, records: Vec<Record>) -> Result<()>;

    /// Publish `attempt_id`'s records as the result of its map task.
    fn commit(&self, app_map_id: &AppMapId, attempt_id: i64) -> Result<()>;

    /// Drop everything held for `app_id`.  Returns bytes released.
    fn drop_application(&self, app_id: &str) -> u64;
}

pub type RecordSinkPtr = Arc<dyn RecordSink>;

// ---------------------------------------------------------------------------
// InMemoryRecordSink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AttemptData {
    records: Vec<Record>,
    partition_bytes: BTreeMap<u32, u64>,
}

impl AttemptData {
    fn bytes(&self) -> u64 {
        self.partition_bytes.values().sum()
    }
}

// ---

/// Keeps every record in memory.  One committed attempt per map task: the
/// first commit wins and later commits of other attempts are ignored.
#[derive(Debug, Default)]
pub struct InMemoryRecordSink {
    attempts: DashMap<(AppMapId, i64), AttemptData>,
    committed: DashMap<AppMapId, i64>,
}

impl InMemoryRecordSink {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt whose output is published for `app_map_id`, if any.
    pub fn committed_attempt(&self, app_map_id: &AppMapId) -> Option<i64> {
        self.committed.get(app_map_id).map(|a| *a)
    }

    /// Records of the committed attempt, in arrival order.
    pub fn committed_records(&self, app_map_id: &AppMapId) -> Option<Vec<Record>> {
        let attempt_id = self.committed_attempt(app_map_id)?;
        Some(
            self.attempts
                .get(&(app_map_id.clone(), attempt_id))
                .map(|d| d.records.clone())
                .unwrap_or_default(),
        )
    }

    /// Bytes received per partition for one attempt, committed or not.
    pub fn partition_bytes(&self, app_map_id: &AppMapId, attempt_id: i64) -> BTreeMap<u32, u64> {
        self.attempts
            .get(&(app_map_id.clone(), attempt_id))
            .map(|d| d.partition_bytes.clone())
            .unwrap_or_default()
    }

    pub fn total_bytes(&self) -> u64 {
        self.attempts.iter().map(|e| e.value().bytes()).sum()
    }
}

impl RecordSink for InMemoryRecordSink {
    // ---
    fn append(&self, app_map_id: &AppMapId, attempt_id: i64, records: Vec<Record>) -> Result<()> {
        // ---
        let mut data = self
            .attempts
            .entry((app_map_id.clone(), attempt_id))
            .or_default();
        for record in records {
            let len = (record.key.len() + record.value.len()) as u64;
            *data.partition_bytes.entry(record.partition).or_default() += len;
            data.records.push(record);
        }
        Ok(())
    }

    fn commit(&self, app_map_id: &AppMapId, attempt_id: i64) -> Result<()> {
        // ---
        let winner = *self.committed.entry(app_map_id.clone()).or_insert(attempt_id);
        if winner != attempt_id {
            tracing::warn!(
                %app_map_id,
                attempt_id,
                committed_attempt = winner,
                "map task already has a committed attempt; keeping the first",
            );
            return Ok(());
        }
        let bytes = self
            .attempts
            .get(&(app_map_id.clone(), attempt_id))
            .map(|d| d.bytes())
            .unwrap_or(0);
        tracing::debug!(%app_map_id, attempt_id, bytes, "attempt output published");
        Ok(())
    }

    fn drop_application(&self, app_id: &str) -> u64 {
        // ---
        let mut released = 0;
        self.attempts.retain(|(id, _), data| {
            if id.app_id == app_id {
                released += data.bytes();
                false
            } else {
                true
            }
        });
        self.committed.retain(|id, _| id.app_id != app_id);
        released
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
