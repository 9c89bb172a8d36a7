//! Job and operation records kept by the retention logs.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Record types that age out of a time-bounded log.
pub trait LogEntry {
    /// Timestamp (epoch ms) the expiry sweep compares against its cutoff.
    fn logged_at_ms(&self) -> i64;
}

/// Stable identifier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Operation ids are only unique within their job.
pub type OperationId = u32;

/// Identity of an operation: its id is meaningless without the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub op_id: OperationId,
    pub job_id: JobId,
}

impl OperationKey {
    #[must_use]
    pub const fn new(op_id: OperationId, job_id: JobId) -> Self {
        Self { op_id, job_id }
    }
}

/// One executed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub statement: String,
    pub started_ms: i64,
    pub ended_ms: Option<i64>,
    pub error: Option<String>,
}

impl JobRecord {
    #[must_use]
    pub fn started(id: JobId, statement: impl Into<String>, started_ms: i64) -> Self {
        Self {
            id,
            statement: statement.into(),
            started_ms,
            ended_ms: None,
            error: None,
        }
    }

    /// Set the completion fields.
    pub fn finish(&mut self, ended_ms: i64, error: Option<String>) {
        self.ended_ms = Some(ended_ms);
        self.error = error;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ended_ms.is_some()
    }
}

impl LogEntry for JobRecord {
    fn logged_at_ms(&self) -> i64 {
        self.ended_ms.unwrap_or(self.started_ms)
    }
}

/// One sub-step of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op_id: OperationId,
    pub job_id: JobId,
    pub name: String,
    pub started_ms: i64,
    pub ended_ms: Option<i64>,
    pub error: Option<String>,
    pub rows: Option<u64>,
}

impl OperationRecord {
    #[must_use]
    pub fn started(key: OperationKey, name: impl Into<String>, started_ms: i64) -> Self {
        Self {
            op_id: key.op_id,
            job_id: key.job_id,
            name: name.into(),
            started_ms,
            ended_ms: None,
            error: None,
            rows: None,
        }
    }

    #[must_use]
    pub const fn key(&self) -> OperationKey {
        OperationKey::new(self.op_id, self.job_id)
    }

    /// Set the completion fields.
    pub fn finish(&mut self, ended_ms: i64, error: Option<String>, rows: Option<u64>) {
        self.ended_ms = Some(ended_ms);
        self.error = error;
        self.rows = rows;
    }
}

impl LogEntry for OperationRecord {
    fn logged_at_ms(&self) -> i64 {
        self.ended_ms.unwrap_or(self.started_ms)
    }
}
