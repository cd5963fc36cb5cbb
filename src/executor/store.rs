//! In-memory execution records.
//!
//! The store is the process-local registry of every execution the
//! orchestrator has driven since startup. Records are mutated at exactly two
//! points in their life (entering `running`, entering a terminal state) and
//! terminal states are sticky: once a record is finished it never changes
//! again, whatever a caller asks for.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;

/// Retained-record ceiling when not configured otherwise.
pub const DEFAULT_RECORD_CAPACITY: usize = 100;

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// Admitted, worker not yet started. Observable only briefly.
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// One execution record.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub program_id: String,
    pub status: ExecutionState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: String,
    pub error: String,
    pub exit_code: Option<i64>,
}

impl Execution {
    pub fn new(execution_id: Uuid, program_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            program_id: program_id.into(),
            status: ExecutionState::Queued,
            start_time: Utc::now(),
            end_time: None,
            output: String::new(),
            error: String::new(),
            exit_code: None,
        }
    }
}

/// Thread-safe registry of execution records keyed by execution id.
pub struct ExecutionStore {
    records: RwLock<HashMap<Uuid, Execution>>,
    capacity: usize,
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new(DEFAULT_RECORD_CAPACITY)
    }
}

impl ExecutionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Insert a fresh record, rejecting duplicate ids. When the store is at
    /// capacity, the oldest terminal records are evicted first; non-terminal
    /// records are never evicted.
    pub fn insert(&self, record: Execution) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("store lock poisoned");
        if records.contains_key(&record.execution_id) {
            return Err(StoreError::DuplicateExecution(record.execution_id));
        }

        if records.len() >= self.capacity {
            let mut finished: Vec<(Uuid, DateTime<Utc>)> = records
                .values()
                .filter(|e| e.status.is_terminal())
                .map(|e| (e.execution_id, e.start_time))
                .collect();
            finished.sort_by_key(|(_, started)| *started);

            let excess = records.len() + 1 - self.capacity;
            for (id, _) in finished.into_iter().take(excess) {
                records.remove(&id);
                tracing::debug!(execution_id = %id, "evicted old execution record");
            }
        }

        records.insert(record.execution_id, record);
        Ok(())
    }

    /// Apply `mutate` to a record. Terminal records are left untouched.
    pub fn update(
        &self,
        execution_id: Uuid,
        mutate: impl FnOnce(&mut Execution),
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("store lock poisoned");
        let record = records
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        if record.status.is_terminal() {
            tracing::warn!(
                execution_id = %execution_id,
                status = %record.status,
                "ignoring update to terminal execution"
            );
            return Ok(());
        }
        mutate(record);
        Ok(())
    }

    pub fn get(&self, execution_id: Uuid) -> Option<Execution> {
        self.records
            .read()
            .expect("store lock poisoned")
            .get(&execution_id)
            .cloned()
    }

    /// Snapshot of all records, newest first.
    pub fn list(&self) -> Vec<Execution> {
        let mut all: Vec<Execution> = self
            .records
            .read()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all
    }

    /// Snapshot of records currently in `running`.
    pub fn running(&self) -> Vec<Execution> {
        self.records
            .read()
            .expect("store lock poisoned")
            .values()
            .filter(|e| e.status == ExecutionState::Running)
            .cloned()
            .collect()
    }

    /// Remove terminal records matching `predicate`; returns how many went.
    /// Non-terminal records are never pruned.
    pub fn prune(&self, predicate: impl Fn(&Execution) -> bool) -> usize {
        let mut records = self.records.write().expect("store lock poisoned");
        let doomed: Vec<Uuid> = records
            .values()
            .filter(|e| e.status.is_terminal() && predicate(e))
            .map(|e| e.execution_id)
            .collect();
        for id in &doomed {
            records.remove(id);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
