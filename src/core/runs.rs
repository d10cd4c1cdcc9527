//! Registry of live and recently finished runs.
//!
//! The executor registers a run before scheduling its first batch and
//! updates it in place. Finished runs stay visible for a retention window,
//! after which they are purged lazily on the next registry access.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::RunError;
use crate::domain::{RunState, RunStatus};

/// Default time a finished run stays queryable
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Shared handle on a registered run
#[derive(Debug)]
pub struct RunHandle {
    state: RwLock<RunState>,
    finished_at: Mutex<Option<Instant>>,
}

impl RunHandle {
    fn new(state: RunState) -> Self {
        Self {
            state: RwLock::new(state),
            finished_at: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.state.read().run_id
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> RunState {
        self.state.read().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.state.read().status
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == RunStatus::Cancelled
    }

    /// Mutate the state under the write lock. The closure must not block.
    pub fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        let mut state = self.state.write();
        let was_running = state.is_running();
        let out = f(&mut state);
        if was_running && state.is_finished() {
            *self.finished_at.lock() = Some(Instant::now());
        }
        out
    }

    fn expired(&self, retention: Duration, now: Instant) -> bool {
        match *self.finished_at.lock() {
            Some(at) => now.duration_since(at) >= retention,
            None => false,
        }
    }
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFinished(RunStatus),
    NotFound,
}

/// All runs known to this process
#[derive(Debug)]
pub struct RunRegistry {
    retention: Duration,
    runs: Mutex<HashMap<Uuid, Arc<RunHandle>>>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl RunRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Register a new run and return its handle
    pub fn register(&self, state: RunState) -> Arc<RunHandle> {
        self.purge();
        let run_id = state.run_id;
        let handle = Arc::new(RunHandle::new(state));
        self.runs.lock().insert(run_id, handle.clone());
        debug!(%run_id, "Run registered");
        handle
    }

    pub fn handle(&self, run_id: Uuid) -> Option<Arc<RunHandle>> {
        self.purge();
        self.runs.lock().get(&run_id).cloned()
    }

    /// Snapshot of a run's state
    pub fn get(&self, run_id: Uuid) -> Option<RunState> {
        self.handle(run_id).map(|h| h.snapshot())
    }

    /// Snapshots of every retained run, newest first
    pub fn list(&self) -> Vec<RunState> {
        self.purge();
        let mut states: Vec<RunState> = self.runs.lock().values().map(|h| h.snapshot()).collect();
        states.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        states
    }

    /// Mark a running run cancelled. The executor stops scheduling at the
    /// next batch boundary and discards results still in flight.
    pub fn cancel(&self, run_id: Uuid) -> CancelOutcome {
        let Some(handle) = self.handle(run_id) else {
            return CancelOutcome::NotFound;
        };

        handle.update(|state| {
            if !state.is_running() {
                return CancelOutcome::AlreadyFinished(state.status);
            }
            state.finish(RunStatus::Cancelled, Some(RunError::Cancelled.summary()));
            info!(%run_id, "Run cancelled");
            CancelOutcome::Cancelled
        })
    }

    /// Drop finished runs older than the retention window
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|_, handle| !handle.expired(self.retention, now));
        let purged = before - runs.len();
        if purged > 0 {
            debug!(purged, "Purged finished runs");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, RunConstraints};

    fn state() -> RunState {
        RunState::new(Uuid::new_v4(), "test".to_string(), 3, RunConstraints::default())
    }

    #[test]
    fn test_cancel_running_run() {
        let registry = RunRegistry::default();
        let handle = registry.register(state());
        let run_id = handle.run_id();

        assert_eq!(registry.cancel(run_id), CancelOutcome::Cancelled);
        assert!(handle.is_cancelled());

        let snapshot = registry.get(run_id).unwrap();
        assert_eq!(snapshot.error.unwrap().kind, ErrorKind::Cancelled);

        assert_eq!(
            registry.cancel(run_id),
            CancelOutcome::AlreadyFinished(RunStatus::Cancelled)
        );
        assert_eq!(registry.cancel(Uuid::new_v4()), CancelOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_runs_purged_after_retention() {
        let registry = RunRegistry::new(Duration::from_secs(60));
        let finished = registry.register(state());
        let running = registry.register(state());

        finished.update(|s| s.finish(RunStatus::Completed, None));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(registry.purge(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(registry.get(finished.run_id()).is_none());
        assert!(registry.get(running.run_id()).is_some());
        assert_eq!(registry.len(), 1);
    }
}
