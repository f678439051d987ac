use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::backlog::Backlog;

/// Removal request handed off by a backlog's `delete`; consumed serially by
/// the engine's removal task.
#[derive(Debug, Clone)]
pub struct RemovalMsg {
    pub id: String,
    pub conn_id: u64,
}

/// The set of live backlogs. Dispatch and reaper scans run against a
/// snapshot taken under the read lock; only insert and remove take the
/// write lock.
#[derive(Default)]
pub struct BacklogRegistry {
    backlogs: RwLock<Vec<Arc<Backlog>>>,
}

#[derive(Serialize)]
struct RegistrySnapshot<'a> {
    backlogs: &'a Vec<Arc<Backlog>>,
}

impl BacklogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Arc<Backlog>> {
        let r = self.backlogs.read();
        r.clone()
    }

    pub fn insert(&self, backlog: Arc<Backlog>) {
        // a backlog can complete during creation, before ever landing here;
        // its removal request has already been consumed as a no-op
        if !backlog.is_running() {
            debug!(backlog.id, "not inserting an already stopped backlog");
            return;
        }
        let mut w = self.backlogs.write();
        w.push(backlog);
    }

    /// Removes by ID, order not preserved. Absent IDs are a no-op.
    pub fn remove(&self, id: &str) {
        let mut w = self.backlogs.write();
        if let Some(idx) = w.iter().position(|b| b.id == id) {
            w.swap_remove(idx);
            debug!(backlog.id = id, "backlog removed, {} left", w.len());
        }
    }

    pub fn len(&self) -> usize {
        let r = self.backlogs.read();
        r.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diagnostic view of all live backlogs.
    pub fn snapshot_json(&self) -> Result<String> {
        let r = self.backlogs.read();
        let s = serde_json::to_string(&RegistrySnapshot { backlogs: &r })?;
        Ok(s)
    }
}
