//! Filesystem observers
//!
//! One observer per replica keeps a live [`Snapshot`] current: the local one
//! from OS file events, the remote one from the change feed. The pipeline
//! never reads the live values directly; the supervisor freezes copies at the
//! start of each pass.

pub mod local;
pub mod remote;

use std::sync::{Arc, Mutex};

use pairdrive_core::domain::{NodeId, ReplicaSide, Snapshot};

/// Live snapshot shared between an observer and the supervisor
///
/// The mutex guards every access; freezing takes the lock, deep-copies and
/// releases, so observers stall only for the copy.
#[derive(Clone)]
pub struct SharedSnapshot {
    inner: Arc<Mutex<Snapshot>>,
}

impl SharedSnapshot {
    pub fn new(side: ReplicaSide, root_id: NodeId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Snapshot::new(side, root_id))),
        }
    }

    /// Frozen copy for one pass.
    pub fn freeze(&self) -> Snapshot {
        self.inner.lock().expect("snapshot lock poisoned").clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().expect("snapshot lock poisoned").revision()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().expect("snapshot lock poisoned").is_valid()
    }

    pub fn invalidate(&self) {
        self.inner
            .lock()
            .expect("snapshot lock poisoned")
            .invalidate();
    }

    /// Runs a mutation under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        let mut guard = self.inner.lock().expect("snapshot lock poisoned");
        f(&mut guard)
    }
}
