//! Active task registry: in-flight process handles and mass cancellation.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Tracks the cancellation handle of every in-flight external process.
///
/// Registration and removal are point operations; [`abort_all`] is the sole
/// mass-cancellation path and leaves the registry empty.
///
/// [`abort_all`]: ActiveTaskRegistry::abort_all
#[derive(Default)]
pub struct ActiveTaskRegistry {
    handles: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl ActiveTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, handle: CancellationToken) {
        self.handles.lock().insert(id, handle);
    }

    pub fn unregister(&self, id: &Uuid) {
        self.handles.lock().remove(id);
    }

    /// Cancel every registered handle and clear the set. Returns the number
    /// of handles that received a termination signal.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<(Uuid, CancellationToken)> = {
            let mut handles = self.handles.lock();
            handles.drain().collect()
        };
        for (id, token) in &drained {
            debug!(task = %id, "terminating in-flight task");
            token.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "aborted all in-flight tasks");
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}
