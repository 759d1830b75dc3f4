//! Per-endpoint single-flight locking.
//!
//! Each in-flight mutation owns its `<bucket>/<path>` key; a second mutation
//! on the same key is rejected with a conflict instead of queueing. The
//! guard releases the key on every exit path, including panics and task
//! cancellation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::errors::{HubError, HubResult};

#[derive(Clone, Default)]
pub struct EndpointLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

/// Release handle; dropping it frees the endpoint key.
#[derive(Debug)]
pub struct EndpointGuard {
    key: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl EndpointLocks {
    pub fn new() -> Self {
        EndpointLocks::default()
    }

    pub fn try_acquire(&self, bucket_address: &str, path: &str) -> HubResult<EndpointGuard> {
        let key = format!("{bucket_address}/{path}");
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.clone()) {
            return Err(HubError::Conflict(format!(
                "concurrent operation in progress on {key}"
            )));
        }
        Ok(EndpointGuard {
            key,
            active: Arc::clone(&self.active),
        })
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.key);
    }
}
