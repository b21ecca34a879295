//! Registry of in-flight chat streams and their cancellation flags.
//!
//! Entries are strictly request-scoped: a stream registers itself on start
//! and the guard removes the entry when it drops, whichever way the stream
//! ends. The registry is injected into both the streaming coordinator and
//! the cancellation endpoint, so either side can be exercised alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::ApiError;

#[derive(Clone, Default)]
pub struct ActiveStreamRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl ActiveStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request id and returns the guard owning its lifetime.
    pub fn register(&self, request_id: &str) -> Result<StreamGuard, ApiError> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut map = self.inner.lock().map_err(ApiError::internal)?;
        map.insert(request_id.to_string(), flag.clone());

        Ok(StreamGuard {
            registry: self.clone(),
            request_id: request_id.to_string(),
            flag,
        })
    }

    /// Sets the cancellation flag for a running stream. Returns false when
    /// the id is unknown (already finished or never existed).
    pub fn request_cancellation(&self, request_id: &str) -> Result<bool, ApiError> {
        let map = self.inner.lock().map_err(ApiError::internal)?;
        match map.get(request_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    fn remove(&self, request_id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(request_id);
        }
    }
}

/// Removes the registry entry exactly once when dropped, on every exit path
/// of a stream including panics and early returns.
pub struct StreamGuard {
    registry: ActiveStreamRegistry,
    request_id: String,
    flag: Arc<AtomicBool>,
}

impl StreamGuard {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_unknown_request_returns_false() {
        let registry = ActiveStreamRegistry::new();
        assert!(!registry.request_cancellation("missing").unwrap());
    }

    #[test]
    fn cancel_sets_flag_on_registered_stream() {
        let registry = ActiveStreamRegistry::new();
        let guard = registry.register("r1").unwrap();

        assert!(!guard.is_cancelled());
        assert!(registry.request_cancellation("r1").unwrap());
        assert!(guard.is_cancelled());
    }

    #[test]
    fn guard_drop_removes_entry() {
        let registry = ActiveStreamRegistry::new();
        {
            let _guard = registry.register("r1").unwrap();
            assert_eq!(registry.active_count(), 1);
        }
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.request_cancellation("r1").unwrap());
    }

    #[test]
    fn entries_are_independent() {
        let registry = ActiveStreamRegistry::new();
        let g1 = registry.register("r1").unwrap();
        let g2 = registry.register("r2").unwrap();

        registry.request_cancellation("r2").unwrap();
        assert!(!g1.is_cancelled());
        assert!(g2.is_cancelled());
    }
}
