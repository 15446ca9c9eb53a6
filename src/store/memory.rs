//! In-process counter store.
//!
//! Gives a single process the same windowed-increment semantics the shared
//! store provides, including script handles that can be flushed to mimic a
//! store restart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::{CounterStore, ScriptHandle, StoreError};

/// Lifetime of a window counter after its first increment.
const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// A windowed counter that expires a fixed time after its first increment.
#[derive(Debug)]
struct WindowCounter {
    value: i64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct ScriptRegistry {
    by_source: HashMap<String, ScriptHandle>,
    by_handle: HashMap<ScriptHandle, String>,
}

/// A [`CounterStore`] kept entirely in memory.
///
/// Every registered script is evaluated as the windowed increment: the first
/// increment of a key arms its expiry, and the key is gone once that expiry
/// passes.
#[derive(Debug)]
pub struct MemoryCounterStore {
    scripts: RwLock<ScriptRegistry>,
    counters: Mutex<HashMap<String, WindowCounter>>,
    window: Duration,
}

impl MemoryCounterStore {
    /// Create a store with one second windows.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Create a store with a custom window length.
    pub fn with_window(window: Duration) -> Self {
        Self {
            scripts: RwLock::new(ScriptRegistry::default()),
            counters: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Drop every registered script, as a store restart would.
    pub fn flush_scripts(&self) {
        let mut scripts = self.scripts.write();
        debug!(count = scripts.by_handle.len(), "Flushing registered scripts");
        scripts.by_source.clear();
        scripts.by_handle.clear();
    }

    /// Current value of a window counter, if it has not expired.
    pub fn counter_value(&self, key: &str) -> Option<i64> {
        let counters = self.counters.lock();
        counters
            .get(key)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.value)
    }

    /// Number of keys currently held, expired ones included until the next
    /// increment evicts them.
    pub fn key_count(&self) -> usize {
        self.counters.lock().len()
    }

    /// Number of registered scripts.
    pub fn script_count(&self) -> usize {
        self.scripts.read().by_handle.len()
    }

    fn increment(&self, key: &str) -> i64 {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        counters.retain(|k, c| c.expires_at > now || k == key);

        let counter = counters.entry(key.to_string()).or_insert(WindowCounter {
            value: 0,
            expires_at: now,
        });
        if counter.expires_at <= now {
            counter.value = 0;
        }

        counter.value += 1;
        if counter.value == 1 {
            counter.expires_at = now + self.window;
        }

        trace!(key = %key, value = counter.value, "Incremented window counter");
        counter.value
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn register_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        let mut scripts = self.scripts.write();
        if let Some(handle) = scripts.by_source.get(source) {
            return Ok(handle.clone());
        }

        let handle = ScriptHandle::new(uuid::Uuid::new_v4().simple().to_string());
        scripts.by_source.insert(source.to_string(), handle.clone());
        scripts.by_handle.insert(handle.clone(), source.to_string());
        debug!(handle = %handle, "Registered script");
        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &ScriptHandle,
        keys: &[String],
        _args: &[String],
    ) -> Result<i64, StoreError> {
        if !self.scripts.read().by_handle.contains_key(handle) {
            return Err(StoreError::UnknownScript(handle.clone()));
        }

        let key = match keys {
            [key] => key,
            _ => {
                return Err(StoreError::InvalidRequest(format!(
                    "expected exactly one key, got {}",
                    keys.len()
                )))
            }
        };

        Ok(self.increment(key))
    }

    async fn script_exists(&self, handles: &[ScriptHandle]) -> Result<Vec<bool>, StoreError> {
        let scripts = self.scripts.read();
        Ok(handles
            .iter()
            .map(|h| scripts.by_handle.contains_key(h))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WINDOW_INCREMENT_SCRIPT;

    fn keys(key: &str) -> Vec<String> {
        vec![key.to_string()]
    }

    #[tokio::test]
    async fn test_register_script_is_idempotent() {
        let store = MemoryCounterStore::new();

        let first = store.register_script(WINDOW_INCREMENT_SCRIPT).await.unwrap();
        let second = store.register_script(WINDOW_INCREMENT_SCRIPT).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.script_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_increments() {
        let store = MemoryCounterStore::new();
        let handle = store.register_script(WINDOW_INCREMENT_SCRIPT).await.unwrap();

        assert_eq!(store.execute(&handle, &keys("a"), &[]).await.unwrap(), 1);
        assert_eq!(store.execute(&handle, &keys("a"), &[]).await.unwrap(), 2);
        assert_eq!(store.execute(&handle, &keys("b"), &[]).await.unwrap(), 1);
        assert_eq!(store.counter_value("a"), Some(2));
    }

    #[tokio::test]
    async fn test_window_expires() {
        let store = MemoryCounterStore::with_window(Duration::from_millis(50));
        let handle = store.register_script(WINDOW_INCREMENT_SCRIPT).await.unwrap();

        store.execute(&handle, &keys("a"), &[]).await.unwrap();
        store.execute(&handle, &keys("a"), &[]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.counter_value("a"), None);
        assert_eq!(store.execute(&handle, &keys("a"), &[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_keys_are_evicted() {
        let store = MemoryCounterStore::with_window(Duration::from_millis(50));
        let handle = store.register_script(WINDOW_INCREMENT_SCRIPT).await.unwrap();

        store.execute(&handle, &keys("a"), &[]).await.unwrap();
        store.execute(&handle, &keys("b"), &[]).await.unwrap();
        assert_eq!(store.key_count(), 2);

        tokio::time::sleep(Duration::from_millis(80)).await;

        store.execute(&handle, &keys("c"), &[]).await.unwrap();
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.counter_value("c"), Some(1));
    }

    #[tokio::test]
    async fn test_flush_makes_handle_unknown() {
        let store = MemoryCounterStore::new();
        let handle = store.register_script(WINDOW_INCREMENT_SCRIPT).await.unwrap();

        store.flush_scripts();

        let err = store.execute(&handle, &keys("a"), &[]).await.unwrap_err();
        assert!(err.is_unknown_script());
        assert_eq!(store.script_exists(&[handle]).await.unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_execute_rejects_wrong_key_count() {
        let store = MemoryCounterStore::new();
        let handle = store.register_script(WINDOW_INCREMENT_SCRIPT).await.unwrap();

        let err = store.execute(&handle, &[], &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }
}
