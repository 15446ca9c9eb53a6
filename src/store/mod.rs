//! Shared counter store abstraction.
//!
//! A gate only ever talks to its store through [`CounterStore`]: register a
//! script once, run it by handle, and ask whether the handle is still known.

mod memory;
mod redis;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

use async_trait::async_trait;
use thiserror::Error;

/// Atomic windowed increment executed by the store.
///
/// Increments `KEYS[1]`; the first increment of a window arms a one second
/// expiry. Returns the post-increment count.
pub const WINDOW_INCREMENT_SCRIPT: &str = r#"
local count = redis.call("INCR", KEYS[1])
if tonumber(count) == 1 then
    redis.call("EXPIRE", KEYS[1], 1)
end
return count
"#;

/// Opaque handle for a script registered with a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors reported by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store does not recognise the script handle (evicted or restarted)
    #[error("unknown script handle {0}")]
    UnknownScript(ScriptHandle),

    /// The script returned something other than an integer
    #[error("unexpected counter value: {0}")]
    UnexpectedValue(String),

    /// The request itself was malformed
    #[error("invalid store request: {0}")]
    InvalidRequest(String),

    /// Redis client errors
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl StoreError {
    /// Whether this error means the script has to be registered again.
    pub fn is_unknown_script(&self) -> bool {
        matches!(self, StoreError::UnknownScript(_))
    }
}

/// Trait for shared counter stores.
///
/// Implementations must run the registered script atomically with respect to
/// every other caller of the same key, across processes.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Register a script and return a handle usable by [`execute`](Self::execute).
    ///
    /// Registering the same source twice yields an equivalent handle.
    async fn register_script(&self, source: &str) -> Result<ScriptHandle, StoreError>;

    /// Run a registered script against `keys` and return its integer reply.
    async fn execute(
        &self,
        handle: &ScriptHandle,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError>;

    /// Report, per handle, whether it is currently registered.
    async fn script_exists(&self, handles: &[ScriptHandle]) -> Result<Vec<bool>, StoreError>;
}
