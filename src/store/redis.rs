//! Redis-backed counter store.
//!
//! Scripts are loaded with `SCRIPT LOAD` and run with `EVALSHA`, so the
//! windowed increment executes atomically on the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, Value};
use tracing::{debug, info};

use super::{CounterStore, ScriptHandle, StoreError};

/// A [`CounterStore`] talking to a Redis server.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    url: String,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("url", &self.url)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!(url = %url, "Connecting to redis counter store");

        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    /// The URL this store connected to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Turn an `EVALSHA` reply into a counter value.
fn decode_counter(value: Value) -> Result<i64, StoreError> {
    match value {
        Value::Int(count) => Ok(count),
        other => Err(StoreError::UnexpectedValue(format!("{:?}", other))),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn register_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        let mut conn = self.conn.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await?;

        debug!(sha = %sha, "Loaded script into redis");
        Ok(ScriptHandle::new(sha))
    }

    async fn execute(
        &self,
        handle: &ScriptHandle,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(handle.as_str()).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }

        let reply: Value = cmd.query_async(&mut conn).await.map_err(|e| {
            if e.kind() == ErrorKind::NoScriptError {
                StoreError::UnknownScript(handle.clone())
            } else {
                StoreError::Redis(e)
            }
        })?;

        decode_counter(reply)
    }

    async fn script_exists(&self, handles: &[ScriptHandle]) -> Result<Vec<bool>, StoreError> {
        let mut conn = self.conn.clone();
        let shas: Vec<&str> = handles.iter().map(ScriptHandle::as_str).collect();

        let exists: Vec<bool> = redis::cmd("SCRIPT")
            .arg("EXISTS")
            .arg(shas)
            .query_async(&mut conn)
            .await?;

        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WINDOW_INCREMENT_SCRIPT;

    #[test]
    fn test_decode_counter_integer() {
        assert_eq!(decode_counter(Value::Int(7)).unwrap(), 7);
    }

    #[test]
    fn test_decode_counter_rejects_other_replies() {
        let err = decode_counter(Value::Nil).unwrap_err();
        assert!(matches!(err, StoreError::UnexpectedValue(_)));

        let err = decode_counter(Value::SimpleString("7".to_string())).unwrap_err();
        assert!(matches!(err, StoreError::UnexpectedValue(_)));
    }

    #[tokio::test]
    #[ignore = "requires a redis server on 127.0.0.1:6379"]
    async fn test_redis_window_increment() {
        let store = RedisCounterStore::connect("redis://127.0.0.1:6379").await.unwrap();
        let handle = store.register_script(WINDOW_INCREMENT_SCRIPT).await.unwrap();
        let key = vec![format!("quotagate-test-{}", uuid::Uuid::new_v4())];

        assert_eq!(store.execute(&handle, &key, &[]).await.unwrap(), 1);
        assert_eq!(store.execute(&handle, &key, &[]).await.unwrap(), 2);
        assert_eq!(store.script_exists(&[handle]).await.unwrap(), vec![true]);

        let bogus = ScriptHandle::new("0000000000000000000000000000000000000000");
        let err = store.execute(&bogus, &key, &[]).await.unwrap_err();
        assert!(err.is_unknown_script());
    }
}
