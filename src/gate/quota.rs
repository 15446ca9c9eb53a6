//! Core admission gate implementation.
//!
//! A gate hands out admissions from a local batch of tokens. When the batch
//! runs dry it asks the shared counter store for another one; the store's
//! window counter caps how many batches all instances together may take per
//! second.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::key::QuotaKey;
use crate::config::SyncConfig;
use crate::error::{QuotaError, Result, SyncError};
use crate::store::{CounterStore, ScriptHandle, StoreError, WINDOW_INCREMENT_SCRIPT};

/// State that only the synchronizing caller touches.
struct SyncState {
    /// Handle of the registered window script
    script: ScriptHandle,
    /// When the store was last contacted, successful or not
    last_sync_at: Option<Instant>,
}

/// Admission gate for a single (service, method) key.
///
/// Local admissions are a compare-and-swap on the token count. Only callers
/// that find the batch empty queue on the synchronization lock, which is held
/// across the store round-trip.
pub struct QuotaGate<S: CounterStore + ?Sized> {
    key: QuotaKey,
    /// `[key.storage_key()]`, as passed to the store
    store_keys: Vec<String>,
    limit_per_window: i64,
    config: SyncConfig,
    store: Arc<S>,
    local_tokens: AtomicI64,
    sync: Mutex<SyncState>,
}

impl<S: CounterStore + ?Sized> std::fmt::Debug for QuotaGate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGate")
            .field("key", &self.key)
            .field("limit_per_window", &self.limit_per_window)
            .field("local_tokens", &self.local_tokens())
            .field("config", &self.config)
            .finish()
    }
}

/// Builder for [`QuotaGate`].
pub struct QuotaGateBuilder<S: CounterStore + ?Sized> {
    key: QuotaKey,
    limit_per_window: i64,
    config: SyncConfig,
    store: Option<Arc<S>>,
}

impl<S: CounterStore + ?Sized> QuotaGateBuilder<S> {
    /// Maximum successful synchronizations per window across all instances.
    pub fn limit_per_window(mut self, limit: i64) -> Self {
        self.limit_per_window = limit;
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the settings and register the window script with the store.
    ///
    /// Registration is attempted once; a store that cannot take it now is
    /// reported as an error and no gate is created.
    pub async fn build(self) -> Result<QuotaGate<S>> {
        if !self.key.is_valid() {
            return Err(QuotaError::InvalidKey(format!(
                "service name is empty (method {:?})",
                self.key.method
            )));
        }
        if self.limit_per_window <= 0 {
            return Err(QuotaError::InvalidLimit(self.limit_per_window));
        }
        if self.config.batch_size <= 0 {
            return Err(QuotaError::InvalidBatchSize(self.config.batch_size));
        }
        let store = self.store.ok_or(QuotaError::MissingStore)?;

        let script = register_script(&*store, 1, Duration::ZERO)
            .await
            .map_err(|e| {
                warn!(key = %self.key, error = %e, "Failed to create quota gate");
                QuotaError::Registration(e)
            })?;

        info!(
            key = %self.key,
            limit_per_window = self.limit_per_window,
            batch_size = self.config.batch_size,
            script = %script,
            "Quota gate created"
        );

        Ok(QuotaGate {
            store_keys: vec![self.key.storage_key()],
            key: self.key,
            limit_per_window: self.limit_per_window,
            config: self.config,
            store,
            local_tokens: AtomicI64::new(0),
            sync: Mutex::new(SyncState {
                script,
                last_sync_at: None,
            }),
        })
    }
}

impl<S: CounterStore + ?Sized> QuotaGate<S> {
    /// Start building a gate for `service`/`method`.
    pub fn builder(service: &str, method: &str) -> QuotaGateBuilder<S> {
        QuotaGateBuilder {
            key: QuotaKey::new(service, method),
            limit_per_window: 0,
            config: SyncConfig::default(),
            store: None,
        }
    }

    /// Create a gate in one call.
    pub async fn new(
        key: QuotaKey,
        store: Arc<S>,
        limit_per_window: i64,
        config: SyncConfig,
    ) -> Result<Self> {
        QuotaGateBuilder {
            key,
            limit_per_window,
            config,
            store: Some(store),
        }
        .build()
        .await
    }

    /// Decide whether the current call may proceed.
    ///
    /// Each successful synchronization admits exactly `batch_size` calls,
    /// the synchronizing call included. A new gate starts with an empty batch,
    /// so its first call synchronizes. Never returns an error: any failure to
    /// obtain a new batch denies.
    pub async fn can_pass(&self) -> bool {
        if self.take_local_token() {
            trace!(key = %self.key, "Admitted from local batch");
            return true;
        }

        let mut state = self.sync.lock().await;

        // Someone may have refilled the batch while we waited.
        if self.take_local_token() {
            trace!(key = %self.key, "Admitted from refilled batch");
            return true;
        }

        match self.try_synchronize(&mut state).await {
            Ok(count) => {
                // Tokens are zero here and only the lock holder raises them.
                self.local_tokens
                    .store(self.config.batch_size - 1, Ordering::Release);
                debug!(
                    key = %self.key,
                    window_count = count,
                    limit = self.limit_per_window,
                    "Synchronized, local batch refilled"
                );
                true
            }
            Err(SyncError::Throttled) => {
                trace!(key = %self.key, "Denied, synchronization throttled");
                false
            }
            Err(err) => {
                debug!(key = %self.key, error = %err, "Denied, synchronization failed");
                false
            }
        }
    }

    /// The key this gate protects.
    pub fn key(&self) -> &QuotaKey {
        &self.key
    }

    pub fn limit_per_window(&self) -> i64 {
        self.limit_per_window
    }

    pub fn batch_size(&self) -> i64 {
        self.config.batch_size
    }

    /// Admissions left in the local batch.
    pub fn local_tokens(&self) -> i64 {
        self.local_tokens.load(Ordering::Acquire)
    }

    fn take_local_token(&self) -> bool {
        self.local_tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                (tokens > 0).then(|| tokens - 1)
            })
            .is_ok()
    }

    /// Ask the store for a new batch. Returns the window count on success.
    async fn try_synchronize(&self, state: &mut SyncState) -> std::result::Result<i64, SyncError> {
        let now = Instant::now();
        if let Some(last) = state.last_sync_at {
            if now.duration_since(last) < self.config.min_sync_interval() {
                return Err(SyncError::Throttled);
            }
        }
        state.last_sync_at = Some(now);

        let count = self.increment_window(state).await?;
        if count >= self.limit_per_window {
            return Err(SyncError::OverLimit {
                count,
                limit: self.limit_per_window,
            });
        }

        Ok(count)
    }

    /// Run the window script, re-registering it once if the store lost it.
    async fn increment_window(&self, state: &mut SyncState) -> std::result::Result<i64, StoreError> {
        match self.store.execute(&state.script, &self.store_keys, &[]).await {
            Err(err) if err.is_unknown_script() => {
                let exists = self
                    .store
                    .script_exists(std::slice::from_ref(&state.script))
                    .await?;
                if exists.first().copied().unwrap_or(false) {
                    return Err(err);
                }

                info!(key = %self.key, script = %state.script, "Script missing from store, re-registering");
                state.script = register_script(
                    &*self.store,
                    self.config.registration_retries,
                    self.config.registration_backoff(),
                )
                .await?;

                self.store.execute(&state.script, &self.store_keys, &[]).await
            }
            result => result,
        }
    }
}

/// Register the window script, making up to `attempts` tries.
async fn register_script<S: CounterStore + ?Sized>(
    store: &S,
    attempts: u32,
    backoff: Duration,
) -> std::result::Result<ScriptHandle, StoreError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match store.register_script(WINDOW_INCREMENT_SCRIPT).await {
            Ok(handle) => return Ok(handle),
            Err(err) if attempt < attempts => {
                warn!(attempt, attempts, error = %err, "Script registration failed, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
