//! Error types for quotagate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for quotagate operations.
///
/// Construction of a [`QuotaGate`](crate::gate::QuotaGate) fails with one of
/// the `Invalid*`, `MissingStore` or `Registration` variants. Synchronization
/// problems never show up here; see [`SyncError`].
#[derive(Error, Debug)]
pub enum QuotaError {
    /// The gate key has an empty service name
    #[error("Invalid gate key: {0}")]
    InvalidKey(String),

    /// The per-window limit is not positive
    #[error("Invalid limit per window: {0} (must be positive)")]
    InvalidLimit(i64),

    /// The batch size is not positive
    #[error("Invalid batch size: {0} (must be positive)")]
    InvalidBatchSize(i64),

    /// No counter store was supplied to the builder
    #[error("No counter store configured")]
    MissingStore,

    /// The synchronization script could not be registered
    #[error("Failed to register synchronization script: {0}")]
    Registration(#[source] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration loading errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a synchronization attempt did not grant a new batch.
///
/// These are absorbed by the gate and turned into a denial.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The previous attempt was too recent
    #[error("synchronization throttled")]
    Throttled,

    /// The store call failed or returned something unusable
    #[error("counter store failure: {0}")]
    Store(#[from] StoreError),

    /// All instances together have used up this window
    #[error("window exhausted: count {count} >= limit {limit}")]
    OverLimit { count: i64, limit: i64 },
}

/// Result type alias for quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
