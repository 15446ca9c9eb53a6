//! Quotagate - Shared-Quota Admission Gate
//!
//! This crate implements a per-process admission gate for (service, method)
//! endpoints. Each process admits calls from a small local batch of tokens and
//! refills it through an atomic windowed counter in a shared store, which keeps
//! the aggregate rate of all processes under a configured ceiling.

pub mod config;
pub mod error;
pub mod gate;
pub mod store;

pub use error::{QuotaError, Result};
pub use gate::{GateRegistry, QuotaGate, QuotaKey};
pub use store::{CounterStore, MemoryCounterStore, RedisCounterStore};
