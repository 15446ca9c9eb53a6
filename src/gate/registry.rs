//! Process-wide gate registry.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use super::key::QuotaKey;
use super::quota::QuotaGate;
use super::rules::GateRules;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::store::CounterStore;

/// Hands out one shared [`QuotaGate`] per key, creating gates on first use
/// from the configured rules.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct GateRegistry<S: CounterStore + ?Sized> {
    store: Arc<S>,
    rules: GateRules,
    config: SyncConfig,
    gates: DashMap<QuotaKey, Arc<QuotaGate<S>>>,
}

impl<S: CounterStore + ?Sized> GateRegistry<S> {
    /// Create a registry with no gates built yet.
    pub fn new(store: Arc<S>, rules: GateRules, config: SyncConfig) -> Self {
        Self {
            store,
            rules,
            config,
            gates: DashMap::new(),
        }
    }

    /// Get the gate for `service`/`method`.
    ///
    /// Returns `Ok(None)` when no rule covers the endpoint, and an error when
    /// a gate is needed but cannot be constructed.
    pub async fn gate(&self, service: &str, method: &str) -> Result<Option<Arc<QuotaGate<S>>>> {
        let key = QuotaKey::new(service, method);
        if let Some(gate) = self.gates.get(&key) {
            return Ok(Some(gate.clone()));
        }

        let Some(limit) = self.rules.find_limit(service, method) else {
            trace!(key = %key, "No gate rule, endpoint unprotected");
            return Ok(None);
        };

        let gate = QuotaGate::new(key.clone(), self.store.clone(), limit, self.config.clone()).await?;

        // A concurrent caller may have built the same gate; keep the first.
        let gate = self
            .gates
            .entry(key)
            .or_insert_with(|| Arc::new(gate))
            .clone();
        Ok(Some(gate))
    }

    /// Admission check for `service`/`method`. Endpoints without a rule are
    /// admitted.
    pub async fn check(&self, service: &str, method: &str) -> Result<bool> {
        match self.gate(service, method).await? {
            Some(gate) => Ok(gate.can_pass().await),
            None => Ok(true),
        }
    }

    /// Build a gate for every method rule up front and return how many were
    /// built.
    ///
    /// Fails on inconsistent rules or on the first gate that cannot be
    /// constructed.
    pub async fn preload(&self) -> Result<usize> {
        self.rules.validate()?;

        let endpoints: Vec<(String, String)> = self
            .rules
            .method_rules()
            .map(|(service, method, _)| (service.to_string(), method.to_string()))
            .collect();

        let mut built = 0;
        for (service, method) in &endpoints {
            if self.gate(service, method).await?.is_some() {
                built += 1;
            }
        }

        debug!(gates = built, "Preloaded quota gates");
        Ok(built)
    }

    /// The rules this registry builds gates from.
    pub fn rules(&self) -> &GateRules {
        &self.rules
    }

    /// Get the number of gates built so far.
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuotaError;
    use crate::gate::{MethodRule, ServiceRules};
    use crate::store::MemoryCounterStore;

    const RULES: &str = r#"
service: payments
limit_per_window: 100
methods:
  - name: charge
    limit_per_window: 2
  - name: refund
    limit_per_window: 50
"#;

    fn registry() -> GateRegistry<MemoryCounterStore> {
        let config = SyncConfig {
            batch_size: 5,
            min_sync_interval_us: 0,
            ..SyncConfig::default()
        };
        GateRegistry::new(
            Arc::new(MemoryCounterStore::new()),
            GateRules::from_yaml(RULES).unwrap(),
            config,
        )
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let registry = registry();
        assert!(registry.is_empty());
        assert_eq!(registry.rules().find_limit("payments", "charge"), Some(2));
    }

    #[tokio::test]
    async fn test_gate_is_reused() {
        let registry = registry();

        let first = registry.gate("payments", "charge").await.unwrap().unwrap();
        let second = registry.gate("payments", "charge").await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(first.limit_per_window(), 2);
    }

    #[tokio::test]
    async fn test_service_default_applies() {
        let registry = registry();

        let gate = registry.gate("payments", "capture").await.unwrap().unwrap();
        assert_eq!(gate.limit_per_window(), 100);
    }

    #[tokio::test]
    async fn test_unmatched_endpoint_is_admitted() {
        let registry = registry();

        assert!(registry.gate("search", "query").await.unwrap().is_none());
        for _ in 0..100 {
            assert!(registry.check("search", "query").await.unwrap());
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_check_enforces_limit() {
        let registry = registry();

        // Limit 2 allows one synchronization per window: a single batch.
        let mut admitted = 0;
        for _ in 0..20 {
            if registry.check("payments", "charge").await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_preload_builds_method_gates() {
        let registry = registry();

        assert_eq!(registry.preload().await.unwrap(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_preload_rejects_misfiled_service() {
        let mut rules = GateRules::new();
        rules.services.insert(
            "pay".to_string(),
            ServiceRules {
                service: "payments".to_string(),
                limit_per_window: None,
                methods: vec![MethodRule {
                    name: "charge".to_string(),
                    limit_per_window: 5,
                }],
            },
        );
        let registry = GateRegistry::new(
            Arc::new(MemoryCounterStore::new()),
            rules,
            SyncConfig::default(),
        );

        let err = registry.preload().await.unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_preload_count_matches_built_gates() {
        let registry = registry();

        let built = registry.preload().await.unwrap();
        assert_eq!(built, registry.len());
        assert!(registry.gate("payments", "charge").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_batch_size_surfaces() {
        let config = SyncConfig {
            batch_size: 0,
            ..SyncConfig::default()
        };
        let registry = GateRegistry::new(
            Arc::new(MemoryCounterStore::new()),
            GateRules::from_yaml(RULES).unwrap(),
            config,
        );

        let err = registry.check("payments", "charge").await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidBatchSize(0)));
    }
}
