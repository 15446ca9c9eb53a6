//! Gate rules configuration and matching.
//!
//! Rules say which endpoints get a gate and with what per-window limit. A
//! method rule wins over its service's default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{QuotaError, Result};

/// A complete rule set covering several services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateRules {
    /// Map of service name to its rules
    #[serde(default)]
    pub services: HashMap<String, ServiceRules>,
}

/// Rules for a single service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceRules {
    /// The service name
    pub service: String,
    /// Limit for methods without their own rule
    #[serde(default)]
    pub limit_per_window: Option<i64>,
    /// Per-method rules
    #[serde(default)]
    pub methods: Vec<MethodRule>,
}

/// A per-method limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodRule {
    /// The method name
    pub name: String,
    /// Successful synchronizations allowed per window across all instances
    pub limit_per_window: i64,
}

impl GateRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading gate rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse gate rules: {}", e)))?;

        // Without a top-level `services` key the document is a single service
        let rules = if document.get("services").is_some() {
            serde_yaml::from_value(document)
                .map_err(|e| QuotaError::Config(format!("Failed to parse gate rules: {}", e)))?
        } else {
            let service: ServiceRules = serde_yaml::from_value(document).map_err(|e| {
                QuotaError::Config(format!("Failed to parse service rules: {}", e))
            })?;
            let mut rules = GateRules::new();
            rules.services.insert(service.service.clone(), service);
            rules
        };

        rules.validate()?;
        Ok(rules)
    }

    /// Check that every service is named after its entry and every limit is
    /// positive.
    pub fn validate(&self) -> Result<()> {
        for (name, service) in &self.services {
            if service.service.is_empty() {
                return Err(QuotaError::Config(format!(
                    "service entry {:?} has an empty name",
                    name
                )));
            }
            if service.service != *name {
                return Err(QuotaError::Config(format!(
                    "service entry {:?} declares service {:?}",
                    name, service.service
                )));
            }
            if let Some(limit) = service.limit_per_window {
                if limit <= 0 {
                    return Err(QuotaError::InvalidLimit(limit));
                }
            }
            for method in &service.methods {
                if method.limit_per_window <= 0 {
                    return Err(QuotaError::InvalidLimit(method.limit_per_window));
                }
            }
        }
        Ok(())
    }

    /// Get the rules for a specific service.
    pub fn get_service(&self, service: &str) -> Option<&ServiceRules> {
        self.services.get(service)
    }

    /// Find the limit that applies to `service`/`method`.
    pub fn find_limit(&self, service: &str, method: &str) -> Option<i64> {
        self.get_service(service)?.find_limit(method)
    }

    /// Every explicitly listed (service, method, limit).
    pub fn method_rules(&self) -> impl Iterator<Item = (&str, &str, i64)> {
        self.services.values().flat_map(|s| {
            s.methods
                .iter()
                .map(move |m| (s.service.as_str(), m.name.as_str(), m.limit_per_window))
        })
    }
}

impl ServiceRules {
    /// Find the limit for a method of this service.
    pub fn find_limit(&self, method: &str) -> Option<i64> {
        self.methods
            .iter()
            .find(|m| m.name == method)
            .map(|m| m.limit_per_window)
            .or(self.limit_per_window)
    }
}
