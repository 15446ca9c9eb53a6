//! Gate key generation and handling.

/// Prefix of every storage key written by a gate.
const STORAGE_PREFIX: &str = "quota|";

/// A key that identifies the endpoint a gate protects.
///
/// The storage form length-prefixes the service name, so a `|` inside either
/// component cannot make two different pairs share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    /// The service name
    pub service: String,
    /// The method name (empty for a whole-service gate)
    pub method: String,
}

impl QuotaKey {
    /// Create a new key from a service and method name.
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
        }
    }

    /// Whether the key can back a gate.
    pub fn is_valid(&self) -> bool {
        !self.service.is_empty()
    }

    /// Convert to the key used in the counter store.
    /// Format: "quota|{service byte length}|{service}|{method}"
    pub fn storage_key(&self) -> String {
        format!(
            "{}{}|{}|{}",
            STORAGE_PREFIX,
            self.service.len(),
            self.service,
            self.method
        )
    }

    /// Parse from a storage key.
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(STORAGE_PREFIX)?;

        let (len, rest) = rest.split_once('|')?;
        let len: usize = len.parse().ok()?;

        let service = rest.get(..len)?;
        let method = rest.get(len..)?.strip_prefix('|')?;

        Some(Self::new(service, method))
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key() {
        let key = QuotaKey::new("payments", "charge");
        assert_eq!(key.storage_key(), "quota|8|payments|charge");

        let parsed = QuotaKey::from_storage_key(&key.storage_key()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_separator_in_names_does_not_collide() {
        let a = QuotaKey::new("a|b", "c");
        let b = QuotaKey::new("a", "b|c");

        assert_ne!(a.storage_key(), b.storage_key());
        assert_eq!(QuotaKey::from_storage_key(&a.storage_key()).unwrap(), a);
        assert_eq!(QuotaKey::from_storage_key(&b.storage_key()).unwrap(), b);
    }

    #[test]
    fn test_empty_method() {
        let key = QuotaKey::new("payments", "");
        assert!(key.is_valid());
        assert_eq!(QuotaKey::from_storage_key(&key.storage_key()).unwrap(), key);
    }

    #[test]
    fn test_empty_service_is_invalid() {
        assert!(!QuotaKey::new("", "charge").is_valid());
    }

    #[test]
    fn test_storage_key_parsing_invalid() {
        assert!(QuotaKey::from_storage_key("invalid").is_none());
        assert!(QuotaKey::from_storage_key("quota|x|svc|m").is_none());
        assert!(QuotaKey::from_storage_key("quota|10|svc|m").is_none());
        assert!(QuotaKey::from_storage_key("counter|3|svc|m").is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(QuotaKey::new("svc", "m").to_string(), "svc/m");
    }
}
