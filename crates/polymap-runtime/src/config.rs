use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

/// How the transaction guard treats calls that need a unit of work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionAttribute {
    /// Join an active unit of work or start one.
    Required,
    /// Always start a nested unit of work.
    RequiresNew,
    /// Fail with `NoTransaction` when no unit of work is active.
    #[default]
    Mandatory,
}

/// Lifetime of the instance caches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheScope {
    /// Caches are cleared when the outermost explicit transaction ends.
    #[default]
    Transaction,
    /// Caches survive commits and are cleared on rollback and session close.
    Session,
}

/// Configuration shared by every session of a factory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub transaction_attribute: TransactionAttribute,
    pub cache_scope: CacheScope,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> RuntimeResult<Self> {
        serde_json::from_str(json).map_err(|e| RuntimeError::Configuration(e.to_string()))
    }

    pub fn with_transaction_attribute(mut self, attribute: TransactionAttribute) -> Self {
        self.transaction_attribute = attribute;
        self
    }

    pub fn with_cache_scope(mut self, scope: CacheScope) -> Self {
        self.cache_scope = scope;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.transaction_attribute, TransactionAttribute::Mandatory);
        assert_eq!(config.cache_scope, CacheScope::Transaction);
    }

    #[test]
    fn parses_partial_json() {
        let config =
            RuntimeConfig::from_json(r#"{"transaction_attribute": "REQUIRES_NEW"}"#).unwrap();
        assert_eq!(config.transaction_attribute, TransactionAttribute::RequiresNew);
        assert_eq!(config.cache_scope, CacheScope::Transaction);

        let config = RuntimeConfig::from_json(r#"{"cache_scope": "SESSION"}"#).unwrap();
        assert_eq!(config.cache_scope, CacheScope::Session);
    }

    #[test]
    fn rejects_unknown_attribute() {
        let err =
            RuntimeConfig::from_json(r#"{"transaction_attribute": "SOMETIMES"}"#).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }

    #[test]
    fn serializes_screaming_case() {
        let config =
            RuntimeConfig::default().with_transaction_attribute(TransactionAttribute::Required);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"transaction_attribute":"REQUIRED","cache_scope":"TRANSACTION"}"#);
    }
}
