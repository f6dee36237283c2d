//! Cache key definitions

use std::fmt;

use crate::types::AggregateKey;

const PREFIX: &str = "recent_quantity";

/// Cache key for a sliding-window aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: AggregateKey,
}

impl CacheKey {
    pub fn new(scope: AggregateKey) -> Self {
        Self { scope }
    }

    /// Key for one aggregate key
    pub fn for_key(key: &str) -> Self {
        Self::new(AggregateKey::key(key))
    }

    /// Key for the global aggregate
    pub fn all() -> Self {
        Self::new(AggregateKey::All)
    }

    /// Convert to storage key string
    /// Format: `recent_quantity:key:<key>` or `recent_quantity:all`
    pub fn to_storage_key(&self) -> String {
        match &self.scope {
            AggregateKey::Key(k) => format!("{}:key:{}", PREFIX, k),
            AggregateKey::All => format!("{}:all", PREFIX),
        }
    }
}

impl From<&AggregateKey> for CacheKey {
    fn from(scope: &AggregateKey) -> Self {
        Self::new(scope.clone())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_is_deterministic() {
        assert_eq!(CacheKey::for_key("apples").to_storage_key(), "recent_quantity:key:apples");
        assert_eq!(
            CacheKey::for_key("apples").to_storage_key(),
            CacheKey::from(&AggregateKey::key("apples")).to_storage_key()
        );
        assert_eq!(CacheKey::all().to_storage_key(), "recent_quantity:all");
    }

    #[test]
    fn test_key_named_all_does_not_collide() {
        assert_ne!(
            CacheKey::for_key("all").to_storage_key(),
            CacheKey::all().to_storage_key()
        );
    }
}
