//! Process configuration.
//!
//! The [`Config`] is handed to a [`Tracker`](crate::Tracker) at
//! construction; nothing in the crate reads global state.

use serde::{Deserialize, Serialize};

/// Default lifetime applied to every key the crate writes: 68 years.
pub const DEFAULT_KEY_TTL_SECS: u64 = 2_145_916_800;

/// Connection and keyspace settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix applied to every key, joined with `:`. Empty disables it.
    pub namespace: String,
    /// Store connection URL (used by the Redis driver).
    pub store_url: String,
    /// Expiration refreshed on every key after each mutating command.
    pub key_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "jobstatus".to_string(),
            store_url: "redis://127.0.0.1:6379".to_string(),
            key_ttl_secs: DEFAULT_KEY_TTL_SECS,
        }
    }
}

impl Config {
    /// Defaults with a different namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Set the key namespace; empty disables prefixing.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the store connection URL.
    pub fn with_store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = url.into();
        self
    }

    /// Set the key expiration in seconds.
    pub fn with_key_ttl_secs(mut self, secs: u64) -> Self {
        self.key_ttl_secs = secs;
        self
    }
}
