//! Entry point: a store, a clock and a configuration bundled together.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::StatusResult;
use crate::query::Query;
use crate::status::Status;
use crate::statuses::StatusCollection;
use crate::store::{ExpiringStore, MemoryStore, NamespacedStore, Store};

struct Inner {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: Config,
}

/// Shared handle to a job status keyspace.
///
/// Cloning is cheap; every [`Status`], [`Query`] and [`StatusCollection`]
/// carries its own clone.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("namespace", &self.inner.config.namespace)
            .field("key_ttl_secs", &self.inner.config.key_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Track statuses in `store`, reading time from the system clock.
    pub fn new(config: Config, store: impl Store + 'static) -> Self {
        Self::with_clock(config, store, SystemClock)
    }

    /// Track statuses in `store` with an explicit clock.
    ///
    /// The store is wrapped so that every written key is refreshed with the
    /// configured TTL and, when the namespace is non-empty, prefixed with it.
    pub fn with_clock(config: Config, store: impl Store + 'static, clock: impl Clock + 'static) -> Self {
        let expiring = ExpiringStore::new(store, config.key_ttl_secs);
        let store: Arc<dyn Store> = if config.namespace.is_empty() {
            Arc::new(expiring)
        } else {
            Arc::new(NamespacedStore::new(expiring, config.namespace.clone()))
        };
        debug!(namespace = %config.namespace, "tracker: ready");
        Self {
            inner: Arc::new(Inner { store, clock: Arc::new(clock), config }),
        }
    }

    /// Track statuses in a fresh in-process store.
    pub fn in_memory(config: Config) -> Self {
        Self::new(config, MemoryStore::new())
    }

    /// Connect to the Redis server named by `config.store_url`.
    #[cfg(feature = "redis")]
    pub async fn connect(config: Config) -> StatusResult<Self> {
        let store = crate::store::RedisStore::connect(&config.store_url).await?;
        Ok(Self::new(config, store))
    }

    /// Release this handle. The connection closes once the last clone of
    /// the handle (including those held by statuses and queries) is gone.
    pub fn close(self) {
        debug!(namespace = %self.inner.config.namespace, "tracker: closed");
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The decorated store all reads and writes go through.
    pub fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub async fn create(&self) -> StatusResult<Status> {
        Status::create(self).await
    }

    pub async fn create_with_id(&self, id: &str) -> StatusResult<Status> {
        Status::create_with_id(self, id).await
    }

    pub async fn find(&self, id: &str) -> StatusResult<Option<Status>> {
        Status::find(self, id).await
    }

    pub async fn find_or_create(&self, id: &str) -> StatusResult<Status> {
        Status::find_or_create(self, id).await
    }

    /// A query matching every recorded job.
    pub fn all(&self) -> Query {
        Query::new(self)
    }

    pub fn where_(&self, field: &str, value: Value) -> StatusResult<Query> {
        Query::new(self).where_(field, value)
    }

    pub fn statuses<I, S>(&self, ids: I) -> StatusCollection
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StatusCollection::new(self, ids)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::Command;
    use crate::test_support::test_clock;

    #[tokio::test]
    async fn test_namespaces_and_expires_keys() {
        let memory = Arc::new(MemoryStore::new());
        let tracker = Tracker::with_clock(
            Config::new("jobs").with_key_ttl_secs(60),
            memory.clone(),
            test_clock(),
        );
        let mut status = tracker.create_with_id("a").await.unwrap();
        status.queued().await.unwrap();

        assert_eq!(
            memory.keys().await,
            vec!["jobs:id:a", "jobs:queued", "jobs:queued_at", "jobs:recorded_at"]
        );
        assert_eq!(memory.ttl("jobs:id:a").await, Some(60));
        assert_eq!(memory.ttl("jobs:queued_at").await, Some(60));

        let found = tracker.find("a").await.unwrap().unwrap();
        assert!(found.is_queued());
        assert_eq!(tracker.where_("state", json!("queued")).unwrap().ids().await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_empty_namespace_leaves_keys_bare() {
        let memory = Arc::new(MemoryStore::new());
        let tracker = Tracker::with_clock(Config::new(""), memory.clone(), test_clock());
        tracker.create_with_id("a").await.unwrap();
        let raw = memory
            .run(Command::HGetAll { key: "id:a".into() })
            .await
            .unwrap()
            .into_map()
            .unwrap();
        assert_eq!(raw["state"], "\"unqueued\"");
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let memory = Arc::new(MemoryStore::new());
        let one = Tracker::with_clock(Config::new("one"), memory.clone(), test_clock());
        let two = Tracker::with_clock(Config::new("two"), memory.clone(), test_clock());
        one.create_with_id("a").await.unwrap();
        assert!(two.find("a").await.unwrap().is_none());
        assert_eq!(two.all().count().await.unwrap(), 0);
        assert_eq!(one.all().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_statuses_and_find_or_create() {
        let tracker = Tracker::in_memory(Config::default());
        let status = tracker.find_or_create("x").await.unwrap();
        assert!(status.is_unknown());
        let mut collection = tracker.statuses(["x", "y"]);
        assert_eq!(collection.load().await.unwrap().len(), 1);
        tracker.close();
    }
}
