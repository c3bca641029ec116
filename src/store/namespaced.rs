//! Namespace decorator: prefixes every key with `<namespace>:`.

use async_trait::async_trait;

use super::{Command, Reply, Store, StoreResult};

#[derive(Debug)]
pub struct NamespacedStore<S> {
    inner: S,
    namespace: String,
}

impl<S> NamespacedStore<S> {
    pub fn new(inner: S, namespace: impl Into<String>) -> Self {
        Self { inner, namespace: namespace.into() }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl<S: Store> Store for NamespacedStore<S> {
    async fn exec(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        let ns = &self.namespace;
        let commands = commands
            .into_iter()
            .map(|command| command.map_keys(|key| format!("{ns}:{key}")))
            .collect();
        self.inner.exec(commands).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let memory = Arc::new(MemoryStore::new());
        let store = NamespacedStore::new(memory.clone(), "prod");
        store.run(Command::sadd("queued", "a")).await.unwrap();
        store
            .run(Command::ZUnionStore { dest: "temp:x".into(), keys: vec!["queued".into()] })
            .await
            .unwrap();
        assert_eq!(memory.keys().await, vec!["prod:queued", "prod:temp:x"]);
        let card = store.run(Command::ZCard { key: "temp:x".into() }).await.unwrap();
        assert_eq!(card, Reply::Int(1));
    }
}
