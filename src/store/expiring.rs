//! Auto-expiration decorator.
//!
//! Every mutating command forwarded through [`ExpiringStore`] is followed,
//! inside the same batch, by an `EXPIRE` on the key it wrote. Keys the
//! engine touches therefore always carry a (far-future) TTL that is
//! refreshed on each write.

use async_trait::async_trait;

use super::{Command, Reply, Store, StoreError, StoreResult};

#[derive(Debug)]
pub struct ExpiringStore<S> {
    inner: S,
    ttl_secs: u64,
}

impl<S> ExpiringStore<S> {
    pub fn new(inner: S, ttl_secs: u64) -> Self {
        Self { inner, ttl_secs }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Store> Store for ExpiringStore<S> {
    async fn exec(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        let requested = commands.len();
        let mut expanded = Vec::with_capacity(requested * 2);
        let mut keep = Vec::with_capacity(requested * 2);
        for command in commands {
            let expire = command
                .is_mutating()
                .then(|| command.written_key().map(str::to_string))
                .flatten();
            expanded.push(command);
            keep.push(true);
            if let Some(key) = expire {
                expanded.push(Command::Expire { key, seconds: self.ttl_secs });
                keep.push(false);
            }
        }

        let replies = self.inner.exec(expanded).await?;
        if replies.len() != keep.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                keep.len(),
                replies.len()
            )));
        }
        Ok(replies
            .into_iter()
            .zip(keep)
            .filter_map(|(reply, keep)| keep.then_some(reply))
            .collect())
    }
}
