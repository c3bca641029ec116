//! A group of statuses, usually the result of a query.

use tracing::debug;

use crate::error::{StatusError, StatusResult};
use crate::keys;
use crate::status::Status;
use crate::store::{Command, Store};
use crate::tracker::Tracker;

/// Ordered ids plus their statuses, hydrated on first use.
#[derive(Debug, Clone)]
pub struct StatusCollection {
    tracker: Tracker,
    ids: Vec<String>,
    loaded: Option<Vec<Status>>,
}

impl StatusCollection {
    /// Blank ids are dropped.
    pub fn new<I, S>(tracker: &Tracker, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = ids
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| !id.trim().is_empty())
            .collect();
        Self { tracker: tracker.clone(), ids, loaded: None }
    }

    /// Member ids, in query order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Number of ids, loaded or not.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if the collection has no ids.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Hydrate every status in one batch. Records that no longer exist are
    /// skipped. The result is cached.
    pub async fn load(&mut self) -> StatusResult<&[Status]> {
        if self.loaded.is_none() {
            let statuses = self.fetch_statuses().await?;
            self.loaded = Some(statuses);
        }
        Ok(self.loaded.as_deref().unwrap_or_default())
    }

    async fn fetch_statuses(&self) -> StatusResult<Vec<Status>> {
        if self.ids.is_empty() {
            return Ok(Vec::new());
        }
        let commands = self
            .ids
            .iter()
            .map(|id| Command::HGetAll { key: keys::job_key(id) })
            .collect();
        let replies = self.tracker.store().exec(commands).await?;
        let mut statuses = Vec::with_capacity(replies.len());
        for reply in replies {
            let raw = reply.into_map()?;
            if !raw.is_empty() {
                statuses.push(Status::from_raw(&self.tracker, &raw)?);
            }
        }
        Ok(statuses)
    }

    /// First hydrated member, if any.
    pub async fn first(&mut self) -> StatusResult<Option<&Status>> {
        Ok(self.load().await?.first())
    }

    /// Hydrate and hand over every member.
    pub async fn into_statuses(mut self) -> StatusResult<Vec<Status>> {
        self.load().await?;
        Ok(self.loaded.unwrap_or_default())
    }

    /// Request a kill for every member in one batch.
    pub async fn request_kill(&mut self) -> StatusResult<()> {
        self.load().await?;
        let now = self.tracker.now();
        let Some(statuses) = self.loaded.as_mut() else {
            return Ok(());
        };
        if statuses.is_empty() {
            return Ok(());
        }
        let commands = statuses
            .iter()
            .map(|status| status.kill_command(now))
            .collect::<StatusResult<Vec<_>>>()?;
        let replies = self.tracker.store().exec(commands).await?;
        let mut preempted = Vec::new();
        for (index, (status, reply)) in statuses.iter_mut().zip(replies).enumerate() {
            if !status.kill_recorded(reply, now)? {
                preempted.push(index);
            }
        }

        // members killed by someone else keep the stored timestamp
        if !preempted.is_empty() {
            let lookups = preempted.iter().map(|&i| statuses[i].kill_lookup()).collect();
            let stored = self.tracker.store().exec(lookups).await?;
            for (&i, reply) in preempted.iter().zip(stored) {
                statuses[i].kill_reread(reply)?;
            }
        }
        debug!(count = statuses.len(), preempted = preempted.len(), "statuses: kill requested");
        Ok(())
    }

    /// Delete every member. Fails before writing anything if any member is
    /// still incomplete.
    pub async fn delete(&mut self) -> StatusResult<()> {
        if let Some(status) = self.load().await?.iter().find(|s| s.is_incomplete()) {
            return Err(StatusError::NotCompleted(status.id().to_string()));
        }
        self.delete_forced().await
    }

    /// Delete every member regardless of state, then their archived
    /// attempts. The collection is empty afterwards.
    pub async fn delete_forced(&mut self) -> StatusResult<()> {
        self.load().await?;
        let statuses = self.loaded.take().unwrap_or_default();
        remove_all(&self.tracker, &statuses).await?;
        self.ids.clear();
        self.loaded = Some(Vec::new());
        Ok(())
    }

    /// Delete the members matching `predicate`, regardless of state, and
    /// return how many were deleted.
    pub async fn delete_if(
        &mut self,
        predicate: Option<&(dyn Fn(&Status) -> bool + Sync)>,
    ) -> StatusResult<usize> {
        let Some(predicate) = predicate else {
            return Err(StatusError::NotImplemented(
                "delete_if requires a predicate".into(),
            ));
        };
        self.load().await?;
        let (doomed, kept): (Vec<Status>, Vec<Status>) = self
            .loaded
            .take()
            .unwrap_or_default()
            .into_iter()
            .partition(|status| predicate(status));
        remove_all(&self.tracker, &doomed).await?;
        self.ids.retain(|id| !doomed.iter().any(|s| s.id() == id));
        self.loaded = Some(kept);
        Ok(doomed.len())
    }
}

async fn remove_all(tracker: &Tracker, statuses: &[Status]) -> StatusResult<()> {
    if statuses.is_empty() {
        return Ok(());
    }
    let mut prior = Vec::new();
    for status in statuses {
        prior.extend(status.prior_attempts().await?);
    }
    let commands = statuses.iter().flat_map(Status::delete_commands).collect();
    tracker.store().exec(commands).await?;
    if !prior.is_empty() {
        let commands = prior.iter().flat_map(Status::delete_commands).collect();
        tracker.store().exec(commands).await?;
    }
    debug!(count = statuses.len(), archived = prior.len(), "statuses: deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use crate::test_support::{make_status, tracker};

    #[tokio::test]
    async fn test_new_drops_blank_ids() {
        let (tracker, _) = tracker();
        let collection = StatusCollection::new(&tracker, ["a", "", " ", "b"]);
        assert_eq!(collection.ids(), ["a", "b"]);
        assert_eq!(collection.len(), 2);
        assert!(StatusCollection::new(&tracker, Vec::<String>::new()).is_empty());
    }

    #[tokio::test]
    async fn test_load_skips_missing_and_keeps_order() {
        let (tracker, _) = tracker();
        make_status(&tracker, Some("b"), Some(State::Queued)).await;
        make_status(&tracker, Some("a"), Some(State::Started)).await;

        let mut collection = StatusCollection::new(&tracker, ["b", "gone", "a"]);
        let loaded = collection.load().await.unwrap();
        let ids: Vec<&str> = loaded.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(collection.first().await.unwrap().unwrap().id(), "b");
        assert_eq!(collection.into_statuses().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_load_is_memoized() {
        let (tracker, _) = tracker();
        let mut status = make_status(&tracker, Some("a"), Some(State::Queued)).await;
        let mut collection = StatusCollection::new(&tracker, ["a"]);
        collection.load().await.unwrap();
        status.started().await.unwrap();
        assert!(collection.first().await.unwrap().unwrap().is_queued());
    }

    #[tokio::test]
    async fn test_request_kill() {
        let (tracker, _) = tracker();
        make_status(&tracker, Some("a"), Some(State::Queued)).await;
        let mut b = make_status(&tracker, Some("b"), Some(State::Started)).await;
        b.request_kill().await.unwrap();
        let first_kill = b.kill_requested_at();

        let mut collection = StatusCollection::new(&tracker, ["a", "b"]);
        collection.request_kill().await.unwrap();

        for status in collection.load().await.unwrap() {
            assert!(status.kill_requested());
        }
        let b = Status::find(&tracker, "b").await.unwrap().unwrap();
        assert_eq!(b.kill_requested_at(), first_kill);
        let a = Status::find(&tracker, "a").await.unwrap().unwrap();
        assert!(a.kill_requested());
        assert!(a.is_queued());
    }

    #[tokio::test]
    async fn test_request_kill_keeps_earlier_request() {
        let (tracker, _) = tracker();
        make_status(&tracker, Some("a"), Some(State::Queued)).await;
        make_status(&tracker, Some("b"), Some(State::Started)).await;

        let mut collection = StatusCollection::new(&tracker, ["a", "b"]);
        collection.load().await.unwrap();

        let mut other = Status::find(&tracker, "a").await.unwrap().unwrap();
        other.request_kill().await.unwrap();
        let earlier = other.kill_requested_at();

        collection.request_kill().await.unwrap();
        let loaded = collection.load().await.unwrap();
        assert!(loaded[0].kill_requested());
        assert_eq!(loaded[0].kill_requested_at(), earlier);
        assert!(loaded[1].kill_requested());
        assert_ne!(loaded[1].kill_requested_at(), earlier);
    }

    #[tokio::test]
    async fn test_delete_refuses_incomplete_members() {
        let (tracker, _) = tracker();
        make_status(&tracker, Some("done"), Some(State::Succeeded)).await;
        make_status(&tracker, Some("busy"), Some(State::Started)).await;

        let mut collection = StatusCollection::new(&tracker, ["done", "busy"]);
        let err = collection.delete().await.unwrap_err();
        assert!(matches!(err, StatusError::NotCompleted(id) if id == "busy"));
        assert!(Status::find(&tracker, "done").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_completed_members() {
        let (tracker, memory) = tracker();
        make_status(&tracker, Some("s"), Some(State::Succeeded)).await;
        make_status(&tracker, Some("f"), Some(State::Failed)).await;

        let mut collection = StatusCollection::new(&tracker, ["s", "f"]);
        collection.delete().await.unwrap();
        assert!(collection.is_empty());
        assert!(memory.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_forced_removes_archives() {
        let (tracker, memory) = tracker();
        let mut status = make_status(&tracker, Some("r"), Some(State::Started)).await;
        status.started().await.unwrap();
        make_status(&tracker, Some("q"), Some(State::Queued)).await;

        let mut collection = StatusCollection::new(&tracker, ["r", "q"]);
        collection.delete_forced().await.unwrap();
        assert!(collection.is_empty());
        assert!(memory.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_if() {
        let (tracker, _) = tracker();
        make_status(&tracker, Some("a"), Some(State::Failed)).await;
        make_status(&tracker, Some("b"), Some(State::Queued)).await;

        let mut collection = StatusCollection::new(&tracker, ["a", "b"]);
        let err = collection.delete_if(None).await.unwrap_err();
        assert!(matches!(err, StatusError::NotImplemented(_)));

        let failed = |s: &Status| s.is_failed();
        assert_eq!(collection.delete_if(Some(&failed)).await.unwrap(), 1);
        assert_eq!(collection.ids(), ["b"]);
        assert!(Status::find(&tracker, "a").await.unwrap().is_none());
        assert!(Status::find(&tracker, "b").await.unwrap().is_some());
    }
}
