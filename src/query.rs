//! Query composition and execution.
//!
//! A [`Query`] collects one predicate per `where_` term and ANDs them. With
//! no terms it matches every recorded job.
//!
//! Execution takes one of two paths:
//!
//! - **Single predicate**: the predicate answers directly, with the query's
//!   offset/limit pushed into it. No temporary keys are written.
//! - **Several predicates**: one atomic batch materializes each predicate
//!   into a temporary sorted set, intersects them pairwise into a running
//!   working set (dropping each consumed pair), applies the terminal read
//!   (`ZRANGE` or `ZCARD`) and deletes the working set. If the batch fails,
//!   every temporary key it may have created is deleted before the error
//!   is returned.

use serde_json::Value;
use tracing::{debug, warn};

use crate::clause::{Predicate, compose_window};
use crate::clause_factory;
use crate::clock::limited_count;
use crate::error::{StatusError, StatusResult};
use crate::keys;
use crate::status::Status;
use crate::statuses::StatusCollection;
use crate::store::{Command, Reply, Store};
use crate::tracker::Tracker;

#[derive(Debug, Clone, Copy)]
enum Terminal {
    Ids,
    Count,
}

/// A conjunction of predicates plus an optional window.
#[derive(Debug, Clone)]
pub struct Query {
    tracker: Tracker,
    predicates: Vec<Predicate>,
    offset: Option<usize>,
    limit: Option<usize>,
}

impl Query {
    /// An empty query: matches every recorded job until terms are added.
    pub fn new(tracker: &Tracker) -> Self {
        Self { tracker: tracker.clone(), predicates: Vec::new(), offset: None, limit: None }
    }

    /// AND one `field = value` term onto the query.
    pub fn where_(mut self, field: &str, value: Value) -> StatusResult<Self> {
        self.predicates.push(clause_factory::new_clause(field, &value)?);
        Ok(self)
    }

    /// AND every entry of a JSON object onto the query.
    pub fn where_all(mut self, terms: Value) -> StatusResult<Self> {
        let Value::Object(terms) = terms else {
            return Err(StatusError::invalid(format!(
                "{terms} is not a valid set of `where` terms"
            )));
        };
        for (field, value) in &terms {
            self.predicates.push(clause_factory::new_clause(field, value)?);
        }
        Ok(self)
    }

    /// AND an already-built predicate onto the query.
    pub fn with_predicate(mut self, predicate: impl Into<Predicate>) -> Self {
        self.predicates.push(predicate.into());
        self
    }

    /// Keep at most `limit` results. Sets the offset to 0 if none is set.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self.offset.get_or_insert(0);
        self
    }

    /// Skip the first `offset` results. Requires a limit.
    pub fn offset(mut self, offset: usize) -> StatusResult<Self> {
        if self.limit.is_none() {
            return Err(StatusError::invalid("`offset` requires a `limit` to be set first"));
        }
        self.offset = Some(offset);
        Ok(self)
    }

    /// Predicates added so far, in order.
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Matching ids within the window.
    pub async fn ids(&self) -> StatusResult<Vec<String>> {
        if self.limit == Some(0) {
            return Ok(Vec::new());
        }
        self.run(Terminal::Ids).await?.into_members().map_err(StatusError::from)
    }

    /// Number of matching ids within the window.
    pub async fn count(&self) -> StatusResult<usize> {
        if self.limit == Some(0) {
            return Ok(0);
        }
        Ok(self.run(Terminal::Count).await?.into_count()?)
    }

    /// Returns `true` if nothing matches.
    pub async fn is_empty(&self) -> StatusResult<bool> {
        Ok(self.count().await? == 0)
    }

    /// The matching statuses, hydrated on demand.
    pub async fn fetch(&self) -> StatusResult<StatusCollection> {
        Ok(StatusCollection::new(&self.tracker, self.ids().await?))
    }

    /// The first match. Only that record is read back.
    pub async fn first(&self) -> StatusResult<Option<Status>> {
        let (offset, limit) = compose_window(self.offset, self.limit, Some(0), Some(1));
        let ids = Query { offset, limit, ..self.clone() }.ids().await?;
        match ids.first() {
            Some(id) => Status::find(&self.tracker, id).await,
            None => Ok(None),
        }
    }

    /// Request a kill for every match.
    pub async fn request_kill(&self) -> StatusResult<()> {
        self.fetch().await?.request_kill().await
    }

    /// Delete every match; see [`StatusCollection::delete`].
    pub async fn delete(&self) -> StatusResult<()> {
        self.fetch().await?.delete().await
    }

    /// Delete every match regardless of state.
    pub async fn delete_forced(&self) -> StatusResult<()> {
        self.fetch().await?.delete_forced().await
    }

    /// Delete the matches accepted by `predicate`.
    pub async fn delete_if(
        &self,
        predicate: Option<&(dyn Fn(&Status) -> bool + Sync)>,
    ) -> StatusResult<usize> {
        self.fetch().await?.delete_if(predicate).await
    }

    async fn run(&self, terminal: Terminal) -> StatusResult<Reply> {
        let store = self.tracker.store();
        match self.predicates.as_slice() {
            [] => {
                let all = clause_factory::all_clause()?;
                self.run_single(store, &all, terminal).await
            }
            [predicate] => self.run_single(store, predicate, terminal).await,
            predicates => self.run_intersection(store, predicates, terminal).await,
        }
    }

    async fn run_single(
        &self,
        store: &dyn Store,
        predicate: &Predicate,
        terminal: Terminal,
    ) -> StatusResult<Reply> {
        debug!(terminal = ?terminal, "query: single predicate");
        let predicate = predicate.clone().narrowed(self.offset, self.limit);
        Ok(match terminal {
            Terminal::Ids => Reply::Array(
                predicate
                    .result_ids(store)
                    .await?
                    .into_iter()
                    .map(Reply::Bulk)
                    .collect(),
            ),
            Terminal::Count => Reply::Int(count_reply(predicate.result_count(store).await?)),
        })
    }

    async fn run_intersection(
        &self,
        store: &dyn Store,
        predicates: &[Predicate],
        terminal: Terminal,
    ) -> StatusResult<Reply> {
        let mut temps = Vec::with_capacity(predicates.len() * 2);
        let mut commands = Vec::new();
        for predicate in predicates {
            let (temp, materialize) = predicate.to_new_set();
            temps.push(temp);
            commands.extend(materialize);
        }

        let mut working = temps[0].clone();
        for next in temps[1..predicates.len()].to_vec() {
            let dest = keys::temp_key();
            commands.push(Command::ZInterStore {
                dest: dest.clone(),
                keys: vec![working.clone(), next.clone()],
            });
            commands.push(Command::Del { keys: vec![working, next] });
            temps.push(dest.clone());
            working = dest;
        }

        commands.push(match terminal {
            Terminal::Ids => {
                let start = self.offset.unwrap_or(0);
                let stop = match self.limit {
                    Some(limit) => rank(start.saturating_add(limit)) - 1,
                    None => -1,
                };
                Command::ZRange { key: working.clone(), start: rank(start), stop }
            }
            Terminal::Count => Command::ZCard { key: working.clone() },
        });
        let read_at = commands.len() - 1;
        commands.push(Command::del(working));

        debug!(predicates = predicates.len(), terminal = ?terminal, "query: intersecting");
        let replies = match store.exec(commands).await {
            Ok(replies) => replies,
            Err(err) => {
                if let Err(cleanup) = store.run(Command::Del { keys: temps }).await {
                    warn!(error = %cleanup, "query: temp key cleanup failed");
                }
                return Err(err.into());
            }
        };

        let reply = replies
            .into_iter()
            .nth(read_at)
            .ok_or_else(|| crate::store::StoreError::UnexpectedReply("missing query reply".into()))?;
        Ok(match terminal {
            Terminal::Ids => reply,
            Terminal::Count => Reply::Int(count_reply(limited_count(
                reply.into_count()?,
                self.offset,
                self.limit,
            ))),
        })
    }
}

fn rank(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn count_reply(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
