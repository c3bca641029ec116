//! Clauses: one predicate over one or more index keys.
//!
//! A clause names the index keys it reads, either directly or as a key
//! prefix plus a list of suffixes, and optionally a score window and an
//! offset/limit window. It can resolve itself to ids directly, count its
//! matches, or emit the commands that materialize its matches into a fresh
//! temporary sorted set for set algebra.
//!
//! Score bounds are inclusive on both ends.

use tracing::debug;

use crate::clock::limited_count;
use crate::error::{StatusError, StatusResult};
use crate::keys;
use crate::store::{Command, Reply, ScoreBound, Store};

/// Builder for [`Clause`].
#[derive(Debug, Clone, Default)]
pub struct ClauseBuilder {
    keys: Option<Vec<String>>,
    prefix: Option<String>,
    suffixes: Option<Vec<String>>,
    min: Option<i64>,
    max: Option<i64>,
    offset: Option<usize>,
    limit: Option<usize>,
    unique: bool,
}

impl ClauseBuilder {
    /// Read exactly these keys.
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Key prefix, joined to each suffix with `:`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Suffixes expanded under the prefix; duplicates are dropped.
    pub fn suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suffixes = Some(suffixes.into_iter().map(Into::into).collect());
        self
    }

    /// Lowest score admitted (inclusive). Only sorted keys are bounded.
    pub fn min(mut self, min: Option<i64>) -> Self {
        self.min = min;
        self
    }

    /// Highest score admitted (inclusive).
    pub fn max(mut self, max: Option<i64>) -> Self {
        self.max = max;
        self
    }

    /// Skip this many results. Requires a limit.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Keep at most this many results. Requires an offset.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Promise that no id appears under more than one key.
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Validate and build the clause.
    pub fn build(self) -> StatusResult<Clause> {
        if self.offset.is_some() != self.limit.is_some() {
            return Err(StatusError::invalid(
                "`offset` and `limit` must be given together",
            ));
        }

        let keys = match (self.keys, self.prefix, self.suffixes) {
            (Some(keys), _, _) => keys,
            (None, Some(prefix), Some(suffixes)) => {
                let mut keys: Vec<String> = Vec::with_capacity(suffixes.len());
                for suffix in suffixes {
                    let key = keys::prefixed(&prefix, &suffix);
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                keys
            }
            _ => {
                return Err(StatusError::invalid(
                    "Either `keys` or both `prefix` and `suffixes` must be specified",
                ));
            }
        };

        Ok(Clause {
            keys,
            min: self.min,
            max: self.max,
            offset: self.offset,
            limit: self.limit,
            unique: self.unique,
        })
    }
}

/// A predicate over one or more index keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    keys: Vec<String>,
    min: Option<i64>,
    max: Option<i64>,
    offset: Option<usize>,
    limit: Option<usize>,
    unique: bool,
}

impl Clause {
    /// Start building a clause.
    pub fn builder() -> ClauseBuilder {
        ClauseBuilder::default()
    }

    /// Index keys read by the clause.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Whether ids are promised not to repeat across keys.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Copy of this clause further narrowed by an outer offset/limit
    /// window, applied to the clause's own window.
    pub(crate) fn narrowed(mut self, offset: Option<usize>, limit: Option<usize>) -> Self {
        (self.offset, self.limit) = compose_window(self.offset, self.limit, offset, limit);
        self
    }

    fn min_bound(&self) -> ScoreBound {
        ScoreBound::min(self.min)
    }

    fn max_bound(&self) -> ScoreBound {
        ScoreBound::max(self.max)
    }

    fn has_window(&self) -> bool {
        self.offset.is_some() || self.limit.is_some()
    }

    /// Command listing the members of `key`. Sorted keys are read in score
    /// order within the bounds, with the window pushed down when
    /// `use_limit` is set.
    fn members_command(&self, key: &str, use_limit: bool) -> Command {
        if keys::is_sorted_key(key) {
            let limit = if use_limit && self.has_window() {
                Some((self.offset.unwrap_or(0), self.limit.unwrap_or(usize::MAX)))
            } else {
                None
            };
            Command::ZRangeByScore {
                key: key.to_string(),
                min: self.min_bound(),
                max: self.max_bound(),
                limit,
            }
        } else {
            Command::SMembers { key: key.to_string() }
        }
    }

    fn members_from(&self, key: &str, reply: Reply) -> StatusResult<Vec<String>> {
        let mut members = reply.into_members()?;
        if !keys::is_sorted_key(key) {
            members.sort();
        }
        Ok(members)
    }

    fn window(&self, ids: Vec<String>) -> Vec<String> {
        apply_window(ids, self.offset, self.limit)
    }

    /// Matching ids.
    ///
    /// A single key keeps its natural order (score order for timestamp
    /// indexes). Several keys are concatenated, de-duplicated unless the
    /// clause is unique, and sorted.
    pub async fn result_ids(&self, store: &dyn Store) -> StatusResult<Vec<String>> {
        match self.keys.as_slice() {
            [] => Ok(Vec::new()),
            [key] => {
                let limited = keys::is_sorted_key(key) && self.has_window();
                let reply = store.run(self.members_command(key, true)).await?;
                let ids = self.members_from(key, reply)?;
                Ok(if limited { ids } else { self.window(ids) })
            }
            keys => {
                let commands = keys.iter().map(|k| self.members_command(k, false)).collect();
                let replies = store.exec(commands).await?;
                let mut ids = Vec::new();
                for (key, reply) in keys.iter().zip(replies) {
                    ids.extend(self.members_from(key, reply)?);
                }
                if !self.unique {
                    dedupe(&mut ids);
                }
                ids.sort();
                Ok(self.window(ids))
            }
        }
    }

    /// Number of matching ids, after the offset/limit window.
    pub async fn result_count(&self, store: &dyn Store) -> StatusResult<usize> {
        if self.keys.len() > 1 && !self.unique {
            return Ok(self.result_ids(store).await?.len());
        }
        let commands = self
            .keys
            .iter()
            .map(|key| {
                if keys::is_sorted_key(key) {
                    Command::ZCount {
                        key: key.clone(),
                        min: self.min_bound(),
                        max: self.max_bound(),
                    }
                } else {
                    Command::SCard { key: key.clone() }
                }
            })
            .collect();
        let mut total = 0;
        for reply in store.exec(commands).await? {
            total += reply.into_count()?;
        }
        Ok(limited_count(total, self.offset, self.limit))
    }

    /// Commands that union the clause's keys into a fresh temporary sorted
    /// set and trim it to the score bounds and window. Returns the temporary
    /// key with the commands; the caller owns its deletion.
    pub fn to_new_set(&self) -> (String, Vec<Command>) {
        let dest = keys::temp_key();
        if self.keys.is_empty() {
            return (dest, Vec::new());
        }

        let mut commands = vec![Command::ZUnionStore { dest: dest.clone(), keys: self.keys.clone() }];
        if let Some(min) = self.min {
            commands.push(Command::ZRemRangeByScore {
                key: dest.clone(),
                min: ScoreBound::NegInf,
                max: ScoreBound::Exclusive(min as f64),
            });
        }
        if let Some(max) = self.max {
            commands.push(Command::ZRemRangeByScore {
                key: dest.clone(),
                min: ScoreBound::Exclusive(max as f64),
                max: ScoreBound::PosInf,
            });
        }
        if let Some(offset) = self.offset.filter(|o| *o > 0) {
            commands.push(Command::ZRemRangeByRank {
                key: dest.clone(),
                start: 0,
                stop: rank(offset) - 1,
            });
        }
        if let Some(limit) = self.limit {
            commands.push(Command::ZRemRangeByRank { key: dest.clone(), start: rank(limit), stop: -1 });
        }
        debug!(dest = %dest, keys = self.keys.len(), "clause: materializing");
        (dest, commands)
    }
}

/// A predicate over an explicit list of ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdClause {
    ids: Vec<String>,
    offset: Option<usize>,
    limit: Option<usize>,
}

impl IdClause {
    /// Duplicates are dropped, first occurrence wins.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        dedupe(&mut ids);
        Self { ids, offset: None, limit: None }
    }

    /// The ids, de-duplicated.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub(crate) fn narrowed(mut self, offset: Option<usize>, limit: Option<usize>) -> Self {
        (self.offset, self.limit) = compose_window(self.offset, self.limit, offset, limit);
        self
    }

    /// The ids within the window.
    pub fn result_ids(&self) -> Vec<String> {
        apply_window(self.ids.clone(), self.offset, self.limit)
    }

    /// Number of ids within the window.
    pub fn result_count(&self) -> usize {
        limited_count(self.ids.len(), self.offset, self.limit)
    }

    /// Commands writing the ids into a fresh temporary sorted set, all with
    /// score 0.
    pub fn to_new_set(&self) -> (String, Vec<Command>) {
        let dest = keys::temp_key();
        let ids = self.result_ids();
        if ids.is_empty() {
            return (dest, Vec::new());
        }
        let members = ids.into_iter().map(|id| (0.0, id)).collect();
        (dest.clone(), vec![Command::ZAdd { key: dest, members }])
    }
}

/// Either kind of predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Keys(Clause),
    Ids(IdClause),
}

impl Predicate {
    /// Narrow the predicate's own window by an outer one.
    pub(crate) fn narrowed(self, offset: Option<usize>, limit: Option<usize>) -> Self {
        match self {
            Self::Keys(c) => Self::Keys(c.narrowed(offset, limit)),
            Self::Ids(c) => Self::Ids(c.narrowed(offset, limit)),
        }
    }

    pub async fn result_ids(&self, store: &dyn Store) -> StatusResult<Vec<String>> {
        match self {
            Self::Keys(c) => c.result_ids(store).await,
            Self::Ids(c) => Ok(c.result_ids()),
        }
    }

    pub async fn result_count(&self, store: &dyn Store) -> StatusResult<usize> {
        match self {
            Self::Keys(c) => c.result_count(store).await,
            Self::Ids(c) => Ok(c.result_count()),
        }
    }

    pub fn to_new_set(&self) -> (String, Vec<Command>) {
        match self {
            Self::Keys(c) => c.to_new_set(),
            Self::Ids(c) => c.to_new_set(),
        }
    }
}

impl From<Clause> for Predicate {
    fn from(clause: Clause) -> Self {
        Self::Keys(clause)
    }
}

impl From<IdClause> for Predicate {
    fn from(clause: IdClause) -> Self {
        Self::Ids(clause)
    }
}

fn rank(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn dedupe(ids: &mut Vec<String>) {
    let mut seen = rustc_hash::FxHashSet::default();
    ids.retain(|id| seen.insert(id.clone()));
}

/// Window equivalent to applying `outer` to the results of `inner`.
pub(crate) fn compose_window(
    inner_offset: Option<usize>,
    inner_limit: Option<usize>,
    outer_offset: Option<usize>,
    outer_limit: Option<usize>,
) -> (Option<usize>, Option<usize>) {
    if outer_offset.is_none() && outer_limit.is_none() {
        return (inner_offset, inner_limit);
    }
    if inner_offset.is_none() && inner_limit.is_none() {
        return (outer_offset, outer_limit);
    }
    let skip = outer_offset.unwrap_or(0);
    let offset = inner_offset.unwrap_or(0).saturating_add(skip);
    let limit = match (inner_limit, outer_limit) {
        (Some(inner), Some(outer)) => Some(inner.saturating_sub(skip).min(outer)),
        (Some(inner), None) => Some(inner.saturating_sub(skip)),
        (None, outer) => outer,
    };
    (Some(offset), limit)
}

pub(crate) fn apply_window(ids: Vec<String>, offset: Option<usize>, limit: Option<usize>) -> Vec<String> {
    let skipped = ids.into_iter().skip(offset.unwrap_or(0));
    match limit {
        Some(limit) => skipped.take(limit).collect(),
        None => skipped.collect(),
    }
}
