//! The job status record and its state machine.
//!
//! A [`Status`] is one job's current record. Every field lives in a single
//! hash (`id:<id>`), each value individually JSON-encoded. Secondary
//! indexes (state sets, timestamp sorted sets, job name / argument /
//! provider id sets) are derived from the record and rewritten in the same
//! atomic batch as every mutation that affects them.
//!
//! # Restarts
//!
//! Entering `started` on a record that already has a `started_at` is a
//! restart: the current hash is archived under `id:<id>:<attempt>`, the
//! live record keeps only its identity, `recorded_at`, `queued_at` and job
//! metadata, the attempt counter is bumped and the record enters `started`
//! afresh. Archived attempts are ordinary records addressable by the
//! compound id `<id>:<attempt>`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::clock;
use crate::error::{StatusError, StatusResult};
use crate::keys;
use crate::state::State;
use crate::store::{Command, Reply, Store};
use crate::tracker::Tracker;

const ID: &str = "id";
const STATE: &str = "state";
const PROGRESS: &str = "progress";
const ERRORS: &str = "errors";
const DATA: &str = "data";
const ATTEMPT: &str = "attempt";
const KILL_REQUESTED_AT: &str = "kill_requested_at";
const JOB_NAME: &str = "job_name";
const JOB_ARGS: &str = "job_args";
const PROVIDER_JOB_ID: &str = "provider_job_id";

/// Timestamps that survive a restart.
const CARRIED_TIMESTAMPS: [&str; 2] = ["recorded_at", "queued_at"];

fn encode<T: Serialize + ?Sized>(value: &T) -> StatusResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(
    raw: &FxHashMap<String, String>,
    field: &str,
) -> StatusResult<Option<T>> {
    raw.get(field)
        .map(|json| serde_json::from_str(json))
        .transpose()
        .map_err(StatusError::from)
}

fn field(name: &str, value: String) -> (String, String) {
    (name.to_string(), value)
}

/// One job's current record.
#[derive(Debug, Clone)]
pub struct Status {
    tracker: Tracker,
    id: String,
    state: State,
    progress: f64,
    errors: Vec<Value>,
    data: Option<Value>,
    kill_requested_at: Option<DateTime<Utc>>,
    job_name: Option<String>,
    job_args: BTreeMap<String, String>,
    provider_job_id: Option<String>,
    attempt: u32,
    timestamps: BTreeMap<&'static str, DateTime<Utc>>,
}

impl Status {
    // ── Lookup and creation ──────────────────────────────────────────

    /// Create a new `unqueued` record with a generated id.
    pub async fn create(tracker: &Tracker) -> StatusResult<Status> {
        Self::persist_new(tracker, Uuid::new_v4().to_string(), State::Unqueued).await
    }

    /// Create a new `unqueued` record under a caller-supplied id.
    pub async fn create_with_id(tracker: &Tracker, id: &str) -> StatusResult<Status> {
        Self::validate_id(id)?;
        if Self::find(tracker, id).await?.is_some() {
            return Err(StatusError::invalid(format!("status '{id}' already exists")));
        }
        Self::persist_new(tracker, id.to_string(), State::Unqueued).await
    }

    /// The record for `id`, or `None` if it was never recorded.
    pub async fn find(tracker: &Tracker, id: &str) -> StatusResult<Option<Status>> {
        Self::validate_id(id)?;
        let raw = tracker
            .store()
            .run(Command::HGetAll { key: keys::job_key(id) })
            .await?
            .into_map()?;
        if raw.is_empty() {
            return Ok(None);
        }
        Self::from_raw(tracker, &raw).map(Some)
    }

    /// The record for `id`; a missing record is materialized in the
    /// `unknown` state.
    pub async fn find_or_create(tracker: &Tracker, id: &str) -> StatusResult<Status> {
        match Self::find(tracker, id).await? {
            Some(status) => Ok(status),
            None => {
                debug!(id = %id, "status: materializing unknown record");
                Self::persist_new(tracker, id.to_string(), State::Unknown).await
            }
        }
    }

    fn validate_id(id: &str) -> StatusResult<()> {
        if id.trim().is_empty() {
            return Err(StatusError::invalid("`id` cannot be blank"));
        }
        Ok(())
    }

    fn blank(tracker: &Tracker, id: String, state: State) -> Status {
        Status {
            tracker: tracker.clone(),
            id,
            state,
            progress: 0.0,
            errors: Vec::new(),
            data: None,
            kill_requested_at: None,
            job_name: None,
            job_args: BTreeMap::new(),
            provider_job_id: None,
            attempt: 0,
            timestamps: BTreeMap::new(),
        }
    }

    async fn persist_new(tracker: &Tracker, id: String, state: State) -> StatusResult<Status> {
        let mut status = Self::blank(tracker, id, state);
        let now = tracker.now();
        let usec = clock::to_usec(now)?;
        let ts_name = state.timestamp_name();

        tracker
            .store()
            .exec(vec![
                Command::HSet {
                    key: status.key(),
                    fields: vec![
                        field(ID, encode(&status.id)?),
                        field(STATE, encode(&state)?),
                        field(PROGRESS, encode(&status.progress)?),
                        field(ERRORS, encode(&status.errors)?),
                        field(ATTEMPT, encode(&status.attempt)?),
                        field(JOB_ARGS, encode(&status.job_args)?),
                        field(ts_name, usec.to_string()),
                    ],
                },
                Command::sadd(state.name(), status.id.as_str()),
                Command::zadd(ts_name, usec as f64, status.id.as_str()),
            ])
            .await?;

        status.timestamps.insert(ts_name, now);
        debug!(id = %status.id, state = %state, "status: created");
        Ok(status)
    }

    /// Decode a raw hash. Only the fields present are parsed.
    pub(crate) fn from_raw(
        tracker: &Tracker,
        raw: &FxHashMap<String, String>,
    ) -> StatusResult<Status> {
        let id: String = decode(raw, ID)?.ok_or_else(|| {
            <serde_json::Error as serde::de::Error>::missing_field(ID)
        })?;
        let mut status = Self::blank(tracker, id, State::Unknown);
        if let Some(state) = decode(raw, STATE)? {
            status.state = state;
        }
        status.progress = decode(raw, PROGRESS)?.unwrap_or(0.0);
        status.errors = decode(raw, ERRORS)?.unwrap_or_default();
        status.data = decode::<Value>(raw, DATA)?.filter(|v| !v.is_null());
        status.kill_requested_at = decode::<i64>(raw, KILL_REQUESTED_AT)?.map(clock::from_usec);
        status.job_name = decode(raw, JOB_NAME)?;
        status.job_args = decode(raw, JOB_ARGS)?.unwrap_or_default();
        status.provider_job_id = decode(raw, PROVIDER_JOB_ID)?;
        status.attempt = decode(raw, ATTEMPT)?.unwrap_or(0);
        for name in State::TIMESTAMP_NAMES {
            if let Some(usec) = decode::<i64>(raw, name)? {
                status.timestamps.insert(name, clock::from_usec(usec));
            }
        }
        Ok(status)
    }

    /// Re-read the record from the store.
    pub async fn reload(&mut self) -> StatusResult<&mut Self> {
        match Self::find(&self.tracker, &self.id).await? {
            Some(fresh) => {
                *self = fresh;
                Ok(self)
            }
            None => Err(StatusError::NotFound(self.id.clone())),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// Record id; archived attempts use `<id>:<attempt>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Fraction in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Errors reported so far, oldest first.
    pub fn errors(&self) -> &[Value] {
        &self.errors
    }

    /// Caller payload saved with [`Status::save`].
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Time of the first kill request.
    pub fn kill_requested_at(&self) -> Option<DateTime<Utc>> {
        self.kill_requested_at
    }

    /// Returns `true` once a kill has been requested.
    pub fn kill_requested(&self) -> bool {
        self.kill_requested_at.is_some()
    }

    /// Job name, if one was set.
    pub fn job_name(&self) -> Option<&str> {
        self.job_name.as_deref()
    }

    /// Job arguments by name.
    pub fn job_args(&self) -> &BTreeMap<String, String> {
        &self.job_args
    }

    /// Id assigned by the job runner, if any.
    pub fn provider_job_id(&self) -> Option<&str> {
        self.provider_job_id.as_deref()
    }

    /// Zero-based attempt number; bumped by each restart.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time of first entry into the state owning `name` (e.g. `"queued_at"`).
    pub fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.timestamps.get(name).copied()
    }

    /// When the record was created.
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp("recorded_at")
    }

    /// First entry into `queued`.
    pub fn queued_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp("queued_at")
    }

    /// Entry into `started` for the current attempt.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp("started_at")
    }

    /// First entry into `succeeded`.
    pub fn succeeded_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp("succeeded_at")
    }

    /// First entry into `failed`.
    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp("failed_at")
    }

    /// First entry into `killed`.
    pub fn killed_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp("killed_at")
    }

    /// Returns `true` if the record is in `state`.
    pub fn is(&self, state: State) -> bool {
        self.state == state
    }

    /// Created but not handed to a queue.
    pub fn is_unqueued(&self) -> bool {
        self.is(State::Unqueued)
    }

    /// Waiting in a queue.
    pub fn is_queued(&self) -> bool {
        self.is(State::Queued)
    }

    /// Running.
    pub fn is_started(&self) -> bool {
        self.is(State::Started)
    }

    /// Finished successfully.
    pub fn is_succeeded(&self) -> bool {
        self.is(State::Succeeded)
    }

    /// Finished with a failure.
    pub fn is_failed(&self) -> bool {
        self.is(State::Failed)
    }

    /// Stopped on request.
    pub fn is_killed(&self) -> bool {
        self.is(State::Killed)
    }

    /// Materialized by a lookup, never reported on.
    pub fn is_unknown(&self) -> bool {
        self.is(State::Unknown)
    }

    /// `succeeded` or `failed`.
    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Anything but `succeeded` or `failed`.
    pub fn is_incomplete(&self) -> bool {
        !self.is_completed()
    }

    fn key(&self) -> String {
        keys::job_key(&self.id)
    }

    // ── State machine ────────────────────────────────────────────────

    /// Enter `unqueued`.
    pub async fn unqueued(&mut self) -> StatusResult<&mut Self> {
        self.enter(State::Unqueued).await
    }

    /// Enter `queued`.
    pub async fn queued(&mut self) -> StatusResult<&mut Self> {
        self.enter(State::Queued).await
    }

    /// Enter `started`; restarts the job if it has been started before.
    pub async fn started(&mut self) -> StatusResult<&mut Self> {
        self.enter(State::Started).await
    }

    /// Enter `succeeded`; progress becomes 1.0.
    pub async fn succeeded(&mut self) -> StatusResult<&mut Self> {
        self.enter(State::Succeeded).await
    }

    /// Enter `failed`.
    pub async fn failed(&mut self) -> StatusResult<&mut Self> {
        self.enter(State::Failed).await
    }

    /// Enter `killed`.
    pub async fn killed(&mut self) -> StatusResult<&mut Self> {
        self.enter(State::Killed).await
    }

    /// Transition to `target`.
    ///
    /// Re-entering the current state is a no-op, except for `started` on a
    /// record that already has a `started_at`, which restarts it.
    pub async fn enter(&mut self, target: State) -> StatusResult<&mut Self> {
        if !target.is_enterable() {
            return Err(StatusError::invalid(format!("'{target}' cannot be entered directly")));
        }
        if target == State::Started && self.started_at().is_some() {
            self.restart().await?;
            return Ok(self);
        }
        if target == self.state {
            return Ok(self);
        }

        let now = self.tracker.now();
        let usec = clock::to_usec(now)?;
        let ts_name = target.timestamp_name();
        let stamp = !self.timestamps.contains_key(ts_name);

        let mut fields = vec![field(STATE, encode(&target)?)];
        if target == State::Succeeded {
            fields.push(field(PROGRESS, encode(&1.0_f64)?));
        }
        if stamp {
            fields.push(field(ts_name, usec.to_string()));
        }

        let mut commands = vec![
            Command::srem(self.state.name(), self.id.as_str()),
            Command::HSet { key: self.key(), fields },
            Command::sadd(target.name(), self.id.as_str()),
        ];
        if stamp {
            commands.push(Command::zadd(ts_name, usec as f64, self.id.as_str()));
        }
        self.tracker.store().exec(commands).await?;

        debug!(id = %self.id, from = %self.state, to = %target, "status: transition");
        self.state = target;
        if target == State::Succeeded {
            self.progress = 1.0;
        }
        if stamp {
            self.timestamps.insert(ts_name, now);
        }
        Ok(self)
    }

    async fn restart(&mut self) -> StatusResult<()> {
        let now = self.tracker.now();
        let usec = clock::to_usec(now)?;
        let archive_id = keys::attempt_id(&self.id, self.attempt);
        let next_attempt = self.attempt.checked_add(1).ok_or_else(|| {
            StatusError::invalid(format!("'{}' has exhausted its attempt counter", self.id))
        })?;
        let started_at = State::Started.timestamp_name();

        let mut commands = vec![
            Command::Rename { from: self.key(), to: keys::job_key(&archive_id) },
            Command::HSet {
                key: keys::job_key(&archive_id),
                fields: vec![field(ID, encode(&archive_id)?)],
            },
            Command::srem(self.state.name(), self.id.as_str()),
        ];
        for name in State::TIMESTAMP_NAMES {
            if !CARRIED_TIMESTAMPS.contains(&name) {
                commands.push(Command::zrem(name, self.id.as_str()));
            }
        }

        let mut fields = vec![
            field(ID, encode(&self.id)?),
            field(STATE, encode(&State::Started)?),
            field(PROGRESS, encode(&0.0_f64)?),
            field(ERRORS, encode(&Vec::<Value>::new())?),
            field(ATTEMPT, encode(&next_attempt)?),
            field(JOB_ARGS, encode(&self.job_args)?),
            field(started_at, usec.to_string()),
        ];
        for name in CARRIED_TIMESTAMPS {
            if let Some(t) = self.timestamps.get(name) {
                fields.push(field(name, clock::to_usec(*t)?.to_string()));
            }
        }
        if let Some(name) = &self.job_name {
            fields.push(field(JOB_NAME, encode(name)?));
        }
        if let Some(provider_id) = &self.provider_job_id {
            fields.push(field(PROVIDER_JOB_ID, encode(provider_id)?));
        }
        commands.push(Command::HSet { key: self.key(), fields });
        commands.push(Command::sadd(State::Started.name(), self.id.as_str()));
        commands.push(Command::zadd(started_at, usec as f64, self.id.as_str()));

        self.tracker.store().exec(commands).await?;

        debug!(id = %self.id, archived = %archive_id, attempt = next_attempt, "status: restarted");
        self.state = State::Started;
        self.progress = 0.0;
        self.errors.clear();
        self.data = None;
        self.kill_requested_at = None;
        self.attempt = next_attempt;
        self.timestamps.retain(|name, _| CARRIED_TIMESTAMPS.contains(name));
        self.timestamps.insert(started_at, now);
        Ok(())
    }

    // ── Field updates ────────────────────────────────────────────────

    /// Record progress as `at` (in `[0, 1]`) or as `at` out of `out_of`.
    pub async fn set_progress(&mut self, at: f64, out_of: Option<f64>) -> StatusResult<&mut Self> {
        let progress = fractional_progress(at, out_of)?;
        // a succeeded job stays at 1.0
        let progress = if self.is_succeeded() { 1.0 } else { progress };
        self.write_fields(vec![field(PROGRESS, encode(&progress)?)]).await?;
        self.progress = progress;
        Ok(self)
    }

    /// Store an arbitrary JSON payload. `null` clears it.
    pub async fn save(&mut self, data: Value) -> StatusResult<&mut Self> {
        self.write_fields(vec![field(DATA, encode(&data)?)]).await?;
        self.data = Some(data).filter(|v| !v.is_null());
        Ok(self)
    }

    /// Append an error entry.
    pub async fn add_error(&mut self, error: Value) -> StatusResult<&mut Self> {
        let mut errors = self.errors.clone();
        errors.push(error);
        self.write_fields(vec![field(ERRORS, encode(&errors)?)]).await?;
        self.errors = errors;
        Ok(self)
    }

    async fn write_fields(&self, fields: Vec<(String, String)>) -> StatusResult<()> {
        self.tracker
            .store()
            .run(Command::HSet { key: self.key(), fields })
            .await?;
        Ok(())
    }

    /// Set the job name, moving the record between name indexes.
    pub async fn set_job_name(&mut self, name: &str) -> StatusResult<&mut Self> {
        if name.trim().is_empty() {
            return Err(StatusError::invalid("`job_name` cannot be blank"));
        }
        let mut commands = Vec::with_capacity(3);
        if let Some(old) = &self.job_name {
            commands.push(Command::srem(keys::job_name_key(old), self.id.as_str()));
        }
        commands.push(Command::HSet {
            key: self.key(),
            fields: vec![field(JOB_NAME, encode(name)?)],
        });
        commands.push(Command::sadd(keys::job_name_key(name), self.id.as_str()));
        self.tracker.store().exec(commands).await?;
        self.job_name = Some(name.to_string());
        Ok(self)
    }

    /// Replace all job arguments. Each argument *value* is indexed.
    pub async fn set_job_args<K, V>(
        &mut self,
        args: impl IntoIterator<Item = (K, V)>,
    ) -> StatusResult<&mut Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let args: BTreeMap<String, String> =
            args.into_iter().map(|(k, v)| (k.into(), v.into())).collect();

        let mut commands = Vec::new();
        for value in self.job_args.values() {
            commands.push(Command::srem(keys::job_arg_key(value), self.id.as_str()));
        }
        commands.push(Command::HSet {
            key: self.key(),
            fields: vec![field(JOB_ARGS, encode(&args)?)],
        });
        for value in args.values() {
            commands.push(Command::sadd(keys::job_arg_key(value), self.id.as_str()));
        }
        self.tracker.store().exec(commands).await?;
        self.job_args = args;
        Ok(self)
    }

    /// Set the runner's id for this job, moving the record between provider id indexes.
    pub async fn set_provider_job_id(
        &mut self,
        provider_job_id: impl ToString,
    ) -> StatusResult<&mut Self> {
        let provider_job_id = provider_job_id.to_string();
        if provider_job_id.trim().is_empty() {
            return Err(StatusError::invalid("`provider_job_id` cannot be blank"));
        }
        let mut commands = Vec::with_capacity(3);
        if let Some(old) = &self.provider_job_id {
            commands.push(Command::srem(keys::provider_job_id_key(old), self.id.as_str()));
        }
        commands.push(Command::HSet {
            key: self.key(),
            fields: vec![field(PROVIDER_JOB_ID, encode(&provider_job_id)?)],
        });
        commands.push(Command::sadd(
            keys::provider_job_id_key(&provider_job_id),
            self.id.as_str(),
        ));
        self.tracker.store().exec(commands).await?;
        self.provider_job_id = Some(provider_job_id);
        Ok(self)
    }

    // ── Kill requests ────────────────────────────────────────────────

    /// Ask for the job to be killed. Only the first request is recorded.
    pub async fn request_kill(&mut self) -> StatusResult<&mut Self> {
        let now = self.tracker.now();
        let reply = self.tracker.store().run(self.kill_command(now)?).await?;
        if !self.kill_recorded(reply, now)? {
            let stored = self.tracker.store().run(self.kill_lookup()).await?;
            self.kill_reread(stored)?;
        }
        Ok(self)
    }

    pub(crate) fn kill_command(&self, now: DateTime<Utc>) -> StatusResult<Command> {
        Ok(Command::HSetNx {
            key: self.key(),
            field: KILL_REQUESTED_AT.to_string(),
            value: clock::to_usec(now)?.to_string(),
        })
    }

    pub(crate) fn kill_lookup(&self) -> Command {
        Command::HGet { key: self.key(), field: KILL_REQUESTED_AT.to_string() }
    }

    /// Apply the reply to [`Self::kill_command`]. Returns `false` when an
    /// earlier request already holds the field.
    pub(crate) fn kill_recorded(&mut self, reply: Reply, now: DateTime<Utc>) -> StatusResult<bool> {
        let written = reply.into_bool()?;
        if written {
            debug!(id = %self.id, "status: kill requested");
            self.kill_requested_at = Some(now);
        }
        Ok(written)
    }

    /// Apply the reply to [`Self::kill_lookup`].
    pub(crate) fn kill_reread(&mut self, reply: Reply) -> StatusResult<()> {
        if let Some(json) = reply.into_opt_string()? {
            self.kill_requested_at = Some(clock::from_usec(serde_json::from_str(&json)?));
        }
        Ok(())
    }

    // ── Attempts and deletion ────────────────────────────────────────

    /// Archived earlier attempts, oldest first.
    pub async fn prior_attempts(&self) -> StatusResult<Vec<Status>> {
        if self.attempt == 0 {
            return Ok(Vec::new());
        }
        let commands = (0..self.attempt)
            .map(|n| Command::HGetAll { key: keys::job_key(&keys::attempt_id(&self.id, n)) })
            .collect();
        let replies = self.tracker.store().exec(commands).await?;
        let mut attempts = Vec::with_capacity(replies.len());
        for reply in replies {
            let raw = reply.into_map()?;
            if !raw.is_empty() {
                attempts.push(Self::from_raw(&self.tracker, &raw)?);
            }
        }
        Ok(attempts)
    }

    /// Delete a completed record. Incomplete records are refused.
    pub async fn delete(&self) -> StatusResult<()> {
        if self.is_incomplete() {
            return Err(StatusError::NotCompleted(self.id.clone()));
        }
        self.delete_forced().await
    }

    /// Delete the record, its index entries and every archived attempt,
    /// regardless of state.
    pub async fn delete_forced(&self) -> StatusResult<()> {
        let prior = self.prior_attempts().await?;
        self.tracker.store().exec(self.delete_commands()).await?;
        for attempt in &prior {
            self.tracker.store().exec(attempt.delete_commands()).await?;
        }
        debug!(id = %self.id, archived = prior.len(), "status: deleted");
        Ok(())
    }

    /// Commands removing the hash and every index entry for this record.
    pub(crate) fn delete_commands(&self) -> Vec<Command> {
        let id = self.id.as_str();
        let mut commands = vec![Command::del(self.key())];
        commands.extend(State::ALL.iter().map(|state| Command::srem(state.name(), id)));
        commands.extend(State::TIMESTAMP_NAMES.iter().map(|name| Command::zrem(*name, id)));
        if let Some(name) = &self.job_name {
            commands.push(Command::srem(keys::job_name_key(name), id));
        }
        for value in self.job_args.values() {
            commands.push(Command::srem(keys::job_arg_key(value), id));
        }
        if let Some(provider_id) = &self.provider_job_id {
            commands.push(Command::srem(keys::provider_job_id_key(provider_id), id));
        }
        commands
    }
}

fn fractional_progress(at: f64, out_of: Option<f64>) -> StatusResult<f64> {
    if !at.is_finite() {
        return Err(StatusError::invalid(format!("progress must be a finite number (at={at})")));
    }
    if at < 0.0 {
        return Err(StatusError::invalid(format!("progress cannot be negative (at={at})")));
    }
    match out_of {
        Some(total) if !total.is_finite() || total < at => Err(StatusError::invalid(
            "`out_of` must be greater than or equal to `at` in progress calls",
        )),
        Some(total) if total <= 0.0 => Err(StatusError::invalid("`out_of` must be positive")),
        Some(total) => Ok(at / total),
        None if at > 1.0 => Err(StatusError::invalid(
            "if `out_of` is not given, `at` must be in the range [0.0, 1.0]",
        )),
        None => Ok(at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_status, tracker};
    use serde_json::json;

    #[tokio::test]
    async fn test_create() {
        let (tracker, memory) = tracker();
        let status = Status::create(&tracker).await.unwrap();

        assert!(!status.id().is_empty());
        assert_eq!(status.state(), State::Unqueued);
        assert!(status.is_unqueued());
        assert_eq!(status.progress(), 0.0);
        assert!(status.errors().is_empty());
        assert_eq!(status.attempt(), 0);
        assert!(status.job_args().is_empty());
        assert!(status.recorded_at().is_some());

        let raw = memory
            .run(Command::HGetAll { key: keys::job_key(status.id()) })
            .await
            .unwrap()
            .into_map()
            .unwrap();
        assert_eq!(raw["id"], format!("\"{}\"", status.id()));
        assert_eq!(raw["state"], "\"unqueued\"");
        assert_eq!(raw["errors"], "[]");
        assert_eq!(raw["attempt"], "0");
        assert!(raw["recorded_at"].parse::<i64>().is_ok());
    }

    #[tokio::test]
    async fn test_create_with_id_validates() {
        let (tracker, _) = tracker();
        assert!(Status::create_with_id(&tracker, " ").await.unwrap_err().is_validation());
        Status::create_with_id(&tracker, "a").await.unwrap();
        assert!(Status::create_with_id(&tracker, "a").await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_find() {
        let (tracker, _) = tracker();
        let id = Status::create(&tracker).await.unwrap().id().to_string();
        let status = Status::find(&tracker, &id).await.unwrap().unwrap();
        assert_eq!(status.id(), id);
        assert_eq!(status.state(), State::Unqueued);
        assert_eq!(status.progress(), 0.0);
        assert!(status.data().is_none());

        assert!(Status::find(&tracker, "blah").await.unwrap().is_none());
        assert!(Status::find(&tracker, "").await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_find_or_create_materializes_unknown() {
        let (tracker, _) = tracker();
        let status = Status::find_or_create(&tracker, "blah").await.unwrap();
        assert_eq!(status.id(), "blah");
        assert!(status.is_unknown());
        assert!(status.recorded_at().is_some());

        let again = Status::find_or_create(&tracker, "blah").await.unwrap();
        assert_eq!(again.recorded_at(), status.recorded_at());
        assert_eq!(tracker.where_("state", json!("unknown")).unwrap().ids().await.unwrap(), vec!["blah"]);
    }

    #[tokio::test]
    async fn test_progresses_through_states() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        let recorded_at = status.recorded_at();
        assert!(status.is_incomplete());

        status.queued().await.unwrap();
        assert!(status.is_queued());
        assert!(status.queued_at().is_some());
        assert_eq!(status.recorded_at(), recorded_at);

        let mut status = Status::find(&tracker, status.id()).await.unwrap().unwrap();
        assert!(status.is_queued());
        assert!(status.queued_at().is_some());

        status.started().await.unwrap();
        assert!(status.is_started());
        assert!(status.started_at().is_some());
        assert!(status.is_incomplete());

        status.succeeded().await.unwrap();
        assert!(status.is_succeeded());
        assert!(status.succeeded_at().is_some());
        assert!(status.is_completed());
        assert_eq!(status.progress(), 1.0);
    }

    #[tokio::test]
    async fn test_reentering_keeps_timestamp() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        status.queued().await.unwrap();
        let queued_at = status.queued_at();
        status.queued().await.unwrap();
        assert_eq!(status.queued_at(), queued_at);
        status.reload().await.unwrap();
        assert_eq!(status.queued_at(), queued_at);
    }

    #[tokio::test]
    async fn test_revisiting_state_keeps_first_timestamp() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        status.queued().await.unwrap().killed().await.unwrap();
        let queued_at = status.queued_at();
        status.queued().await.unwrap();
        assert!(status.is_queued());
        assert_eq!(status.queued_at(), queued_at);
    }

    #[tokio::test]
    async fn test_unknown_is_not_enterable() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        assert!(status.enter(State::Unknown).await.unwrap_err().is_validation());
        assert!(status.is_unqueued());
    }

    #[tokio::test]
    async fn test_succeeded_forces_full_progress() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        status.set_progress(0.3, None).await.unwrap();
        status.succeeded().await.unwrap();
        assert_eq!(status.progress(), 1.0);
        status.set_progress(0.5, None).await.unwrap();
        assert_eq!(status.progress(), 1.0);
        status.reload().await.unwrap();
        assert_eq!(status.progress(), 1.0);
    }

    #[tokio::test]
    async fn test_progress() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        status.set_progress(0.1, None).await.unwrap();
        assert_eq!(status.progress(), 0.1);
        status.reload().await.unwrap();
        assert_eq!(status.progress(), 0.1);
        status.set_progress(1.0, Some(5.0)).await.unwrap();
        assert_eq!(status.progress(), 0.2);

        assert!(status.set_progress(-0.5, None).await.unwrap_err().is_validation());
        assert!(status.set_progress(5.0, Some(1.0)).await.unwrap_err().is_validation());
        assert!(status.set_progress(2.0, None).await.unwrap_err().is_validation());
        assert!(status.set_progress(0.0, Some(0.0)).await.unwrap_err().is_validation());
        assert_eq!(status.progress(), 0.2);
    }

    #[tokio::test]
    async fn test_save_data() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        for data in [json!("some string"), json!([1, "2", {"a": 4}]), json!({"c": "howdy"})] {
            status.save(data.clone()).await.unwrap();
            assert_eq!(status.data(), Some(&data));
            let found = Status::find(&tracker, status.id()).await.unwrap().unwrap();
            assert_eq!(found.data(), Some(&data));
        }
        status.save(Value::Null).await.unwrap();
        assert!(status.data().is_none());
        status.reload().await.unwrap();
        assert!(status.data().is_none());
    }

    #[tokio::test]
    async fn test_add_error() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        status.add_error(json!({"code": 1, "message": "boom"})).await.unwrap();
        status.add_error(json!("second")).await.unwrap();
        status.reload().await.unwrap();
        assert_eq!(status.errors(), &[json!({"code": 1, "message": "boom"}), json!("second")]);
    }

    #[tokio::test]
    async fn test_request_kill_is_idempotent() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        assert!(!status.kill_requested());

        status.request_kill().await.unwrap();
        let first = status.kill_requested_at();
        assert!(first.is_some());
        assert!(status.is_unqueued());

        status.request_kill().await.unwrap();
        assert_eq!(status.kill_requested_at(), first);

        // a stale copy picks up the stored timestamp
        let mut other = Status::find(&tracker, status.id()).await.unwrap().unwrap();
        assert_eq!(other.kill_requested_at(), first);
        other.request_kill().await.unwrap();
        assert_eq!(other.kill_requested_at(), first);
        assert!(other.is_unqueued());
    }

    #[tokio::test]
    async fn test_restart() {
        let (tracker, _) = tracker();
        let mut status = make_status(&tracker, Some("job"), Some(State::Started)).await;
        status.set_job_name("fluffy").await.unwrap();
        status.set_progress(0.5, None).await.unwrap();
        status.add_error(json!("oops")).await.unwrap();
        status.save(json!({"k": "v"})).await.unwrap();
        let recorded_at = status.recorded_at();
        let queued_at = status.queued_at();
        let first_started_at = status.started_at();

        status.started().await.unwrap();

        assert_eq!(status.attempt(), 1);
        assert!(status.is_started());
        assert_eq!(status.progress(), 0.0);
        assert!(status.errors().is_empty());
        assert!(status.data().is_none());
        assert_eq!(status.id(), "job");
        assert_eq!(status.recorded_at(), recorded_at);
        assert_eq!(status.queued_at(), queued_at);
        assert_ne!(status.started_at(), first_started_at);
        assert_eq!(status.job_name(), Some("fluffy"));

        let reloaded = Status::find(&tracker, "job").await.unwrap().unwrap();
        assert_eq!(reloaded.attempt(), 1);
        assert_eq!(reloaded.recorded_at(), recorded_at);
        assert_eq!(reloaded.queued_at(), queued_at);
        assert!(reloaded.data().is_none());

        let archived = Status::find(&tracker, "job:0").await.unwrap().unwrap();
        assert_eq!(archived.id(), "job:0");
        assert_eq!(archived.attempt(), 0);
        assert_eq!(archived.progress(), 0.5);
        assert_eq!(archived.data(), Some(&json!({"k": "v"})));
        assert_eq!(archived.started_at(), first_started_at);

        let prior = status.prior_attempts().await.unwrap();
        assert_eq!(prior.len(), 1);
        assert_eq!(prior[0].id(), "job:0");
    }

    #[tokio::test]
    async fn test_restart_after_completion_clears_completion_indexes() {
        let (tracker, _) = tracker();
        let mut status = make_status(&tracker, Some("job"), Some(State::Failed)).await;
        status.started().await.unwrap();
        assert_eq!(status.attempt(), 1);
        assert!(status.failed_at().is_none());
        assert!(tracker.where_("failed_at", json!([null, null])).unwrap().ids().await.unwrap().is_empty());
        assert!(tracker.where_("state", json!("failed")).unwrap().ids().await.unwrap().is_empty());
        assert_eq!(tracker.where_("state", json!("started")).unwrap().ids().await.unwrap(), vec!["job"]);
    }

    #[tokio::test]
    async fn test_delete_requires_completion() {
        let (tracker, _) = tracker();
        let status = make_status(&tracker, Some("q"), Some(State::Queued)).await;
        let err = status.delete().await.unwrap_err();
        assert!(matches!(err, StatusError::NotCompleted(_)));
        assert!(Status::find(&tracker, "q").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let (tracker, memory) = tracker();
        let mut status = make_status(&tracker, Some("job"), Some(State::Started)).await;
        status.set_job_name("fluffy").await.unwrap();
        status.set_job_args([("a", "A"), ("b", "B")]).await.unwrap();
        status.set_provider_job_id(42).await.unwrap();
        status.started().await.unwrap();
        status.started().await.unwrap();
        status.succeeded().await.unwrap();
        assert_eq!(status.prior_attempts().await.unwrap().len(), 2);

        status.delete().await.unwrap();

        assert!(memory.keys().await.is_empty());
        assert!(Status::find(&tracker, "job").await.unwrap().is_none());
        assert!(Status::find(&tracker, "job:0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_forced_on_incomplete() {
        let (tracker, memory) = tracker();
        let status = make_status(&tracker, Some("q"), Some(State::Queued)).await;
        status.delete_forced().await.unwrap();
        assert!(memory.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_of_deleted_record() {
        let (tracker, _) = tracker();
        let mut status = make_status(&tracker, Some("gone"), Some(State::Failed)).await;
        status.delete().await.unwrap();
        assert!(matches!(status.reload().await.unwrap_err(), StatusError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_blank_metadata_is_rejected() {
        let (tracker, _) = tracker();
        let mut status = Status::create(&tracker).await.unwrap();
        assert!(status.set_job_name("").await.unwrap_err().is_validation());
        assert!(status.set_provider_job_id("  ").await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_restart_refuses_exhausted_attempt_counter() {
        let (tracker, _) = tracker();
        let mut status = make_status(&tracker, Some("worn"), Some(State::Started)).await;
        tracker
            .store()
            .run(Command::HSet {
                key: keys::job_key("worn"),
                fields: vec![(ATTEMPT.to_string(), u32::MAX.to_string())],
            })
            .await
            .unwrap();
        status.reload().await.unwrap();
        assert_eq!(status.attempt(), u32::MAX);

        assert!(status.started().await.unwrap_err().is_validation());
        assert!(Status::find(&tracker, &keys::attempt_id("worn", u32::MAX)).await.unwrap().is_none());
        let stored = Status::find(&tracker, "worn").await.unwrap().unwrap();
        assert_eq!(stored.attempt(), u32::MAX);
        assert!(stored.is_started());
    }

    #[tokio::test]
    async fn test_request_kill_after_other_writer() {
        let (tracker, _) = tracker();
        let mut mine = make_status(&tracker, Some("k"), Some(State::Queued)).await;
        let mut theirs = Status::find(&tracker, "k").await.unwrap().unwrap();
        theirs.request_kill().await.unwrap();

        assert!(!mine.kill_requested());
        mine.request_kill().await.unwrap();
        assert_eq!(mine.kill_requested_at(), theirs.kill_requested_at());
    }

    #[test]
    fn test_decode_requires_id() {
        let (tracker, _) = tracker();
        let mut raw = FxHashMap::default();
        raw.insert("state".to_string(), "\"queued\"".to_string());
        assert!(Status::from_raw(&tracker, &raw).unwrap_err().is_store());
    }
}
