//! Job Status: lifecycle tracking and ad-hoc queries over a key-value store
//!
//! This crate records the state of asynchronous jobs in a Redis-style
//! key-value store and answers queries over them ("every queued job",
//! "jobs that failed between T1 and T2", "jobs carrying argument X")
//! without a secondary database. Secondary indexes are plain sets and
//! sorted sets maintained alongside each record in the same atomic batch.
//!
//! # Overview
//!
//! - A [`Tracker`] bundles the [`Store`], a [`Clock`] and the [`Config`]
//! - A [`Status`] is one job's record and its state machine
//! - A [`Query`] composes predicates built from `(field, value)` terms
//! - A [`StatusCollection`] is the lazily hydrated result of a query
//! - [`StatusError`] classifies validation, domain-rule and store failures
//!
//! # Usage
//!
//! ```ignore
//! use jobstatus::{Config, Tracker};
//! use serde_json::json;
//!
//! let tracker = Tracker::in_memory(Config::default());
//! let mut status = tracker.create().await?;
//! status.set_job_name("import").await?;
//! status.queued().await?.started().await?;
//!
//! let running = tracker
//!     .where_("state", json!("started"))?
//!     .where_("job_name", json!("import"))?
//!     .count()
//!     .await?;
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   unknown ──┐
//!             ├──→ unqueued ──→ queued ──→ started ──→ succeeded | failed
//!   create() ─┘                              │  ↑            killed
//!                                            └──┘ restart (archives id:<id>:<attempt>)
//! ```

pub mod clause;
pub mod clause_factory;
pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod query;
pub mod state;
pub mod status;
pub mod statuses;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod test_support;

pub use clause::{Clause, ClauseBuilder, IdClause, Predicate};
pub use clock::{Clock, ManualClock, SystemClock, TimeInput};
pub use config::Config;
pub use error::{StatusError, StatusResult};
pub use query::Query;
pub use state::State;
pub use status::Status;
pub use statuses::StatusCollection;
pub use store::{Command, MemoryStore, Reply, Store, StoreError, StoreResult};
pub use tracker::Tracker;
