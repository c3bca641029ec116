//! Key-value store contract.
//!
//! The engine talks to its store exclusively through atomic batches of
//! [`Command`]s. A batch is all-or-nothing from the point of view of other
//! clients; replies come back in command order.
//!
//! ```text
//!   Tracker ──→ NamespacedStore ──→ ExpiringStore ──→ MemoryStore | RedisStore
//!               (key prefix)        (TTL refresh)
//! ```
//!
//! | Family | Commands |
//! |--------|----------|
//! | Hash | `HGetAll`, `HGet`, `HSet`, `HSetNx` |
//! | Keys | `Del`, `Exists`, `Rename`, `Expire` |
//! | Set | `SAdd`, `SRem`, `SMembers`, `SCard` |
//! | Sorted set | `ZAdd`, `ZRem`, `ZCard`, `ZCount`, `ZRangeByScore`, `ZRange`, `ZRemRangeByScore`, `ZRemRangeByRank` |
//! | Set algebra | `ZUnionStore`, `ZInterStore` |

pub mod expiring;
pub mod memory;
pub mod namespaced;
#[cfg(feature = "redis")]
pub mod redis_store;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use thiserror::Error;

pub use expiring::ExpiringStore;
pub use memory::MemoryStore;
pub use namespaced::NamespacedStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Failures reported by a store driver.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached or the connection dropped.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command was applied to a key holding another type.
    #[error("WRONGTYPE operation against key {0}")]
    WrongType(String),

    /// A command required a key that does not exist.
    #[error("No such key: {0}")]
    NoSuchKey(String),

    /// The reply did not have the shape the command implies.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Any other command failure reported by the driver.
    #[error("Command failed: {0}")]
    Command(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One end of a score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    PosInf,
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    /// Inclusive lower bound, or `-inf` when absent.
    pub fn min(score: Option<i64>) -> Self {
        score.map_or(Self::NegInf, |s| Self::Inclusive(s as f64))
    }

    /// Inclusive upper bound, or `+inf` when absent.
    pub fn max(score: Option<i64>) -> Self {
        score.map_or(Self::PosInf, |s| Self::Inclusive(s as f64))
    }

    /// Whether `score` lies on the admitted side of this bound used as a minimum.
    pub fn admits_from_below(self, score: f64) -> bool {
        match self {
            Self::NegInf => true,
            Self::PosInf => false,
            Self::Inclusive(b) => score >= b,
            Self::Exclusive(b) => score > b,
        }
    }

    /// Whether `score` lies on the admitted side of this bound used as a maximum.
    pub fn admits_from_above(self, score: f64) -> bool {
        match self {
            Self::NegInf => false,
            Self::PosInf => true,
            Self::Inclusive(b) => score <= b,
            Self::Exclusive(b) => score < b,
        }
    }
}

impl fmt::Display for ScoreBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegInf => write!(f, "-inf"),
            Self::PosInf => write!(f, "+inf"),
            Self::Inclusive(s) => write!(f, "{s}"),
            Self::Exclusive(s) => write!(f, "({s}"),
        }
    }
}

/// A single store command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    HGetAll { key: String },
    HGet { key: String, field: String },
    /// Write several fields at once.
    HSet { key: String, fields: Vec<(String, String)> },
    /// Write a field only if it is absent. Replies `Int(1)` when written.
    HSetNx { key: String, field: String, value: String },
    Del { keys: Vec<String> },
    Exists { key: String },
    /// Fails with [`StoreError::NoSuchKey`] when `from` is missing.
    Rename { from: String, to: String },
    Expire { key: String, seconds: u64 },
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    SMembers { key: String },
    SCard { key: String },
    ZAdd { key: String, members: Vec<(f64, String)> },
    ZRem { key: String, members: Vec<String> },
    ZCard { key: String },
    ZCount { key: String, min: ScoreBound, max: ScoreBound },
    /// Members ordered by score; `limit` is `(offset, count)`.
    ZRangeByScore {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
        limit: Option<(usize, usize)>,
    },
    /// Members by rank; negative indexes count from the end.
    ZRange { key: String, start: i64, stop: i64 },
    ZRemRangeByScore { key: String, min: ScoreBound, max: ScoreBound },
    ZRemRangeByRank { key: String, start: i64, stop: i64 },
    /// Union of sets and sorted sets (plain set members score 1, scores summed).
    ZUnionStore { dest: String, keys: Vec<String> },
    ZInterStore { dest: String, keys: Vec<String> },
}

impl Command {
    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { keys: vec![key.into()] }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SAdd { key: key.into(), members: vec![member.into()] }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SRem { key: key.into(), members: vec![member.into()] }
    }

    pub fn zadd(key: impl Into<String>, score: f64, member: impl Into<String>) -> Self {
        Self::ZAdd { key: key.into(), members: vec![(score, member.into())] }
    }

    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::ZRem { key: key.into(), members: vec![member.into()] }
    }

    /// Whether the command modifies the key it targets.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::HSet { .. }
                | Self::HSetNx { .. }
                | Self::SAdd { .. }
                | Self::SRem { .. }
                | Self::ZAdd { .. }
                | Self::ZRem { .. }
                | Self::ZRemRangeByScore { .. }
                | Self::ZRemRangeByRank { .. }
                | Self::ZUnionStore { .. }
                | Self::ZInterStore { .. }
        )
    }

    /// The key a mutating command writes to.
    pub fn written_key(&self) -> Option<&str> {
        match self {
            Self::HSet { key, .. }
            | Self::HSetNx { key, .. }
            | Self::SAdd { key, .. }
            | Self::SRem { key, .. }
            | Self::ZAdd { key, .. }
            | Self::ZRem { key, .. }
            | Self::ZRemRangeByScore { key, .. }
            | Self::ZRemRangeByRank { key, .. } => Some(key),
            Self::ZUnionStore { dest, .. } | Self::ZInterStore { dest, .. } => Some(dest),
            _ => None,
        }
    }

    /// Rewrite every key the command touches.
    pub fn map_keys(self, f: impl Fn(String) -> String) -> Self {
        match self {
            Self::HGetAll { key } => Self::HGetAll { key: f(key) },
            Self::HGet { key, field } => Self::HGet { key: f(key), field },
            Self::HSet { key, fields } => Self::HSet { key: f(key), fields },
            Self::HSetNx { key, field, value } => Self::HSetNx { key: f(key), field, value },
            Self::Del { keys } => Self::Del { keys: keys.into_iter().map(&f).collect() },
            Self::Exists { key } => Self::Exists { key: f(key) },
            Self::Rename { from, to } => Self::Rename { from: f(from), to: f(to) },
            Self::Expire { key, seconds } => Self::Expire { key: f(key), seconds },
            Self::SAdd { key, members } => Self::SAdd { key: f(key), members },
            Self::SRem { key, members } => Self::SRem { key: f(key), members },
            Self::SMembers { key } => Self::SMembers { key: f(key) },
            Self::SCard { key } => Self::SCard { key: f(key) },
            Self::ZAdd { key, members } => Self::ZAdd { key: f(key), members },
            Self::ZRem { key, members } => Self::ZRem { key: f(key), members },
            Self::ZCard { key } => Self::ZCard { key: f(key) },
            Self::ZCount { key, min, max } => Self::ZCount { key: f(key), min, max },
            Self::ZRangeByScore { key, min, max, limit } => Self::ZRangeByScore {
                key: f(key),
                min,
                max,
                limit,
            },
            Self::ZRange { key, start, stop } => Self::ZRange { key: f(key), start, stop },
            Self::ZRemRangeByScore { key, min, max } => {
                Self::ZRemRangeByScore { key: f(key), min, max }
            }
            Self::ZRemRangeByRank { key, start, stop } => {
                Self::ZRemRangeByRank { key: f(key), start, stop }
            }
            Self::ZUnionStore { dest, keys } => Self::ZUnionStore {
                dest: f(dest),
                keys: keys.into_iter().map(&f).collect(),
            },
            Self::ZInterStore { dest, keys } => Self::ZInterStore {
                dest: f(dest),
                keys: keys.into_iter().map(&f).collect(),
            },
        }
    }
}

/// A reply to one [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Bulk(String),
    Array(Vec<Reply>),
    Map(FxHashMap<String, String>),
}

impl Reply {
    pub fn into_int(self) -> StoreResult<i64> {
        match self {
            Reply::Int(i) => Ok(i),
            Reply::Bulk(s) => s
                .parse()
                .map_err(|_| StoreError::UnexpectedReply(format!("expected integer, got {s:?}"))),
            other => Err(StoreError::UnexpectedReply(format!("expected integer, got {other:?}"))),
        }
    }

    pub fn into_count(self) -> StoreResult<usize> {
        let n = self.into_int()?;
        usize::try_from(n).map_err(|_| StoreError::UnexpectedReply(format!("negative count {n}")))
    }

    pub fn into_bool(self) -> StoreResult<bool> {
        Ok(self.into_int()? != 0)
    }

    pub fn into_opt_string(self) -> StoreResult<Option<String>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Bulk(s) => Ok(Some(s)),
            other => Err(StoreError::UnexpectedReply(format!("expected string, got {other:?}"))),
        }
    }

    pub fn into_members(self) -> StoreResult<Vec<String>> {
        match self {
            Reply::Nil => Ok(Vec::new()),
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(s) => Ok(s),
                    other => Err(StoreError::UnexpectedReply(format!(
                        "expected member, got {other:?}"
                    ))),
                })
                .collect(),
            other => Err(StoreError::UnexpectedReply(format!("expected array, got {other:?}"))),
        }
    }

    pub fn into_map(self) -> StoreResult<FxHashMap<String, String>> {
        match self {
            Reply::Nil => Ok(FxHashMap::default()),
            Reply::Map(map) => Ok(map),
            other => Err(StoreError::UnexpectedReply(format!("expected hash, got {other:?}"))),
        }
    }
}

/// A key-value store that executes atomic command batches.
#[async_trait]
pub trait Store: Send + Sync {
    /// Execute `commands` as one atomic batch and return their replies in order.
    async fn exec(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>>;

    /// Execute a single command.
    async fn run(&self, command: Command) -> StoreResult<Reply> {
        self.exec(vec![command])
            .await?
            .pop()
            .ok_or_else(|| StoreError::UnexpectedReply("empty batch reply".into()))
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn exec(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        (**self).exec(commands).await
    }
}
