//! Redis driver (cargo feature `redis`).
//!
//! Batches are sent as `MULTI`/`EXEC` pipelines over a multiplexed
//! connection, which is cheap to clone per call.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::trace;

use super::{Command, Reply, Store, StoreError, StoreResult};

pub struct RedisStore {
    conn: ::redis::aio::MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Connection(err.to_string())
        } else if err.code() == Some("WRONGTYPE") {
            StoreError::WrongType(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

impl RedisStore {
    /// Open a multiplexed connection to `url`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

fn to_cmd(command: &Command) -> ::redis::Cmd {
    let mut cmd;
    match command {
        Command::HGetAll { key } => {
            cmd = ::redis::cmd("HGETALL");
            cmd.arg(key);
        }
        Command::HGet { key, field } => {
            cmd = ::redis::cmd("HGET");
            cmd.arg(key).arg(field);
        }
        Command::HSet { key, fields } => {
            cmd = ::redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
        }
        Command::HSetNx { key, field, value } => {
            cmd = ::redis::cmd("HSETNX");
            cmd.arg(key).arg(field).arg(value);
        }
        Command::Del { keys } => {
            cmd = ::redis::cmd("DEL");
            cmd.arg(keys);
        }
        Command::Exists { key } => {
            cmd = ::redis::cmd("EXISTS");
            cmd.arg(key);
        }
        Command::Rename { from, to } => {
            cmd = ::redis::cmd("RENAME");
            cmd.arg(from).arg(to);
        }
        Command::Expire { key, seconds } => {
            cmd = ::redis::cmd("EXPIRE");
            cmd.arg(key).arg(*seconds);
        }
        Command::SAdd { key, members } => {
            cmd = ::redis::cmd("SADD");
            cmd.arg(key).arg(members);
        }
        Command::SRem { key, members } => {
            cmd = ::redis::cmd("SREM");
            cmd.arg(key).arg(members);
        }
        Command::SMembers { key } => {
            cmd = ::redis::cmd("SMEMBERS");
            cmd.arg(key);
        }
        Command::SCard { key } => {
            cmd = ::redis::cmd("SCARD");
            cmd.arg(key);
        }
        Command::ZAdd { key, members } => {
            cmd = ::redis::cmd("ZADD");
            cmd.arg(key);
            for (score, member) in members {
                cmd.arg(score.to_string()).arg(member);
            }
        }
        Command::ZRem { key, members } => {
            cmd = ::redis::cmd("ZREM");
            cmd.arg(key).arg(members);
        }
        Command::ZCard { key } => {
            cmd = ::redis::cmd("ZCARD");
            cmd.arg(key);
        }
        Command::ZCount { key, min, max } => {
            cmd = ::redis::cmd("ZCOUNT");
            cmd.arg(key).arg(min.to_string()).arg(max.to_string());
        }
        Command::ZRangeByScore { key, min, max, limit } => {
            cmd = ::redis::cmd("ZRANGEBYSCORE");
            cmd.arg(key).arg(min.to_string()).arg(max.to_string());
            if let Some((offset, count)) = limit {
                cmd.arg("LIMIT").arg(*offset).arg(i64::try_from(*count).unwrap_or(-1));
            }
        }
        Command::ZRange { key, start, stop } => {
            cmd = ::redis::cmd("ZRANGE");
            cmd.arg(key).arg(*start).arg(*stop);
        }
        Command::ZRemRangeByScore { key, min, max } => {
            cmd = ::redis::cmd("ZREMRANGEBYSCORE");
            cmd.arg(key).arg(min.to_string()).arg(max.to_string());
        }
        Command::ZRemRangeByRank { key, start, stop } => {
            cmd = ::redis::cmd("ZREMRANGEBYRANK");
            cmd.arg(key).arg(*start).arg(*stop);
        }
        Command::ZUnionStore { dest, keys } => {
            cmd = ::redis::cmd("ZUNIONSTORE");
            cmd.arg(dest).arg(keys.len()).arg(keys);
        }
        Command::ZInterStore { dest, keys } => {
            cmd = ::redis::cmd("ZINTERSTORE");
            cmd.arg(dest).arg(keys.len()).arg(keys);
        }
    }
    cmd
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn to_reply(value: ::redis::Value) -> StoreResult<Reply> {
    use ::redis::Value;
    Ok(match value {
        Value::Nil => Reply::Nil,
        Value::Okay => Reply::Ok,
        Value::Int(i) => Reply::Int(i),
        Value::BulkString(bytes) => Reply::Bulk(text(&bytes)),
        Value::SimpleString(s) => Reply::Bulk(s),
        Value::Boolean(b) => Reply::Int(i64::from(b)),
        Value::Double(d) => Reply::Bulk(d.to_string()),
        Value::Array(items) | Value::Set(items) => {
            Reply::Array(items.into_iter().map(to_reply).collect::<StoreResult<_>>()?)
        }
        Value::Map(pairs) => {
            let mut map = FxHashMap::default();
            for (k, v) in pairs {
                map.insert(scalar(k)?, scalar(v)?);
            }
            Reply::Map(map)
        }
        other => {
            return Err(StoreError::UnexpectedReply(format!("{other:?}")));
        }
    })
}

fn scalar(value: ::redis::Value) -> StoreResult<String> {
    match to_reply(value)? {
        Reply::Bulk(s) => Ok(s),
        Reply::Int(i) => Ok(i.to_string()),
        other => Err(StoreError::UnexpectedReply(format!("expected scalar, got {other:?}"))),
    }
}

/// HGETALL answers with a flat field/value array under RESP2.
fn hash_reply(reply: Reply) -> StoreResult<Reply> {
    match reply {
        Reply::Array(items) => {
            let mut map = FxHashMap::default();
            let mut items = items.into_iter();
            while let (Some(field), Some(value)) = (items.next(), items.next()) {
                match (field, value) {
                    (Reply::Bulk(f), Reply::Bulk(v)) => {
                        map.insert(f, v);
                    }
                    other => {
                        return Err(StoreError::UnexpectedReply(format!(
                            "expected field/value pair, got {other:?}"
                        )));
                    }
                }
            }
            Ok(Reply::Map(map))
        }
        other => Ok(other),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn exec(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        trace!(commands = commands.len(), "redis: exec batch");
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for command in &commands {
            pipe.add_command(to_cmd(command));
        }
        let mut conn = self.conn.clone();
        let values: Vec<::redis::Value> = pipe.query_async(&mut conn).await?;
        if values.len() != commands.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                commands.len(),
                values.len()
            )));
        }
        commands
            .iter()
            .zip(values)
            .map(|(command, value)| {
                let reply = to_reply(value)?;
                match command {
                    Command::HGetAll { .. } => hash_reply(reply),
                    _ => Ok(reply),
                }
            })
            .collect()
    }
}
