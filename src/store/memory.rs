//! In-process store with Redis command semantics.
//!
//! Each batch runs under one lock and is rolled back from a snapshot if any
//! command fails, so a batch is all-or-nothing. Expirations are recorded but
//! never fire; [`MemoryStore::ttl`] exposes them for inspection.

use std::collections::BTreeSet;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

use super::{Command, Reply, ScoreBound, Store, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Entry {
    Hash(FxHashMap<String, String>),
    Set(BTreeSet<String>),
    ZSet(FxHashMap<String, f64>),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::Hash(h) => h.is_empty(),
            Entry::Set(s) => s.is_empty(),
            Entry::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Keyspace {
    entries: FxHashMap<String, Entry>,
    expirations: FxHashMap<String, u64>,
}

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All live keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let keyspace = self.keyspace.lock().await;
        let mut keys: Vec<String> = keyspace.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Expiration last applied to `key`, in seconds.
    pub async fn ttl(&self, key: &str) -> Option<u64> {
        self.keyspace.lock().await.expirations.get(key).copied()
    }

    /// Drop every key.
    pub async fn flush(&self) {
        *self.keyspace.lock().await = Keyspace::default();
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn exec(&self, commands: Vec<Command>) -> StoreResult<Vec<Reply>> {
        let mut keyspace = self.keyspace.lock().await;
        let snapshot = keyspace.clone();
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            match keyspace.apply(command) {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    *keyspace = snapshot;
                    return Err(err);
                }
            }
        }
        Ok(replies)
    }
}

fn ordered(zset: &FxHashMap<String, f64>) -> Vec<(&str, f64)> {
    let mut members: Vec<(&str, f64)> = zset.iter().map(|(m, s)| (m.as_str(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    members
}

/// Resolve Redis-style rank indexes (negative counts from the end).
fn rank_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
    if start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn bulk_array<'a>(members: impl IntoIterator<Item = &'a str>) -> Reply {
    Reply::Array(members.into_iter().map(|m| Reply::Bulk(m.to_string())).collect())
}

impl Keyspace {
    fn hash(&self, key: &str) -> StoreResult<Option<&FxHashMap<String, String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut FxHashMap<String, String>> {
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(FxHashMap::default()))
        {
            Entry::Hash(h) => Ok(h),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set(&self, key: &str) -> StoreResult<Option<&BTreeSet<String>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::Set(s)) => Ok(Some(s)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_mut(&mut self, key: &str) -> StoreResult<&mut BTreeSet<String>> {
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()))
        {
            Entry::Set(s) => Ok(s),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset(&self, key: &str) -> StoreResult<Option<&FxHashMap<String, f64>>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(Entry::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset_mut(&mut self, key: &str) -> StoreResult<&mut FxHashMap<String, f64>> {
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::ZSet(FxHashMap::default()))
        {
            Entry::ZSet(z) => Ok(z),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Members of a set or sorted set with their scores (plain sets score 1).
    fn scored_members(&self, key: &str) -> StoreResult<FxHashMap<String, f64>> {
        match self.entries.get(key) {
            None => Ok(FxHashMap::default()),
            Some(Entry::Set(s)) => Ok(s.iter().map(|m| (m.clone(), 1.0)).collect()),
            Some(Entry::ZSet(z)) => Ok(z.clone()),
            Some(Entry::Hash(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Empty collections do not exist.
    fn prune(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(Entry::is_empty) {
            self.entries.remove(key);
            self.expirations.remove(key);
        }
    }

    fn store_zset(&mut self, dest: String, members: FxHashMap<String, f64>) -> Reply {
        let len = members.len() as i64;
        self.expirations.remove(&dest);
        if members.is_empty() {
            self.entries.remove(&dest);
        } else {
            self.entries.insert(dest, Entry::ZSet(members));
        }
        Reply::Int(len)
    }

    fn apply(&mut self, command: Command) -> StoreResult<Reply> {
        match command {
            Command::HGetAll { key } => {
                Ok(Reply::Map(self.hash(&key)?.cloned().unwrap_or_default()))
            }
            Command::HGet { key, field } => Ok(self
                .hash(&key)?
                .and_then(|h| h.get(&field))
                .map_or(Reply::Nil, |v| Reply::Bulk(v.clone()))),
            Command::HSet { key, fields } => {
                let hash = self.hash_mut(&key)?;
                let mut added = 0;
                for (field, value) in fields {
                    if hash.insert(field, value).is_none() {
                        added += 1;
                    }
                }
                self.prune(&key);
                Ok(Reply::Int(added))
            }
            Command::HSetNx { key, field, value } => {
                let hash = self.hash_mut(&key)?;
                let written = !hash.contains_key(&field);
                if written {
                    hash.insert(field, value);
                }
                Ok(Reply::Int(i64::from(written)))
            }
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    if self.entries.remove(&key).is_some() {
                        removed += 1;
                    }
                    self.expirations.remove(&key);
                }
                Ok(Reply::Int(removed))
            }
            Command::Exists { key } => Ok(Reply::Int(i64::from(self.entries.contains_key(&key)))),
            Command::Rename { from, to } => {
                let entry = self
                    .entries
                    .remove(&from)
                    .ok_or_else(|| StoreError::NoSuchKey(from.clone()))?;
                let ttl = self.expirations.remove(&from);
                self.expirations.remove(&to);
                if let Some(ttl) = ttl {
                    self.expirations.insert(to.clone(), ttl);
                }
                self.entries.insert(to, entry);
                Ok(Reply::Ok)
            }
            Command::Expire { key, seconds } => {
                if self.entries.contains_key(&key) {
                    self.expirations.insert(key, seconds);
                    Ok(Reply::Int(1))
                } else {
                    Ok(Reply::Int(0))
                }
            }
            Command::SAdd { key, members } => {
                let set = self.set_mut(&key)?;
                let mut added = 0;
                for member in members {
                    if set.insert(member) {
                        added += 1;
                    }
                }
                self.prune(&key);
                Ok(Reply::Int(added))
            }
            Command::SRem { key, members } => {
                if self.set(&key)?.is_none() {
                    return Ok(Reply::Int(0));
                }
                let set = self.set_mut(&key)?;
                let mut removed = 0;
                for member in &members {
                    if set.remove(member) {
                        removed += 1;
                    }
                }
                self.prune(&key);
                Ok(Reply::Int(removed))
            }
            Command::SMembers { key } => Ok(match self.set(&key)? {
                Some(set) => bulk_array(set.iter().map(String::as_str)),
                None => Reply::Array(Vec::new()),
            }),
            Command::SCard { key } => {
                Ok(Reply::Int(self.set(&key)?.map_or(0, |s| s.len() as i64)))
            }
            Command::ZAdd { key, members } => {
                let zset = self.zset_mut(&key)?;
                let mut added = 0;
                for (score, member) in members {
                    if zset.insert(member, score).is_none() {
                        added += 1;
                    }
                }
                self.prune(&key);
                Ok(Reply::Int(added))
            }
            Command::ZRem { key, members } => {
                if self.zset(&key)?.is_none() {
                    return Ok(Reply::Int(0));
                }
                let zset = self.zset_mut(&key)?;
                let mut removed = 0;
                for member in &members {
                    if zset.remove(member).is_some() {
                        removed += 1;
                    }
                }
                self.prune(&key);
                Ok(Reply::Int(removed))
            }
            Command::ZCard { key } => {
                Ok(Reply::Int(self.zset(&key)?.map_or(0, |z| z.len() as i64)))
            }
            Command::ZCount { key, min, max } => {
                let count = self.zset(&key)?.map_or(0, |z| {
                    z.values()
                        .filter(|s| min.admits_from_below(**s) && max.admits_from_above(**s))
                        .count()
                });
                Ok(Reply::Int(count as i64))
            }
            Command::ZRangeByScore { key, min, max, limit } => {
                let Some(zset) = self.zset(&key)? else {
                    return Ok(Reply::Array(Vec::new()));
                };
                let in_range = ordered(zset)
                    .into_iter()
                    .filter(|(_, s)| min.admits_from_below(*s) && max.admits_from_above(*s))
                    .map(|(m, _)| m);
                Ok(match limit {
                    Some((offset, count)) => bulk_array(in_range.skip(offset).take(count)),
                    None => bulk_array(in_range),
                })
            }
            Command::ZRange { key, start, stop } => {
                let Some(zset) = self.zset(&key)? else {
                    return Ok(Reply::Array(Vec::new()));
                };
                let members = ordered(zset);
                Ok(match rank_range(members.len(), start, stop) {
                    Some((first, last)) => {
                        bulk_array(members[first..=last].iter().map(|(m, _)| *m))
                    }
                    None => Reply::Array(Vec::new()),
                })
            }
            Command::ZRemRangeByScore { key, min, max } => {
                if self.zset(&key)?.is_none() {
                    return Ok(Reply::Int(0));
                }
                let zset = self.zset_mut(&key)?;
                let before = zset.len();
                zset.retain(|_, s| !(min.admits_from_below(*s) && max.admits_from_above(*s)));
                let removed = (before - zset.len()) as i64;
                self.prune(&key);
                Ok(Reply::Int(removed))
            }
            Command::ZRemRangeByRank { key, start, stop } => {
                let doomed: Vec<String> = match self.zset(&key)? {
                    None => return Ok(Reply::Int(0)),
                    Some(zset) => {
                        let members = ordered(zset);
                        match rank_range(members.len(), start, stop) {
                            Some((first, last)) => members[first..=last]
                                .iter()
                                .map(|(m, _)| m.to_string())
                                .collect(),
                            None => Vec::new(),
                        }
                    }
                };
                let zset = self.zset_mut(&key)?;
                for member in &doomed {
                    zset.remove(member);
                }
                self.prune(&key);
                Ok(Reply::Int(doomed.len() as i64))
            }
            Command::ZUnionStore { dest, keys } => {
                let mut union: FxHashMap<String, f64> = FxHashMap::default();
                for key in &keys {
                    for (member, score) in self.scored_members(key)? {
                        *union.entry(member).or_insert(0.0) += score;
                    }
                }
                Ok(self.store_zset(dest, union))
            }
            Command::ZInterStore { dest, keys } => {
                let mut acc: Option<FxHashMap<String, f64>> = None;
                for key in &keys {
                    let members = self.scored_members(key)?;
                    acc = Some(match acc {
                        None => members,
                        Some(prev) => prev
                            .into_iter()
                            .filter_map(|(m, s)| members.get(&m).map(|t| (m, s + t)))
                            .collect(),
                    });
                }
                Ok(self.store_zset(dest, acc.unwrap_or_default()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(reply: Reply) -> Vec<String> {
        reply.into_members().unwrap()
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .exec(vec![
                Command::ZAdd {
                    key: "blah_at".into(),
                    members: vec![
                        (1.0, "a".into()),
                        (2.0, "b".into()),
                        (3.0, "c".into()),
                        (4.0, "d".into()),
                    ],
                },
                Command::SAdd {
                    key: "blah".into(),
                    members: vec!["c".into(), "b".into(), "a".into(), "e".into()],
                },
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_hash_commands() {
        let store = MemoryStore::new();
        let replies = store
            .exec(vec![
                Command::HSet {
                    key: "id:1".into(),
                    fields: vec![("state".into(), "\"queued\"".into())],
                },
                Command::HSetNx {
                    key: "id:1".into(),
                    field: "state".into(),
                    value: "\"started\"".into(),
                },
                Command::HGet { key: "id:1".into(), field: "state".into() },
                Command::HGetAll { key: "id:2".into() },
            ])
            .await
            .unwrap();
        assert_eq!(replies[0], Reply::Int(1));
        assert_eq!(replies[1], Reply::Int(0));
        assert_eq!(replies[2], Reply::Bulk("\"queued\"".into()));
        assert!(replies[3].clone().into_map().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_by_score_is_inclusive_and_limits() {
        let store = seeded().await;
        let reply = store
            .run(Command::ZRangeByScore {
                key: "blah_at".into(),
                min: ScoreBound::Inclusive(2.0),
                max: ScoreBound::PosInf,
                limit: Some((1, 2)),
            })
            .await
            .unwrap();
        assert_eq!(members(reply), vec!["c", "d"]);

        let reply = store
            .run(Command::ZCount {
                key: "blah_at".into(),
                min: ScoreBound::Inclusive(2.0),
                max: ScoreBound::Inclusive(3.0),
            })
            .await
            .unwrap();
        assert_eq!(reply, Reply::Int(2));
    }

    #[tokio::test]
    async fn test_rank_ranges() {
        let store = seeded().await;
        let all = store
            .run(Command::ZRange { key: "blah_at".into(), start: 0, stop: -1 })
            .await
            .unwrap();
        assert_eq!(members(all), vec!["a", "b", "c", "d"]);
        let tail = store
            .run(Command::ZRange { key: "blah_at".into(), start: -2, stop: 10 })
            .await
            .unwrap();
        assert_eq!(members(tail), vec!["c", "d"]);
        let none = store
            .run(Command::ZRange { key: "blah_at".into(), start: 5, stop: 9 })
            .await
            .unwrap();
        assert!(members(none).is_empty());
    }

    #[tokio::test]
    async fn test_union_and_intersection() {
        let store = seeded().await;
        store
            .exec(vec![
                Command::ZUnionStore { dest: "u".into(), keys: vec!["blah".into(), "blah_at".into()] },
                Command::ZInterStore { dest: "i".into(), keys: vec!["blah".into(), "blah_at".into()] },
                Command::ZInterStore { dest: "empty".into(), keys: vec!["blah".into(), "missing".into()] },
            ])
            .await
            .unwrap();
        let union = store.run(Command::ZCard { key: "u".into() }).await.unwrap();
        assert_eq!(union, Reply::Int(5));
        let inter = store
            .run(Command::ZRange { key: "i".into(), start: 0, stop: -1 })
            .await
            .unwrap();
        // scores summed: a=2, b=3, c=4
        assert_eq!(members(inter), vec!["a", "b", "c"]);
        assert!(!store.keys().await.contains(&"empty".to_string()));
    }

    #[tokio::test]
    async fn test_empty_collections_vanish() {
        let store = MemoryStore::new();
        store.run(Command::sadd("queued", "a")).await.unwrap();
        store
            .run(Command::Expire { key: "queued".into(), seconds: 10 })
            .await
            .unwrap();
        assert_eq!(store.ttl("queued").await, Some(10));
        store.run(Command::srem("queued", "a")).await.unwrap();
        assert!(store.keys().await.is_empty());
        assert_eq!(store.ttl("queued").await, None);
    }

    #[tokio::test]
    async fn test_rename_moves_ttl() {
        let store = MemoryStore::new();
        store
            .exec(vec![
                Command::HSet { key: "id:a".into(), fields: vec![("id".into(), "\"a\"".into())] },
                Command::Expire { key: "id:a".into(), seconds: 99 },
                Command::Rename { from: "id:a".into(), to: "id:a:0".into() },
            ])
            .await
            .unwrap();
        assert_eq!(store.keys().await, vec!["id:a:0"]);
        assert_eq!(store.ttl("id:a:0").await, Some(99));
        let err = store
            .run(Command::Rename { from: "id:a".into(), to: "id:b".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSuchKey(_)));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let store = MemoryStore::new();
        store.run(Command::sadd("queued", "a")).await.unwrap();
        let err = store
            .exec(vec![
                Command::sadd("started", "b"),
                Command::HSet { key: "queued".into(), fields: vec![("x".into(), "1".into())] },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongType(_)));
        assert_eq!(store.keys().await, vec!["queued"]);
    }

    #[tokio::test]
    async fn test_remove_ranges() {
        let store = seeded().await;
        let removed = store
            .run(Command::ZRemRangeByScore {
                key: "blah_at".into(),
                min: ScoreBound::NegInf,
                max: ScoreBound::Exclusive(2.0),
            })
            .await
            .unwrap();
        assert_eq!(removed, Reply::Int(1));
        let removed = store
            .run(Command::ZRemRangeByRank { key: "blah_at".into(), start: -1, stop: -1 })
            .await
            .unwrap();
        assert_eq!(removed, Reply::Int(1));
        let rest = store
            .run(Command::ZRange { key: "blah_at".into(), start: 0, stop: -1 })
            .await
            .unwrap();
        assert_eq!(members(rest), vec!["b", "c"]);
    }
}
