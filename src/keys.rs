//! Key naming.
//!
//! | Purpose | Key | Type |
//! |---|---|---|
//! | Job record | `id:<id>`, archives `id:<id>:<attempt>` | hash |
//! | State membership | `<state>` | set |
//! | State timestamp index | `<timestamp name>` | sorted set (score = µs) |
//! | Job name index | `job_name:<name>` | set |
//! | Job argument index | `job_arg:<value>` | set |
//! | Provider id index | `provider_job_id:<value>` | set |
//! | Query scratch space | `temp:<hex>` | sorted set |
//!
//! The namespace prefix is applied by the store decorator, not here.

use crate::clock;

pub const JOB_NAME_PREFIX: &str = "job_name";
pub const JOB_ARG_PREFIX: &str = "job_arg";
pub const PROVIDER_JOB_ID_PREFIX: &str = "provider_job_id";

/// Hash holding one job record.
pub fn job_key(id: &str) -> String {
    format!("id:{id}")
}

/// Id under which an archived attempt is addressable.
pub fn attempt_id(id: &str, attempt: u32) -> String {
    format!("{id}:{attempt}")
}

/// Set of ids carrying a job name.
pub fn job_name_key(name: &str) -> String {
    prefixed(JOB_NAME_PREFIX, name)
}

/// Set of ids with a job argument of this value.
pub fn job_arg_key(value: &str) -> String {
    prefixed(JOB_ARG_PREFIX, value)
}

/// Set of ids assigned this provider id.
pub fn provider_job_id_key(value: &str) -> String {
    prefixed(PROVIDER_JOB_ID_PREFIX, value)
}

/// `<prefix>:<suffix>`.
pub fn prefixed(prefix: &str, suffix: &str) -> String {
    format!("{prefix}:{suffix}")
}

/// Fresh throwaway key for query composition.
pub fn temp_key() -> String {
    format!("temp:{}", clock::random_hex())
}

/// Timestamp indexes (bare `*_at` names) are sorted sets; every other
/// index is a plain set.
pub fn is_sorted_key(key: &str) -> bool {
    !key.contains(':') && key.ends_with("_at")
}
