//! Translation of `(field, value)` query terms into predicates.
//!
//! | Field | Value | Predicate |
//! |---|---|---|
//! | `state` | name or list of names; `completed` / `incomplete` expand | state sets |
//! | `job_name`, `job_arg`, `provider_job_id` | scalar or list | `<field>:<value>` sets |
//! | `id` | scalar or list | explicit ids |
//! | `<state>_at` | `[after, before]` or `{"after": .., "before": ..}` | timestamp window |
//!
//! Time bounds accept integer microseconds, float seconds, integer strings
//! or RFC 3339 text; `null` leaves that side open.

use serde_json::Value;

use crate::clause::{Clause, IdClause, Predicate};
use crate::clock::{TimeInput, to_usec};
use crate::error::{StatusError, StatusResult};
use crate::keys;
use crate::state::State;

/// Build the predicate for one query term.
pub fn new_clause(field: &str, value: &Value) -> StatusResult<Predicate> {
    if value.is_null() {
        return Err(StatusError::invalid(format!(
            "`{field}` needs a value in a `where` call"
        )));
    }
    match field {
        "state" => state_clause(value),
        keys::JOB_NAME_PREFIX => prefix_clause(field, value, true),
        keys::JOB_ARG_PREFIX => prefix_clause(field, value, false),
        keys::PROVIDER_JOB_ID_PREFIX => prefix_clause(field, value, true),
        "id" => Ok(IdClause::new(scalars(field, value)?).into()),
        _ if field.ends_with("_at") => timestamp_clause(field, value),
        _ => Err(StatusError::invalid(format!(
            "{field} is not a valid key in a `where` call"
        ))),
    }
}

/// The clause matching every recorded job.
pub fn all_clause() -> StatusResult<Predicate> {
    Ok(Clause::builder()
        .keys(State::ALL.iter().map(|s| s.name()))
        .unique(true)
        .build()?
        .into())
}

fn state_clause(value: &Value) -> StatusResult<Predicate> {
    let mut states: Vec<State> = Vec::new();
    for name in scalars("state", value)? {
        let expanded = match name.as_str() {
            "completed" => State::COMPLETED.to_vec(),
            "incomplete" => State::INCOMPLETE.to_vec(),
            other => match State::from_name(other) {
                Some(state) => vec![state],
                None => {
                    return Err(StatusError::invalid(format!("'{other}' is not a valid state")));
                }
            },
        };
        for state in expanded {
            if !states.contains(&state) {
                states.push(state);
            }
        }
    }
    Ok(Clause::builder()
        .keys(states.iter().map(|s| s.name()))
        .unique(true)
        .build()?
        .into())
}

fn prefix_clause(prefix: &str, value: &Value, unique: bool) -> StatusResult<Predicate> {
    Ok(Clause::builder()
        .prefix(prefix)
        .suffixes(scalars(prefix, value)?)
        .unique(unique)
        .build()?
        .into())
}

fn timestamp_clause(name: &str, value: &Value) -> StatusResult<Predicate> {
    if !State::is_timestamp_name(name) {
        return Err(StatusError::invalid(format!("'{name}' is not a valid timestamp")));
    }

    let (after, before) = match value {
        Value::Array(bounds) if bounds.len() == 2 => (&bounds[0], &bounds[1]),
        Value::Array(_) => {
            return Err(StatusError::invalid(format!(
                "Wrong number of array entries for '{name}'"
            )));
        }
        Value::Object(bounds) => {
            if let Some(other) = bounds.keys().find(|k| *k != "after" && *k != "before") {
                return Err(StatusError::invalid(format!(
                    "'{other}' is not a valid bound for '{name}'"
                )));
            }
            (
                bounds.get("after").unwrap_or(&Value::Null),
                bounds.get("before").unwrap_or(&Value::Null),
            )
        }
        other => {
            return Err(StatusError::invalid(format!(
                "{other} is not a valid value for a {name} key in a `where` call"
            )));
        }
    };

    Ok(Clause::builder()
        .keys([name])
        .min(bound(after)?)
        .max(bound(before)?)
        .build()?
        .into())
}

fn bound(value: &Value) -> StatusResult<Option<i64>> {
    TimeInput::from_json(value)?.map(to_usec).transpose()
}

/// A scalar or a list of scalars, as strings.
fn scalars(field: &str, value: &Value) -> StatusResult<Vec<String>> {
    match value {
        Value::Array(items) => items.iter().map(|item| scalar(field, item)).collect(),
        other => Ok(vec![scalar(field, other)?]),
    }
}

fn scalar(field: &str, value: &Value) -> StatusResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(StatusError::invalid(format!(
            "{other} is not a valid value for `{field}`"
        ))),
    }
}
