//! Fixtures shared by the unit tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clock::ManualClock;
use crate::config::Config;
use crate::state::State;
use crate::status::Status;
use crate::store::MemoryStore;
use crate::tracker::Tracker;

/// Clock starting at 2015-12-28T18:32:33Z, one millisecond per read.
pub(crate) fn test_clock() -> ManualClock {
    let start = DateTime::<Utc>::from_timestamp(1_451_327_553, 0).unwrap_or_default();
    ManualClock::new(start, Duration::milliseconds(1))
}

/// A tracker over a fresh memory store with no namespace, plus the store.
pub(crate) fn tracker() -> (Tracker, Arc<MemoryStore>) {
    let memory = Arc::new(MemoryStore::new());
    let tracker = Tracker::with_clock(Config::new(""), memory.clone(), test_clock());
    (tracker, memory)
}

/// Create a status and walk it through the states leading to `state`.
///
/// With an id the record starts out `unknown`, without one `unqueued`.
pub(crate) async fn make_status(tracker: &Tracker, id: Option<&str>, state: Option<State>) -> Status {
    let mut status = match id {
        Some(id) => {
            assert!(
                Status::find(tracker, id).await.unwrap().is_none(),
                "status {id} already exists"
            );
            Status::find_or_create(tracker, id).await.unwrap()
        }
        None => Status::create(tracker).await.unwrap(),
    };

    let path = match state {
        None => vec![],
        Some(State::Started) => vec![State::Queued, State::Started],
        Some(State::Succeeded) => vec![State::Queued, State::Started, State::Succeeded],
        Some(State::Failed) => vec![State::Queued, State::Started, State::Failed],
        Some(other) => vec![other],
    };
    for next in path {
        status.enter(next).await.unwrap();
    }
    status
}
