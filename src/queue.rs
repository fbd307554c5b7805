//! Bounded fan-out queue from area loops to downstream consumers.
//!
//! The producer is an area event loop and must never block: on overflow
//! the oldest update is dropped and counted. Consumers pace themselves.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::{AreaId, VersionedValue};
use crate::counters;

/// One committed batch of changes, in store-commit order.
#[derive(Clone, Debug, PartialEq)]
pub struct Publication {
    pub area: AreaId,
    pub key_vals: BTreeMap<String, VersionedValue>,
    pub expired_keys: Vec<String>,
}

/// Stream element delivered to downstream consumers.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreUpdate {
    Publication(Publication),
    /// Initial convergence marker, once per area per process lifetime.
    Initialized(AreaId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecvError {
    #[error("publication queue closed")]
    Closed,
    #[error("publication queue recv timed out")]
    Timeout,
}

struct QueueState {
    items: VecDeque<StoreUpdate>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

/// Producer handle; cheap to clone, one per area loop.
#[derive(Clone)]
pub struct PublicationQueue {
    shared: Arc<Shared>,
}

/// The single consumer end.
pub struct UpdateReader {
    shared: Arc<Shared>,
}

pub fn publication_queue(capacity: usize) -> (PublicationQueue, UpdateReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            items: VecDeque::new(),
            closed: false,
        }),
        available: Condvar::new(),
        capacity: capacity.max(1),
    });
    (
        PublicationQueue {
            shared: Arc::clone(&shared),
        },
        UpdateReader { shared },
    )
}

impl PublicationQueue {
    pub fn push(&self, update: StoreUpdate) {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("publication queue lock poisoned");
        if state.closed {
            return;
        }
        if state.items.len() >= self.shared.capacity {
            state.items.pop_front();
            counters::bump(counters::PUBLICATION_QUEUE_DROPS);
        }
        state.items.push_back(update);
        drop(state);
        self.shared.available.notify_one();
    }

    pub fn close(&self) {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("publication queue lock poisoned");
        state.closed = true;
        drop(state);
        self.shared.available.notify_all();
    }
}

impl UpdateReader {
    pub fn try_recv(&self) -> Result<Option<StoreUpdate>, RecvError> {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("publication queue lock poisoned");
        if let Some(item) = state.items.pop_front() {
            return Ok(Some(item));
        }
        if state.closed {
            return Err(RecvError::Closed);
        }
        Ok(None)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<StoreUpdate, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .shared
            .state
            .lock()
            .expect("publication queue lock poisoned");
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(RecvError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvError::Timeout);
            }
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .expect("publication queue lock poisoned");
            state = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(s: &str) -> AreaId {
        AreaId::parse(s).unwrap()
    }

    fn update(n: u64) -> StoreUpdate {
        StoreUpdate::Publication(Publication {
            area: area("area-1"),
            key_vals: BTreeMap::new(),
            expired_keys: vec![format!("k{n}")],
        })
    }

    #[test]
    fn delivers_in_commit_order() {
        let (queue, reader) = publication_queue(8);
        queue.push(update(1));
        queue.push(update(2));

        assert_eq!(
            reader.recv_timeout(Duration::from_millis(100)).unwrap(),
            update(1)
        );
        assert_eq!(
            reader.recv_timeout(Duration::from_millis(100)).unwrap(),
            update(2)
        );
    }

    #[test]
    fn overflow_drops_oldest_without_blocking() {
        let drops_before = counters::value(counters::PUBLICATION_QUEUE_DROPS);
        let (queue, reader) = publication_queue(2);
        queue.push(update(1));
        queue.push(update(2));
        queue.push(update(3));

        assert_eq!(
            reader.recv_timeout(Duration::from_millis(100)).unwrap(),
            update(2)
        );
        assert_eq!(
            reader.recv_timeout(Duration::from_millis(100)).unwrap(),
            update(3)
        );
        assert_eq!(
            counters::value(counters::PUBLICATION_QUEUE_DROPS),
            drops_before + 1
        );
    }

    #[test]
    fn close_drains_then_errors() {
        let (queue, reader) = publication_queue(4);
        queue.push(update(1));
        queue.close();
        queue.push(update(2));

        assert_eq!(
            reader.recv_timeout(Duration::from_millis(100)).unwrap(),
            update(1)
        );
        assert_eq!(
            reader.recv_timeout(Duration::from_millis(100)),
            Err(RecvError::Closed)
        );
    }

    #[test]
    fn recv_times_out_when_idle() {
        let (_queue, reader) = publication_queue(4);
        assert_eq!(
            reader.recv_timeout(Duration::from_millis(20)),
            Err(RecvError::Timeout)
        );
    }
}
