//! Deferred-start queue: a min-heap keyed by due time, drained by the
//! engine's cooperative timer.
//!
//! Entries are validated lazily against the task record at promotion time, so
//! a reschedule simply pushes a new entry and the stale one is re-filed or
//! discarded when it surfaces. `run_now` flips the record out of `scheduled`,
//! which invalidates the heap entry the same way.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    due: DateTime<Utc>,
    task_id: String,
}

#[derive(Default)]
pub struct ScheduleQueue {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task_id: impl Into<String>, due: DateTime<Utc>) {
        self.heap
            .lock()
            .expect("schedule queue poisoned")
            .push(Reverse(Entry {
                due,
                task_id: task_id.into(),
            }));
    }

    /// Pop every entry due at or before `now`, earliest first.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        let mut heap = self.heap.lock().expect("schedule queue poisoned");
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = heap.peek() {
            if entry.due > now {
                break;
            }
            let Reverse(entry) = heap.pop().expect("peeked entry");
            due.push((entry.task_id, entry.due));
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("schedule queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
