//! Cooperative timer wheel fired from the engine tick.

use std::time::Instant;

#[derive(Debug)]
struct Entry<T> {
    seq: u64,
    due: Instant,
    task: T,
}

/// Pending tasks ordered by due time, ties broken by scheduling order.
#[derive(Debug)]
pub struct Scheduler<T> {
    next_seq: u64,
    entries: Vec<Entry<T>>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            entries: Vec::new(),
        }
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: Instant, task: T) {
        self.next_seq += 1;
        self.entries.push(Entry {
            seq: self.next_seq,
            due,
            task,
        });
    }

    /// Drop every pending task matching `pred`. Returns how many were removed.
    pub fn cancel_where(&mut self, pred: impl Fn(&T) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !pred(&e.task));
        before - self.entries.len()
    }

    /// Remove and return every task due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            if self.entries[idx].due <= now {
                due.push(self.entries.swap_remove(idx));
            } else {
                idx += 1;
            }
        }
        due.sort_by(|a, b| a.due.cmp(&b.due).then(a.seq.cmp(&b.seq)));
        due.into_iter().map(|e| e.task).collect()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.due).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
