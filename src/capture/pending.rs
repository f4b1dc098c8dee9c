//! Arena for in-flight capture requests.
//!
//! Every asynchronous receive or send a backend issues gets an entry keyed by
//! [`RequestId`]. The entry owns the request's buffers until it is taken out,
//! which happens exactly once: either by the waiter that issued it, or by a
//! drain pass once the request has completed with nobody waiting on it.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry<T> {
    op: T,
    completed: bool,
}

struct Inner<T> {
    next_id: u64,
    entries: HashMap<u64, Entry<T>>,
}

pub struct PendingTable<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: HashMap::with_capacity(64),
            }),
        }
    }

    /// Register an in-flight operation.
    pub fn issue(&self, op: T) -> RequestId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, Entry { op, completed: false });
        RequestId(id)
    }

    /// Mark an operation as completed. Returns `false` if it was already
    /// reclaimed.
    pub fn complete(&self, id: RequestId) -> bool {
        match self.inner.lock().entries.get_mut(&id.0) {
            Some(entry) => {
                entry.completed = true;
                true
            }
            None => false,
        }
    }

    /// Remove an operation regardless of its state.
    pub fn take(&self, id: RequestId) -> Option<T> {
        self.inner.lock().entries.remove(&id.0).map(|e| e.op)
    }

    /// Apply `f` to an operation still in the table.
    pub fn with<R>(&self, id: RequestId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.lock().entries.get_mut(&id.0).map(|e| f(&mut e.op))
    }

    /// Remove every completed operation.
    pub fn take_completed(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let done: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.completed)
            .map(|(id, _)| *id)
            .collect();
        done.into_iter()
            .filter_map(|id| inner.entries.remove(&id).map(|e| e.op))
            .collect()
    }

    /// Remove every operation, completed or not.
    pub fn take_all(&self) -> Vec<T> {
        self.inner.lock().entries.drain().map(|(_, e)| e.op).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_take_once() {
        let table = PendingTable::new();
        let a = table.issue("a");
        let b = table.issue("b");
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        assert_eq!(table.take(a), Some("a"));
        assert_eq!(table.take(a), None);
        assert!(!table.complete(a));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drain_skips_in_flight() {
        let table = PendingTable::new();
        let send1 = table.issue(1);
        let send2 = table.issue(2);
        let in_flight = table.issue(3);

        table.complete(send1);
        table.complete(send2);

        let mut drained = table.take_completed();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(table.len(), 1);

        // Drained entries are gone for good.
        assert!(table.take_completed().is_empty());
        assert_eq!(table.take(send1), None);

        table.complete(in_flight);
        assert_eq!(table.take_completed(), vec![3]);
        table.issue(4);
        assert_eq!(table.take_all(), vec![4]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_with_mutates_in_place() {
        let table = PendingTable::new();
        let id = table.issue(vec![0u8; 4]);
        assert_eq!(table.with(id, |buf| { buf[0] = 9; buf.len() }), Some(4));
        assert_eq!(table.take(id).unwrap()[0], 9);
        assert!(table.with(id, |buf| buf.len()).is_none());
    }
}
