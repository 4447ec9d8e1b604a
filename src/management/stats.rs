use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    thread::{self, ThreadId},
};

use arc_swap::ArcSwap;

// -----------------------------------------------------------------------------
// ----- Stats -----------------------------------------------------------------

/// A set of counter values. Used both as a delta to record and as a summed
/// snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub current_sessions: i64,
    pub total_sessions: i64,
    pub bytes_read: i64,
    pub bytes_written: i64,
    pub messages_read: i64,
    pub messages_written: i64,
    pub exceptions: i64,
}

impl Stats {
    pub fn session_opened() -> Self {
        Self {
            current_sessions: 1,
            total_sessions: 1,
            ..Default::default()
        }
    }

    pub fn session_closed() -> Self {
        Self {
            current_sessions: -1,
            ..Default::default()
        }
    }

    pub fn received(len: usize) -> Self {
        Self {
            bytes_read: len as i64,
            messages_read: 1,
            ..Default::default()
        }
    }

    pub fn sent(len: usize) -> Self {
        Self {
            bytes_written: len as i64,
            messages_written: 1,
            ..Default::default()
        }
    }

    pub fn exception() -> Self {
        Self {
            exceptions: 1,
            ..Default::default()
        }
    }

    fn add(&mut self, other: &Stats) {
        self.current_sessions += other.current_sessions;
        self.total_sessions += other.total_sessions;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.messages_read += other.messages_read;
        self.messages_written += other.messages_written;
        self.exceptions += other.exceptions;
    }
}

// -----------------------------------------------------------------------------
// ----- StatSlot --------------------------------------------------------------

/// One thread's private counters. Only the owning thread writes; readers on
/// other threads only load, so plain load/store is enough.
#[derive(Debug, Default)]
struct StatSlot {
    current_sessions: AtomicI64,
    total_sessions: AtomicI64,
    bytes_read: AtomicI64,
    bytes_written: AtomicI64,
    messages_read: AtomicI64,
    messages_written: AtomicI64,
    exceptions: AtomicI64,
}

impl StatSlot {
    fn apply(&self, delta: &Stats) {
        bump(&self.current_sessions, delta.current_sessions);
        bump(&self.total_sessions, delta.total_sessions);
        bump(&self.bytes_read, delta.bytes_read);
        bump(&self.bytes_written, delta.bytes_written);
        bump(&self.messages_read, delta.messages_read);
        bump(&self.messages_written, delta.messages_written);
        bump(&self.exceptions, delta.exceptions);
    }

    fn load(&self) -> Stats {
        Stats {
            current_sessions: self.current_sessions.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            messages_read: self.messages_read.load(Ordering::Relaxed),
            messages_written: self.messages_written.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
        }
    }
}

#[inline]
fn bump(cell: &AtomicI64, delta: i64) {
    if delta != 0 {
        // single writer: no read-modify-write needed
        cell.store(cell.load(Ordering::Relaxed) + delta, Ordering::Relaxed);
    }
}

// -----------------------------------------------------------------------------
// ----- StatTable -------------------------------------------------------------

/// Per-thread counter slots published in a copy-on-write map keyed by thread.
///
/// Writers touch only their own slot. Readers sum whatever is published;
/// totals are eventually consistent, not linearizable.
#[derive(Debug, Default)]
pub struct StatTable {
    slots: ArcSwap<HashMap<ThreadId, Arc<StatSlot>>>,
}

impl StatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, delta: &Stats) {
        self.local_slot().apply(delta);
    }

    pub fn summary(&self) -> Stats {
        let mut total = Stats::default();
        for slot in self.slots.load().values() {
            total.add(&slot.load());
        }
        total
    }

    /// Number of threads that have recorded into this table.
    pub fn thread_count(&self) -> usize {
        self.slots.load().len()
    }

    fn local_slot(&self) -> Arc<StatSlot> {
        let me = thread::current().id();
        if let Some(slot) = self.slots.load().get(&me) {
            return slot.clone();
        }

        let slot = Arc::new(StatSlot::default());
        self.slots.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.entry(me).or_insert_with(|| slot.clone());
            next
        });
        slot
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_slot_per_thread() {
        let table = Arc::new(StatTable::new());
        table.record(&Stats::received(10));
        table.record(&Stats::received(5));
        assert_eq!(table.thread_count(), 1);

        let remote = table.clone();
        std::thread::spawn(move || remote.record(&Stats::sent(7)))
            .join()
            .unwrap();

        assert_eq!(table.thread_count(), 2);
        let sum = table.summary();
        assert_eq!(sum.bytes_read, 15);
        assert_eq!(sum.messages_read, 2);
        assert_eq!(sum.bytes_written, 7);
    }

    #[test]
    fn open_then_close_nets_to_zero_current() {
        let table = StatTable::new();
        table.record(&Stats::session_opened());
        table.record(&Stats::session_closed());
        let sum = table.summary();
        assert_eq!(sum.current_sessions, 0);
        assert_eq!(sum.total_sessions, 1);
    }
}
