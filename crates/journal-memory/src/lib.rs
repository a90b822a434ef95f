//! In-memory decision log
//!
//! The durable part is shared between handles; the unflushed buffer belongs
//! to one handle. Dropping a handle without flushing loses its buffer, which
//! is exactly what a crash does to a real log.
//!
//! Durable entries are kept in append order and never compacted, so tests
//! can inspect the full history including completions. Memory grows with
//! every flushed entry; this backend is meant for tests and simulations, not
//! long-running coordinators.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tmx_journal::{DecisionRecord, Journal, JournalEntry, JournalError, Result};

#[derive(Default)]
struct Shared {
    durable: Mutex<Vec<JournalEntry>>,
    fail_flush: AtomicBool,
    flushes: Mutex<usize>,
}

/// In-memory journal
#[derive(Default)]
pub struct MemoryJournal {
    shared: Arc<Shared>,
    buffer: Vec<JournalEntry>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new handle over the same durable entries, with an empty buffer.
    /// Use it to stand in for the log seen by a restarted process.
    pub fn reopen(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            buffer: Vec::new(),
        }
    }

    /// Every durable entry, in append order. Completed decisions stay in
    /// the history.
    pub fn durable_entries(&self) -> Vec<JournalEntry> {
        self.shared.durable.lock().clone()
    }

    /// Number of successful flushes across all handles
    pub fn flush_count(&self) -> usize {
        *self.shared.flushes.lock()
    }

    /// Make flushes fail, standing in for a broken disk
    pub fn set_failing(&self, failing: bool) {
        self.shared.fail_flush.store(failing, Ordering::SeqCst);
    }
}

impl Journal for MemoryJournal {
    fn append(&mut self, entry: JournalEntry) -> Result<()> {
        self.buffer.push(entry);
        Ok(())
    }

    fn unflushed(&self) -> usize {
        self.buffer.len()
    }

    fn flush(&mut self) -> Result<()> {
        if self.shared.fail_flush.load(Ordering::SeqCst) {
            return Err(JournalError::Storage("flush refused".to_string()));
        }
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.shared.durable.lock().append(&mut self.buffer);
        *self.shared.flushes.lock() += 1;
        Ok(())
    }

    fn outstanding(&self) -> Result<Vec<DecisionRecord>> {
        Ok(tmx_journal::replay(self.shared.durable.lock().iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmx_common::{Outcome, ResourceId, Xid};
    use tmx_journal::Decision;

    fn decision(xid: Xid) -> JournalEntry {
        JournalEntry::Decision(DecisionRecord {
            xid,
            decision: Decision::Commit,
            outcome: Outcome::Ok,
            participants: vec![ResourceId(1)],
            caller: None,
        })
    }

    #[test]
    fn test_entries_durable_after_flush() {
        let mut journal = MemoryJournal::new();
        let xid = Xid::new();

        journal.append(decision(xid)).unwrap();
        assert_eq!(journal.unflushed(), 1);
        assert!(journal.outstanding().unwrap().is_empty());

        journal.flush().unwrap();
        assert_eq!(journal.unflushed(), 0);
        assert_eq!(journal.outstanding().unwrap()[0].xid, xid);
        assert_eq!(journal.flush_count(), 1);
    }

    #[test]
    fn test_crash_loses_buffer() {
        let mut journal = MemoryJournal::new();
        let kept = Xid::new();
        journal.append(decision(kept)).unwrap();
        journal.flush().unwrap();
        journal.append(decision(Xid::new())).unwrap();

        let restarted = journal.reopen();
        drop(journal);

        let outstanding = restarted.outstanding().unwrap();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].xid, kept);
    }

    #[test]
    fn test_completion_removes_decision() {
        let mut journal = MemoryJournal::new();
        let xid = Xid::new();
        journal.append(decision(xid)).unwrap();
        journal.append(JournalEntry::Completed(xid)).unwrap();
        journal.flush().unwrap();

        assert!(journal.outstanding().unwrap().is_empty());
        assert_eq!(journal.durable_entries().len(), 2);
    }

    #[test]
    fn test_failing_flush_keeps_buffer() {
        let mut journal = MemoryJournal::new();
        journal.append(decision(Xid::new())).unwrap();
        journal.set_failing(true);

        assert!(matches!(journal.flush(), Err(JournalError::Storage(_))));
        assert_eq!(journal.unflushed(), 1);

        journal.set_failing(false);
        journal.flush().unwrap();
        assert_eq!(journal.outstanding().unwrap().len(), 1);
    }
}
