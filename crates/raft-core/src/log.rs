//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, persisted via raft-storage, shipped in append entries
//! what: LogEntry struct, RaftLog with a snapshot sentinel, log matching and compaction

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// The replicated log.
///
/// Indices are logical and never shift. Everything at or below
/// `snapshot_index` has been folded into a snapshot; only its last term is
/// kept, as a sentinel. A fresh log has the sentinel `(0, 0)`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RaftLog {
    snapshot_index: u64,
    snapshot_term: u64,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    /// Index of the first entry still held in memory.
    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map_or(self.snapshot_term, |entry| entry.term)
    }

    /// Number of entries held after the sentinel.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, index: u64) -> Option<usize> {
        let offset = index.checked_sub(self.first_index())?;
        let offset = usize::try_from(offset).ok()?;
        (offset < self.entries.len()).then_some(offset)
    }

    /// The entry at `index`, or `None` for the sentinel, compacted or missing indices.
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.position(index).map(|pos| &self.entries[pos])
    }

    /// The term at `index`; the sentinel answers for `snapshot_index`.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            Some(self.snapshot_term)
        } else {
            self.get(index).map(|entry| entry.term)
        }
    }

    /// Clones every entry from `index` to the end of the log.
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        match self.position(index.max(self.first_index())) {
            Some(pos) => self.entries[pos..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Clones the entries in `from..=to`, clamped to what is held.
    pub fn entries_between(&self, from: u64, to: u64) -> Vec<LogEntry> {
        let from = from.max(self.first_index());
        let to = to.min(self.last_index());
        if from > to {
            return Vec::new();
        }
        match (self.position(from), self.position(to)) {
            (Some(start), Some(end)) => self.entries[start..=end].to_vec(),
            _ => Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Appends a new command at the next free index and returns the entry.
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> &LogEntry {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry::new(term, index, command));
        &self.entries[self.entries.len() - 1]
    }

    /// Pushes an entry that already carries its index. The index must be the next free one.
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log entries must be contiguous");
        self.entries.push(entry);
    }

    /// Removes every entry at or after `index`. Compacted entries are never removed.
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.max(self.first_index()) - self.first_index();
        let keep = usize::try_from(keep).unwrap_or(usize::MAX);
        self.entries.truncate(keep);
    }

    /// Whether the entry at `prev_index` matches `prev_term`.
    ///
    /// Anything at or below the snapshot is committed and therefore matches
    /// any current leader.
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        if prev_index < self.snapshot_index {
            return true;
        }
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Merges entries received from a leader, assuming the entry before the
    /// first of them already matched.
    ///
    /// Existing entries with the same term are kept; at the first conflict
    /// the local suffix is dropped and the rest appended. Returns whether the
    /// log changed.
    pub fn merge(&mut self, entries: Vec<LogEntry>) -> bool {
        let mut changed = false;
        for entry in entries {
            if entry.index <= self.snapshot_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.push(entry);
                }
                None => self.push(entry),
            }
            changed = true;
        }
        changed
    }

    /// Discards every entry through `index`, keeping its term as the new sentinel.
    ///
    /// Returns `false` when `index` is already compacted or beyond the log.
    pub fn compact_to(&mut self, index: u64) -> bool {
        if index <= self.snapshot_index {
            return false;
        }
        let Some(term) = self.term_at(index) else {
            return false;
        };
        let drop = (index - self.snapshot_index) as usize;
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
        true
    }

    /// Replaces the whole log with a sentinel at `(index, term)`.
    pub fn reset_to(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// The election restriction: is a log ending at `(last_index, last_term)`
    /// at least as up-to-date as this one?
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }
}
