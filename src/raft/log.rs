use super::node::{NodeID, Term};
use super::RequestID;

use serde_derive::{Deserialize, Serialize};

/// A log index. Real entries start at 1; index 0 is the sentinel.
pub type Index = u64;

/// A log entry: one client put, replicated across the cluster. The entry at
/// index 0 is a fixed sentinel with term 0 and an empty payload, which lets
/// consistency checks against the predecessor of index 1 succeed without
/// special-casing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the entry was proposed.
    pub term: Term,
    /// The key being written.
    pub key: String,
    /// The value being written.
    pub value: String,
    /// The client that submitted the put, for the commit acknowledgement.
    pub client: NodeID,
    /// The client's message ID for the put, echoed in the acknowledgement.
    pub put_id: RequestID,
}

impl Entry {
    /// Returns the sentinel entry at index 0.
    fn sentinel() -> Self {
        Self {
            term: 0,
            key: String::new(),
            value: String::new(),
            client: String::new(),
            put_id: String::new(),
        }
    }
}

/// The replicated command log. In the steady state the log is append-only:
/// the leader appends an entry for each admitted put and replicates it to
/// followers, who splice it into their logs. When an index is acknowledged by
/// a quorum it becomes committed and immutable; uncommitted suffixes may be
/// truncated when a follower reconciles with a newer leader.
///
/// Log invariants:
///
/// * Entry indexes are contiguous starting at 1 (the sentinel occupies 0).
/// * Entry terms never decrease from the previous entry.
/// * The commit index never regresses and never exceeds the last index.
/// * If two logs contain a matching index/term, all previous entries are
///   identical (see section 5.3 in the Raft paper).
pub struct Log {
    /// All entries, with entries[0] being the sentinel.
    entries: Vec<Entry>,
    /// The index of the last committed entry, 0 if none.
    commit_index: Index,
}

impl Log {
    /// Creates a new, empty log holding only the sentinel.
    pub fn new() -> Self {
        Self { entries: vec![Entry::sentinel()], commit_index: 0 }
    }

    /// Returns the index of the last entry (0 if only the sentinel).
    pub fn last_index(&self) -> Index {
        self.entries.len() as Index - 1
    }

    /// Returns the term of the last entry.
    pub fn last_term(&self) -> Term {
        self.entries.last().expect("log without sentinel").term
    }

    /// Returns the index the next appended entry will receive, i.e. the
    /// current length of the log including the sentinel.
    pub fn next_index(&self) -> Index {
        self.entries.len() as Index
    }

    /// Returns the commit index, 0 if nothing is committed.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Fetches an entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Appends an entry, returning its index.
    pub fn append(&mut self, entry: Entry) -> Index {
        assert!(entry.term >= self.last_term(), "term regression");
        self.entries.push(entry);
        self.last_index()
    }

    /// Splices entries received from a leader into the log: truncates any
    /// suffix after prev_index and appends the given entries. prev_index must
    /// exist, and the consistency check against its term must already have
    /// passed. Returns the log's new next index.
    pub fn splice(&mut self, prev_index: Index, entries: Vec<Entry>) -> Index {
        assert!(prev_index <= self.last_index(), "splice base {prev_index} beyond log");
        self.entries.truncate(prev_index as usize + 1);
        self.entries.extend(entries);
        self.next_index()
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Index {
        assert!(index >= self.commit_index, "commit regression {} → {index}", self.commit_index);
        assert!(index <= self.last_index(), "commit index {index} does not exist");
        self.commit_index = index;
        index
    }

    /// Returns the entries in the given index range, clamped to the log's
    /// bounds.
    pub fn scan(&self, range: impl std::ops::RangeBounds<Index>) -> &[Entry] {
        use std::ops::Bound;
        let start = match range.start_bound() {
            Bound::Included(&i) => i as usize,
            Bound::Excluded(&i) => i as usize + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&i) => i as usize + 1,
            Bound::Excluded(&i) => i as usize,
            Bound::Unbounded => self.entries.len(),
        };
        let start = start.min(self.entries.len());
        let end = end.clamp(start, self.entries.len());
        &self.entries[start..end]
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Returns a put entry for testing.
    pub fn entry(term: Term, key: &str, value: &str) -> Entry {
        Entry {
            term,
            key: key.into(),
            value: value.into(),
            client: "X".into(),
            put_id: format!("{key}={value}@{term}"),
        }
    }

    #[test]
    fn new_has_sentinel() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.next_index(), 1);
        assert_eq!(log.commit_index(), 0);
        assert!(log.has(0, 0));
        assert!(!log.has(1, 0));
    }

    #[test]
    fn append() {
        let mut log = Log::new();
        assert_eq!(log.append(entry(1, "a", "1")), 1);
        assert_eq!(log.append(entry(1, "b", "2")), 2);
        assert_eq!(log.append(entry(2, "c", "3")), 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get(2), Some(&entry(1, "b", "2")));
        assert_eq!(log.get(4), None);
        assert!(log.has(3, 2));
        assert!(!log.has(3, 1));
    }

    #[test]
    #[should_panic(expected = "term regression")]
    fn append_term_regression() {
        let mut log = Log::new();
        log.append(entry(2, "a", "1"));
        log.append(entry(1, "b", "2"));
    }

    #[test]
    fn splice_appends() {
        let mut log = Log::new();
        log.append(entry(1, "a", "1"));
        let next = log.splice(1, vec![entry(1, "b", "2"), entry(2, "c", "3")]);
        assert_eq!(next, 4);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.get(3), Some(&entry(2, "c", "3")));
    }

    #[test]
    // Reconciliation: a follower with a conflicting suffix truncates it and
    // takes the leader's entries instead.
    fn splice_truncates_conflict() {
        let mut log = Log::new();
        log.append(entry(1, "a", "1"));
        log.append(entry(1, "b", "2"));
        let next = log.splice(1, vec![entry(2, "c", "3")]);
        assert_eq!(next, 3);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.get(2), Some(&entry(2, "c", "3")));
    }

    #[test]
    fn commit() {
        let mut log = Log::new();
        log.append(entry(1, "a", "1"));
        log.append(entry(1, "b", "2"));
        assert_eq!(log.commit(1), 1);
        assert_eq!(log.commit_index(), 1);
        assert_eq!(log.commit(1), 1); // re-commit is a noop
        assert_eq!(log.commit(2), 2);
    }

    #[test]
    #[should_panic(expected = "commit regression")]
    fn commit_regression() {
        let mut log = Log::new();
        log.append(entry(1, "a", "1"));
        log.append(entry(1, "b", "2"));
        log.commit(2);
        log.commit(1);
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn commit_missing() {
        let mut log = Log::new();
        log.commit(1);
    }

    #[test]
    fn scan() {
        let mut log = Log::new();
        log.append(entry(1, "a", "1"));
        log.append(entry(1, "b", "2"));
        log.append(entry(2, "c", "3"));
        assert_eq!(log.scan(1..=2), &[entry(1, "a", "1"), entry(1, "b", "2")]);
        assert_eq!(log.scan(2..), &[entry(1, "b", "2"), entry(2, "c", "3")]);
        assert_eq!(log.scan(4..), &[] as &[Entry]);
        assert_eq!(log.scan(2..9), &[entry(1, "b", "2"), entry(2, "c", "3")]);
    }
}
