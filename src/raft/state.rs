use super::log::{Entry, Index};

/// A state machine fed by the replicated log. Committed entries are applied
/// in strict index order; reads only ever observe applied state.
pub trait State {
    /// Returns the index of the last applied entry, 0 if none.
    fn applied_index(&self) -> Index;

    /// Applies the log entry at the given index. The index must follow the
    /// applied index.
    fn apply(&mut self, index: Index, entry: &Entry);

    /// Reads the value of a key, or the empty string if absent.
    fn read(&self, key: &str) -> String;
}

/// The key/value store: a plain in-memory map over the applied prefix of the
/// log.
pub struct KvStore {
    applied_index: Index,
    data: std::collections::HashMap<String, String>,
}

impl KvStore {
    /// Creates a new, empty key/value store.
    pub fn new() -> Self {
        Self { applied_index: 0, data: std::collections::HashMap::new() }
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl State for KvStore {
    fn applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, index: Index, entry: &Entry) {
        assert_eq!(index, self.applied_index + 1, "entry applied out of order");
        self.data.insert(entry.key.clone(), entry.value.clone());
        self.applied_index = index;
    }

    fn read(&self, key: &str) -> String {
        self.data.get(key).cloned().unwrap_or_default()
    }
}
