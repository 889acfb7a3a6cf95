use crate::replica::ReplicaSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Arena of open-file contexts, keyed by the opaque handle number handed to
/// the kernel. Identifiers start at 1 so 0 stays free as "no handle".
#[derive(Debug)]
pub struct ContextTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Arc<Mutex<ReplicaSet>>>>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, set: ReplicaSet) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(id, Arc::new(Mutex::new(set)));
        id
    }

    pub fn get(&self, id: u64) -> Option<Arc<Mutex<ReplicaSet>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&id).cloned()
    }

    /// Detaches the context. Existing clones stay usable until dropped.
    pub fn remove(&self, id: u64) -> Option<Arc<Mutex<ReplicaSet>>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(&id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }
}

impl Default for ContextTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Registry;

    #[test]
    fn identifiers_are_unique_and_nonzero() {
        let table = ContextTable::new();
        let a = table.insert(ReplicaSet::new(&Registry::new()));
        let b = table.insert(ReplicaSet::new(&Registry::new()));
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removed_contexts_are_gone_but_clones_survive() {
        let table = ContextTable::new();
        let id = table.insert(ReplicaSet::new(&Registry::new()));
        let held = table.get(id).unwrap();
        assert!(table.remove(id).is_some());
        assert!(table.get(id).is_none());
        assert!(held.lock().unwrap().is_empty());
    }
}
