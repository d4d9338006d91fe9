//! Worker name allocation.
//!
//! Worker names come from a fixed dictionary of short tokens. At any instant
//! no two active workers share a name; names are released on termination and
//! may be recycled.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::prelude::*;

/// Fixed dictionary of worker names.
const WORKER_NAMES: &[&str] = &[
    "homer", "marge", "bart", "lisa", "maggie", "abe", "ned", "maude", "rod", "todd", "moe",
    "barney", "lenny", "carl", "apu", "milhouse", "nelson", "martin", "wendell", "seymour",
    "edna", "otto", "willie", "clancy", "lou", "eddie", "krusty", "troy", "kent", "quimby",
];

/// In-memory pool tracking which worker names are held by active workers.
///
/// The lock is held only across O(1) set operations.
pub struct NamePool {
    active: Mutex<HashSet<String>>,
}

impl NamePool {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate a name not used by any active worker.
    ///
    /// The dictionary is sampled in random order so restarts don't always
    /// produce the same assignment. Returns `None` when every name is held.
    pub fn allocate(&self) -> Option<String> {
        let mut order: Vec<&str> = WORKER_NAMES.to_vec();
        order.shuffle(&mut rand::rng());

        let mut active = self.active.lock();
        for name in order {
            if !active.contains(name) {
                active.insert(name.to_string());
                return Some(name.to_string());
            }
        }
        None
    }

    /// Release a name back to the pool. Unknown names are ignored.
    pub fn release(&self, name: &str) {
        self.active.lock().remove(name);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.lock().contains(name)
    }
}

impl Default for NamePool {
    fn default() -> Self {
        Self::new()
    }
}
