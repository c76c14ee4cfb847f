//! Handle Registry
//!
//! Per-context table of rooted engine values. Ids are dense, start at 1 and are
//! never reused while the registry lives; 0 marks a value that was never tracked.

use std::collections::HashMap;
use std::fmt;

/// Identifier of a tracked value, local to its context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u64);

impl ValueId {
    /// Reserved id of a value that is not in any registry.
    pub const UNTRACKED: ValueId = ValueId(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_tracked(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Input to [`HandleRegistry::register`]
pub(crate) enum Registration<P> {
    /// A new rooted value that needs an id
    Fresh(P),
    /// A value that already has one
    Tracked(ValueId),
}

/// Id to payload table with pre-incremented ids
pub(crate) struct HandleRegistry<P> {
    next_id: u64,
    entries: HashMap<ValueId, P>,
}

impl<P> Default for HandleRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> HandleRegistry<P> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
        }
    }

    /// Track a value. Already tracked ids come back unchanged and do not
    /// advance the counter.
    pub fn register(&mut self, registration: Registration<P>) -> ValueId {
        match registration {
            Registration::Tracked(id) => id,
            Registration::Fresh(payload) => {
                self.next_id += 1;
                let id = ValueId(self.next_id);
                self.entries.insert(id, payload);
                id
            }
        }
    }

    pub fn get(&self, id: ValueId) -> Option<&P> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: ValueId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove an entry. A second release of the same id finds nothing.
    pub fn release(&mut self, id: ValueId) -> Option<P> {
        self.entries.remove(&id)
    }

    /// Take every entry out, leaving the id counter untouched.
    pub fn drain(&mut self) -> Vec<P> {
        self.entries.drain().map(|(_, payload)| payload).collect()
    }

    /// Number of values currently retained.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest id handed out so far.
    #[cfg(test)]
    pub fn last_issued(&self) -> u64 {
        self.next_id
    }
}
