// Authoritative control-parameter state.
//
// `StateStore` maps parameter keys to their last-known string values. The
// only mutation is `merge`, which applies one decoded message's pairs as a
// single step under the write lock; readers (`dump`, `dump_text`) take the
// read lock and get an owned copy, so no caller ever observes a half-applied
// message or holds a reference into the live map.
//
// Keys are never removed. The control surface defines a fixed key space for
// the life of the process; a value can be emptied but the key stays.
//
// Entries are kept in a `BTreeMap`, so dumps are ordered by key and two dumps
// of the same state are byte-identical.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use abstrax_protocol::codec;

/// A point-in-time copy of the state.
pub type State = BTreeMap<String, String>;

#[derive(Debug, Default)]
pub struct StateStore {
    entries: RwLock<State>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `pairs` left to right; later pairs overwrite earlier ones.
    pub fn merge<'a>(&self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        // Nothing below can panic mid-merge; poisoning is ignored.
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in pairs {
            match entries.get_mut(key) {
                Some(slot) => {
                    slot.clear();
                    slot.push_str(value);
                }
                None => {
                    entries.insert(key.to_owned(), value.to_owned());
                }
            }
        }
    }

    /// Owned copy of the full state.
    pub fn dump(&self) -> State {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The full state in wire encoding.
    pub fn dump_text(&self) -> String {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        codec::encode(entries.iter())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}
