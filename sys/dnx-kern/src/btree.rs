// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small sorted key-value map, used by the program and module registries
//! to look a name up against a fixed-capacity, compile-time-populated
//! table.
//!
//! The original library backing this is a real balanced tree over
//! heap-allocated nodes, because the C library needed `insert`/`remove` at
//! arbitrary runtime and had no fixed-capacity container to reach for.
//! `app`'s registries are populated once at link time and never mutate at
//! runtime, so a flat array kept sorted by binary search gives the same
//! `O(log n)` lookup with none of the node-pointer bookkeeping — "simple
//! and clear" in exactly the sense the rest of this crate favors. `insert`
//! and `remove` are kept for the cases (driver/shm registries) that do
//! mutate at runtime.
//!
//! Operation names below echo the original library's minimum / maximum /
//! successor / predecessor, which `_btree_foreach` used to walk the whole
//! tree in order; ordinary iteration (`SortedMap::iter`) replaces that here.

use heapless::Vec;

/// A fixed-capacity map from `K` to `V`, kept sorted by key.
pub struct SortedMap<K, V, const N: usize> {
    entries: Vec<(K, V), N>,
}

impl<K: Ord + Clone, V, const N: usize> SortedMap<K, V, N> {
    pub const fn new() -> Self {
        SortedMap {
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn search_index(&self, key: &K) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }

    pub fn search(&self, key: &K) -> Option<&V> {
        self.search_index(key).ok().map(|i| &self.entries[i].1)
    }

    pub fn search_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.search_index(key) {
            Ok(i) => Some(&mut self.entries[i].1),
            Err(_) => None,
        }
    }

    /// Inserts `value` under `key`, overwriting any existing entry for the
    /// same key. Returns `Err(value)` if the map is full and `key` is new.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), V> {
        match self.search_index(&key) {
            Ok(i) => {
                self.entries[i].1 = value;
                Ok(())
            }
            Err(i) => self
                .entries
                .insert(i, (key, value))
                .map_err(|(_, v)| v),
            // `Vec::insert` hands the rejected element back as the whole
            // tuple it was given, not just the value.
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        match self.search_index(key) {
            Ok(i) => Some(self.entries.remove(i).1),
            Err(_) => None,
        }
    }

    pub fn minimum(&self) -> Option<&(K, V)> {
        self.entries.first()
    }

    pub fn maximum(&self) -> Option<&(K, V)> {
        self.entries.last()
    }

    pub fn successor(&self, key: &K) -> Option<&(K, V)> {
        let i = match self.search_index(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        self.entries.get(i)
    }

    pub fn predecessor(&self, key: &K) -> Option<&(K, V)> {
        let i = match self.search_index(key) {
            Ok(i) if i > 0 => i - 1,
            Err(i) if i > 0 => i - 1,
            _ => return None,
        };
        self.entries.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(K, V)> {
        self.entries.iter()
    }
}

impl<K: Ord + Clone, V, const N: usize> Default for SortedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_search_remove_round_trip() {
        let mut map: SortedMap<u32, &'static str, 8> = SortedMap::new();
        map.insert(3, "three").unwrap();
        map.insert(1, "one").unwrap();
        map.insert(2, "two").unwrap();
        assert_eq!(map.search(&2), Some(&"two"));
        assert_eq!(map.minimum(), Some(&(1, "one")));
        assert_eq!(map.maximum(), Some(&(3, "three")));
        assert_eq!(map.remove(&2), Some("two"));
        assert_eq!(map.search(&2), None);
    }

    #[test]
    fn successor_and_predecessor_walk_in_order() {
        let mut map: SortedMap<u32, (), 8> = SortedMap::new();
        for key in [10, 20, 30] {
            map.insert(key, ()).unwrap();
        }
        assert_eq!(map.successor(&10), Some(&(20, ())));
        assert_eq!(map.predecessor(&30), Some(&(20, ())));
        assert_eq!(map.successor(&30), None);
        assert_eq!(map.predecessor(&10), None);
    }

    #[test]
    fn full_map_refuses_new_key_but_allows_overwrite() {
        let mut map: SortedMap<u32, u32, 2> = SortedMap::new();
        map.insert(1, 1).unwrap();
        map.insert(2, 2).unwrap();
        assert!(map.insert(3, 3).is_err());
        assert!(map.insert(1, 100).is_ok());
        assert_eq!(map.search(&1), Some(&100));
    }
}
