//! The `SlotBackend` interface consumed by [`crate::dict::MultiDict`].
//!
//! In the source this is a vtable of C function pointers so a bucket's
//! storage (plain array, compressed "flex" blob, …) can be swapped
//! without touching the dictionary. Rust gives us a trait for the same
//! seam. [`VecSlot`] is the reference implementation used by the dict's
//! own tests and by any caller that doesn't need a specialised
//! byte-compact container; real compressed containers are an external
//! collaborator per the design's non-goals and are expected to implement
//! this same trait.

/// Outcome of an `insert` into a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    New,
    Replaced,
}

/// Minimal key/value container living inside one hash bucket.
///
/// All mutating operations take `&mut self`; the dict never reaches past
/// this interface into a bucket's storage.
pub trait SlotBackend<K, V>: Default {
    type Iter<'a>: Iterator<Item = (&'a K, &'a V)>
    where
        Self: 'a,
        K: 'a,
        V: 'a;

    /// Inserts or overwrites `key`. Returns whether this was a fresh key.
    fn insert(&mut self, key: K, value: V) -> Inserted;

    /// Removes `key`, returning its value if present.
    fn remove(&mut self, key: &K) -> Option<V>;

    fn find(&self, key: &K) -> Option<&V>;

    fn find_mut(&mut self, key: &K) -> Option<&mut V>;

    /// Approximate in-memory size of everything this slot owns, in bytes.
    fn size_bytes(&self) -> usize;

    fn count(&self) -> u32;

    fn iter(&self) -> Self::Iter<'_>;

    /// The key at zero-based position `pos` in iteration order, if any.
    fn key_at_position(&self, pos: usize) -> Option<&K>;

    /// The last key in iteration order; used by incremental rehash to
    /// migrate entries from the tail without an auxiliary cursor.
    fn last_key(&self) -> Option<&K>;

    /// Moves the slot's last entry into `dst`. Returns `false` if this
    /// slot was empty.
    fn migrate_last(&mut self, dst: &mut Self) -> bool
    where
        Self: Sized;

    /// Drops every entry, returning how many were freed.
    fn free(&mut self) -> u32;
}

/// Reference `SlotBackend`: a flat `Vec` of pairs, linearly scanned.
///
/// Buckets are expected to be small (a handful of entries between
/// resizes), so linear scan beats the overhead of a nested map per
/// bucket; this mirrors how the source's own slot storage is a compact
/// inline array rather than a second hash table.
#[derive(Debug, Clone)]
pub struct VecSlot<K, V> {
    entries: Vec<(K, V)>,
}

impl<K, V> Default for VecSlot<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: PartialEq, V> SlotBackend<K, V> for VecSlot<K, V> {
    type Iter<'a>
        = std::iter::Map<std::slice::Iter<'a, (K, V)>, fn(&'a (K, V)) -> (&'a K, &'a V)>
    where
        Self: 'a,
        K: 'a,
        V: 'a;

    fn insert(&mut self, key: K, value: V) -> Inserted {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
            Inserted::Replaced
        } else {
            self.entries.push((key, value));
            Inserted::New
        }
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.swap_remove(pos).1)
    }

    fn find(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn size_bytes(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<(K, V)>()
    }

    fn count(&self) -> u32 {
        self.entries.len() as u32
    }

    fn iter(&self) -> Self::Iter<'_> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    fn key_at_position(&self, pos: usize) -> Option<&K> {
        self.entries.get(pos).map(|(k, _)| k)
    }

    fn last_key(&self) -> Option<&K> {
        self.entries.last().map(|(k, _)| k)
    }

    fn migrate_last(&mut self, dst: &mut Self) -> bool {
        match self.entries.pop() {
            Some(pair) => {
                dst.entries.push(pair);
                true
            }
            None => false,
        }
    }

    fn free(&mut self) -> u32 {
        let n = self.entries.len() as u32;
        self.entries.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_find() {
        let mut slot = VecSlot::default();
        assert_eq!(slot.insert("a", 1), Inserted::New);
        assert_eq!(slot.insert("a", 2), Inserted::Replaced);
        assert_eq!(slot.find(&"a"), Some(&2));
        assert_eq!(slot.count(), 1);
    }

    #[test]
    fn migrate_last_moves_one_entry() {
        let mut src: VecSlot<&str, i32> = VecSlot::default();
        let mut dst: VecSlot<&str, i32> = VecSlot::default();
        src.insert("a", 1);
        src.insert("b", 2);
        assert!(src.migrate_last(&mut dst));
        assert_eq!(dst.count(), 1);
        assert_eq!(src.count(), 1);
        assert!(!VecSlot::<&str, i32>::default().migrate_last(&mut dst));
    }
}
