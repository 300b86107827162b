//! Incrementally-rehashing hash dictionary with optional LRU eviction.
//!
//! Two [`DictTable`]s, `HT[0]` and `HT[1]`, stand in for the source's pair
//! of raw bucket arrays. While `rehashing` is set, `HT[1]` is the live
//! destination table and `rehash_idx` tracks the next `HT[0]` bucket to
//! migrate; reads check `HT[1]` first, falling back to `HT[0]` the way the
//! source always does (a key can only live in one table at a time, but a
//! lookup doesn't know which without checking). Bucket storage itself is
//! generic over [`SlotBackend`] so callers can drop in a denser
//! implementation than [`VecSlot`] without touching this module.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use rand::Rng;
use rustc_hash::FxHashMap;
use rustc_hash::FxHasher;

use crate::config::{DictOptions, EvictPolicy, LruOptions};
use crate::error::{CoreError, CoreResult};
use crate::lru::{round_capacity, LruPtr, MultiLru};
use crate::slot::{Inserted, SlotBackend, VecSlot};

/// Gives a key or value its contribution to `key_bytes`/`val_bytes`
/// accounting so `total_bytes == used_bytes + key_bytes + val_bytes` holds
/// without every container needing to know its own heap footprint.
pub trait ByteSize {
    fn byte_size(&self) -> u64;
}

macro_rules! byte_size_by_value {
    ($($t:ty),* $(,)?) => {
        $(impl ByteSize for $t {
            fn byte_size(&self) -> u64 {
                std::mem::size_of::<$t>() as u64
            }
        })*
    };
}

byte_size_by_value!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, f32, f64, bool, char);

impl ByteSize for String {
    fn byte_size(&self) -> u64 {
        self.len() as u64
    }
}

impl ByteSize for Vec<u8> {
    fn byte_size(&self) -> u64 {
        self.len() as u64
    }
}

/// Numeric view of a value, used only by `incr_by`/`incr_by_float`. A
/// value that can't be interpreted as a number (e.g. a non-digit string)
/// returns `None` rather than failing to compile — the `NonNumeric`
/// failure is a runtime one, same as the source.
pub trait DictNumeric: Sized {
    fn as_i64(&self) -> Option<i64>;
    fn as_f64(&self) -> Option<f64>;
    fn from_i64(v: i64) -> Self;
    fn from_f64(v: f64) -> Self;
}

impl DictNumeric for i64 {
    fn as_i64(&self) -> Option<i64> {
        Some(*self)
    }
    fn as_f64(&self) -> Option<f64> {
        Some(*self as f64)
    }
    fn from_i64(v: i64) -> Self {
        v
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}

impl DictNumeric for f64 {
    fn as_i64(&self) -> Option<i64> {
        if self.fract() == 0.0 {
            Some(*self as i64)
        } else {
            None
        }
    }
    fn as_f64(&self) -> Option<f64> {
        Some(*self)
    }
    fn from_i64(v: i64) -> Self {
        v as f64
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

/// Values stored as text parse as numbers the way the source's string
/// values do under `INCRBY`.
impl DictNumeric for String {
    fn as_i64(&self) -> Option<i64> {
        self.parse().ok()
    }
    fn as_f64(&self) -> Option<f64> {
        self.parse().ok()
    }
    fn from_i64(v: i64) -> Self {
        v.to_string()
    }
    fn from_f64(v: f64) -> Self {
        v.to_string()
    }
}

const INITIAL_TABLE_SIZE: u64 = 4;

fn hash_of<K: Hash + ?Sized>(seed: u64, key: &K) -> u64 {
    let mut h = FxHasher::default();
    seed.hash(&mut h);
    key.hash(&mut h);
    h.finish()
}

struct DictTable<K, V, S> {
    slots: Vec<S>,
    mask: u64,
    count: u64,
    key_bytes: u64,
    val_bytes: u64,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, S: SlotBackend<K, V>> DictTable<K, V, S> {
    fn new(size: u64) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(size.max(1) as usize, S::default);
        Self {
            slots,
            mask: size.max(1) - 1,
            count: 0,
            key_bytes: 0,
            val_bytes: 0,
            _marker: PhantomData,
        }
    }

    fn try_new(size: u64) -> CoreResult<Self> {
        let size = size.max(1);
        let mut slots = Vec::new();
        slots
            .try_reserve(size as usize)
            .map_err(|_| CoreError::Alloc("DictTable::try_new"))?;
        slots.resize_with(size as usize, S::default);
        Ok(Self {
            slots,
            mask: size - 1,
            count: 0,
            key_bytes: 0,
            val_bytes: 0,
            _marker: PhantomData,
        })
    }

    fn size(&self) -> u64 {
        self.slots.len() as u64
    }

    fn used_bytes(&self) -> u64 {
        self.slots.iter().map(|s| s.size_bytes() as u64).sum()
    }

    fn total_bytes(&self) -> u64 {
        self.used_bytes() + self.key_bytes + self.val_bytes
    }
}

#[derive(Clone, Copy)]
struct LruBackref {
    key_hash: u64,
    valid: bool,
}

/// `MultiLru` plus the two auxiliary structures the design calls for: a
/// `key -> LruPtr` map and a `LruPtr -> key_hash` backref array, kept as a
/// composition rather than a literal nested dict (the auxiliary map has no
/// eviction policy of its own and must not recurse into LRU tracking).
struct DictLru<K> {
    lru: MultiLru,
    key_to_ptr: FxHashMap<K, LruPtr>,
    backref: Vec<LruBackref>,
}

impl<K: Eq + Hash + Clone> DictLru<K> {
    fn ensure_backref_capacity(&mut self, p: LruPtr) -> CoreResult<()> {
        let needed = p as usize + 1;
        if self.backref.len() < needed {
            let new_len = round_capacity(needed);
            self.backref
                .try_reserve(new_len - self.backref.len())
                .map_err(|_| CoreError::Alloc("DictLru::ensure_backref_capacity"))?;
            self.backref.resize(
                new_len,
                LruBackref {
                    key_hash: 0,
                    valid: false,
                },
            );
        }
        Ok(())
    }
}

/// Cursor into a live [`MultiDict::iter_safe_begin`] iteration.
///
/// Unlike the standard [`Iterator`] trait, stepping a safe iterator needs
/// the dict passed back in on every call (the source's safe iterator is
/// similarly a bare cursor, not an object that owns a lock on the table),
/// so this type does not implement `Iterator` itself.
pub struct SafeDictIter {
    table: usize,
    slot: usize,
    pos: usize,
}

/// A fingerprint-checked snapshot, standing in for the source's "unsafe"
/// iterator. The source's version streams live and only detects a
/// disallowed mutation at `release`; reproducing that without raw
/// pointers means snapshotting eagerly here, but the fingerprint
/// capture/assert contract at release is unchanged.
pub struct UnsafeDictIter<K, V> {
    items: std::vec::IntoIter<(K, V)>,
    fingerprint: u64,
}

impl<K, V> Iterator for UnsafeDictIter<K, V> {
    type Item = (K, V);
    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

impl<K, V> UnsafeDictIter<K, V> {
    /// Asserts the dict's shape hasn't changed since this iterator was
    /// created. Only checked in debug builds, matching
    /// `IteratorFingerprintMismatch`'s "debug-only, must fail loudly"
    /// treatment.
    pub fn release<S: SlotBackend<K, V>>(self, dict: &MultiDict<K, V, S>)
    where
        K: Eq + Hash + Clone + ByteSize,
        V: ByteSize,
    {
        debug_assert_eq!(
            self.fingerprint,
            dict.fingerprint(),
            "dict mutated during unsafe iteration"
        );
    }
}

/// Two-table incrementally-rehashing dictionary with optional LRU- or
/// random-eviction under a byte budget.
pub struct MultiDict<K, V, S = VecSlot<K, V>> {
    ht: [DictTable<K, V, S>; 2],
    rehashing: bool,
    rehash_idx: u64,
    hash_seed: u64,
    iterators: u32,
    options: DictOptions,
    evict_callback: Option<Box<dyn FnMut(&K, &V) -> bool>>,
    lru: Option<DictLru<K>>,
}

impl<K, V, S> MultiDict<K, V, S>
where
    K: Eq + Hash + Clone + ByteSize,
    V: ByteSize,
    S: SlotBackend<K, V>,
{
    pub fn new(options: DictOptions) -> Self {
        Self {
            ht: [DictTable::new(INITIAL_TABLE_SIZE), DictTable::new(1)],
            rehashing: false,
            rehash_idx: 0,
            hash_seed: 0x9E37_79B9_7F4A_7C15,
            iterators: 0,
            options,
            evict_callback: None,
            lru: None,
        }
    }

    /// Enables LRU tracking. Must be called before the first insert; the
    /// auxiliary `key -> LruPtr` map intentionally has no eviction policy
    /// of its own (see the module doc) so this can't be undone by just
    /// clearing it later.
    pub fn enable_lru(&mut self, lru_options: LruOptions) -> CoreResult<()> {
        assert_eq!(
            self.count(),
            0,
            "LRU tracking must be enabled before the first insert"
        );
        let lru = MultiLru::new(lru_options.max_levels, lru_options.start_capacity)?;
        self.lru = Some(DictLru {
            lru,
            key_to_ptr: FxHashMap::default(),
            backref: Vec::new(),
        });
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.ht[0].count + if self.rehashing { self.ht[1].count } else { 0 }
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehashing
    }

    pub fn used_bytes(&self) -> u64 {
        self.ht[0].used_bytes() + if self.rehashing { self.ht[1].used_bytes() } else { 0 }
    }

    pub fn key_bytes(&self) -> u64 {
        self.ht[0].key_bytes + if self.rehashing { self.ht[1].key_bytes } else { 0 }
    }

    pub fn val_bytes(&self) -> u64 {
        self.ht[0].val_bytes + if self.rehashing { self.ht[1].val_bytes } else { 0 }
    }

    pub fn total_bytes(&self) -> u64 {
        self.ht[0].total_bytes() + if self.rehashing { self.ht[1].total_bytes() } else { 0 }
    }

    /// Mix of `(ht0.table, ht0.size, ht0.count, ht1.table, ht1.size,
    /// ht1.count)`, checked by unsafe-iterator release. `ht.table` is
    /// approximated by the backing `Vec`'s data pointer, which changes on
    /// any reallocation — a strict superset of the mutations that would
    /// actually invalidate a live iteration.
    pub fn fingerprint(&self) -> u64 {
        let mut h = FxHasher::default();
        (self.ht[0].slots.as_ptr() as usize).hash(&mut h);
        self.ht[0].size().hash(&mut h);
        self.ht[0].count.hash(&mut h);
        (self.ht[1].slots.as_ptr() as usize).hash(&mut h);
        self.ht[1].size().hash(&mut h);
        self.ht[1].count.hash(&mut h);
        h.finish()
    }

    fn slot_index(table: &DictTable<K, V, S>, hash: u64) -> usize {
        (hash & table.mask) as usize
    }

    fn rehash_step_if_due(&mut self) {
        if self.rehashing && self.iterators == 0 {
            self.rehash_step(1);
        }
    }

    /// Migrates up to `n` non-empty buckets from `HT[0]` into `HT[1]`,
    /// skipping empty ones under a bounded budget so a long empty run
    /// can't turn one step into an unbounded scan. Returns whether
    /// rehashing is still in progress afterward.
    pub fn rehash_step(&mut self, n: u32) -> bool {
        if !self.rehashing {
            return false;
        }
        if self.iterators > 0 {
            return true;
        }
        let empty_budget = 5u32.saturating_mul(n.max(1));
        let mut migrations = 0u32;
        let mut empty_visits = 0u32;
        while migrations < n {
            if self.ht[0].count == 0 {
                self.finish_rehash();
                return false;
            }
            if self.rehash_idx >= self.ht[0].size() {
                // Should not happen while ht0.count > 0, but keeps this
                // loop from spinning forever if it ever does.
                self.finish_rehash();
                return false;
            }
            let idx = self.rehash_idx as usize;
            if self.ht[0].slots[idx].count() == 0 {
                self.rehash_idx += 1;
                empty_visits += 1;
                if empty_visits >= empty_budget {
                    break;
                }
                continue;
            }
            self.migrate_bucket(idx);
            self.rehash_idx += 1;
            migrations += 1;
        }
        if self.ht[0].count == 0 {
            self.finish_rehash();
            return false;
        }
        true
    }

    fn migrate_bucket(&mut self, idx: usize) {
        if self.ht[0].slots[idx].count() == 0 {
            return;
        }

        // Wholesale swap: a lone entry whose target bucket is empty moves
        // as a unit rather than entry-by-entry.
        if self.ht[0].slots[idx].count() == 1 {
            if let Some(key) = self.ht[0].slots[idx].last_key().cloned() {
                let h = hash_of(self.hash_seed, &key);
                let target = Self::slot_index(&self.ht[1], h);
                if self.ht[1].slots[target].count() == 0 {
                    let key_bytes = key.byte_size();
                    let val_bytes = self.ht[0].slots[idx]
                        .find(&key)
                        .map(|v| v.byte_size())
                        .unwrap_or(0);
                    let [ht0, ht1] = &mut self.ht;
                    std::mem::swap(&mut ht0.slots[idx], &mut ht1.slots[target]);
                    ht0.count -= 1;
                    ht0.key_bytes -= key_bytes;
                    ht0.val_bytes -= val_bytes;
                    ht1.count += 1;
                    ht1.key_bytes += key_bytes;
                    ht1.val_bytes += val_bytes;
                    return;
                }
            }
        }

        while self.ht[0].slots[idx].count() > 0 {
            let key = self.ht[0].slots[idx]
                .last_key()
                .expect("count > 0")
                .clone();
            let h = hash_of(self.hash_seed, &key);
            let target = Self::slot_index(&self.ht[1], h);
            let key_bytes = key.byte_size();
            let val_bytes = self.ht[0].slots[idx]
                .find(&key)
                .map(|v| v.byte_size())
                .unwrap_or(0);
            let [ht0, ht1] = &mut self.ht;
            let moved = ht0.slots[idx].migrate_last(&mut ht1.slots[target]);
            debug_assert!(moved);
            ht0.count -= 1;
            ht0.key_bytes -= key_bytes;
            ht0.val_bytes -= val_bytes;
            ht1.count += 1;
            ht1.key_bytes += key_bytes;
            ht1.val_bytes += val_bytes;
        }
    }

    fn finish_rehash(&mut self) {
        tracing::debug!(final_size = self.ht[1].size(), "rehash complete");
        self.rehashing = false;
        self.rehash_idx = 0;
        self.ht[0] = std::mem::replace(&mut self.ht[1], DictTable::new(1));
    }

    fn start_rehash(&mut self, new_size: u64) -> CoreResult<()> {
        tracing::debug!(from = self.ht[0].size(), to = new_size, "rehash starting");
        self.ht[1] = DictTable::try_new(new_size)?;
        self.rehashing = true;
        self.rehash_idx = 0;
        Ok(())
    }

    /// Begins (or no-ops past) a rehash into a table sized for at least
    /// `min_size` entries, rounded to the next power of two.
    pub fn expand(&mut self, min_size: u64) -> CoreResult<()> {
        let target = min_size.max(4).next_power_of_two();
        if self.rehashing || target <= self.ht[0].size() {
            return Ok(());
        }
        self.start_rehash(target)
    }

    /// Opportunistic; a growth failure here just means the table stays at
    /// its current size and the check runs again on the next mutation,
    /// unlike an explicit [`Self::expand`] call whose failure is returned
    /// to the caller directly.
    fn maybe_auto_resize(&mut self) {
        if !self.options.auto_resize || self.rehashing {
            return;
        }
        let count = self.ht[0].count;
        let size = self.ht[0].size();
        if size == 0 {
            return;
        }
        let load_pct = count * 100 / size;

        let expand_needed = if self.options.use_byte_based_expand {
            let used_slots = self.ht[0].slots.iter().filter(|s| s.count() > 0).count().max(1) as u64;
            let total_used = self.ht[0].total_bytes();
            let avg_slot_bytes = total_used / used_slots;
            let max_slot_bytes = self.ht[0]
                .slots
                .iter()
                .map(|s| s.size_bytes() as u64)
                .max()
                .unwrap_or(0);
            let count_backstop = load_pct >= 2 * self.options.expand_load_factor as u64;
            avg_slot_bytes > self.options.target_slot_bytes
                || max_slot_bytes > self.options.max_slot_bytes
                || count_backstop
        } else {
            load_pct >= self.options.expand_load_factor as u64
        };

        if expand_needed {
            let new_size = (size * 2).max(4);
            if self.options.use_byte_based_expand {
                let used_slots = self.ht[0].slots.iter().filter(|s| s.count() > 0).count().max(1) as u64;
                let total_used = self.ht[0].total_bytes();
                let avg_slot_bytes = total_used / used_slots;
                let projected = total_used / new_size.max(1);
                if (projected as f64) >= 0.9 * (avg_slot_bytes as f64) {
                    return;
                }
            }
            let _ = self.start_rehash(new_size);
            return;
        }

        if load_pct < self.options.shrink_load_factor as u64 && size > 8 {
            let min_needed = count.max(1).next_power_of_two().max(4);
            if min_needed < size {
                let _ = self.start_rehash(min_needed);
            }
        }
    }

    fn contains_key(&self, key: &K) -> bool {
        let h = hash_of(self.hash_seed, key);
        if self.rehashing {
            let i1 = Self::slot_index(&self.ht[1], h);
            if self.ht[1].slots[i1].find(key).is_some() {
                return true;
            }
        }
        let i0 = Self::slot_index(&self.ht[0], h);
        self.ht[0].slots[i0].find(key).is_some()
    }

    fn peek(&self, key: &K) -> Option<&V> {
        let h = hash_of(self.hash_seed, key);
        if self.rehashing {
            let i1 = Self::slot_index(&self.ht[1], h);
            if let Some(v) = self.ht[1].slots[i1].find(key) {
                return Some(v);
            }
        }
        let i0 = Self::slot_index(&self.ht[0], h);
        self.ht[0].slots[i0].find(key)
    }

    /// Reads check `HT[1]` first while rehashing, falling back to `HT[0]`
    /// — the same order the source uses, since a key not yet migrated is
    /// only findable in the old table.
    pub fn find(&mut self, key: &K) -> Option<&V> {
        self.rehash_step_if_due();
        self.lru_on_touch(key);
        self.peek(key)
    }

    fn lru_on_insert(&mut self, key: &K) -> CoreResult<()> {
        let key_hash = hash_of(self.hash_seed, key);
        let Some(lru) = self.lru.as_mut() else {
            return Ok(());
        };
        let p = lru.lru.insert()?;
        lru.key_to_ptr.insert(key.clone(), p);
        lru.ensure_backref_capacity(p)?;
        lru.backref[p as usize] = LruBackref {
            key_hash,
            valid: true,
        };
        Ok(())
    }

    fn lru_on_touch(&mut self, key: &K) {
        let Some(lru) = self.lru.as_mut() else {
            return;
        };
        if let Some(&p) = lru.key_to_ptr.get(key) {
            lru.lru.increase(p);
        }
    }

    fn lru_on_delete(&mut self, key: &K) {
        let Some(lru) = self.lru.as_mut() else {
            return;
        };
        if let Some(p) = lru.key_to_ptr.remove(key) {
            lru.lru.delete(p);
            if let Some(b) = lru.backref.get_mut(p as usize) {
                b.valid = false;
            }
        }
    }

    /// Unconditional insert/overwrite, matching the source's plain `add`.
    pub fn add(&mut self, key: K, value: V) -> CoreResult<Inserted> {
        self.rehash_step_if_due();
        if self.rehashing {
            // A stale copy in HT[0] would otherwise coexist with the fresh
            // one landing in HT[1].
            self.delete_from_ht0_only(&key);
        }
        let h = hash_of(self.hash_seed, &key);
        let table_idx = if self.rehashing { 1 } else { 0 };
        let idx = Self::slot_index(&self.ht[table_idx], h);
        let key_bytes = key.byte_size();
        let val_bytes = value.byte_size();
        let existing_val_bytes = self.ht[table_idx].slots[idx].find(&key).map(|v| v.byte_size());
        let outcome = self.ht[table_idx].slots[idx].insert(key.clone(), value);
        match outcome {
            Inserted::New => {
                self.ht[table_idx].count += 1;
                self.ht[table_idx].key_bytes += key_bytes;
                self.ht[table_idx].val_bytes += val_bytes;
                self.lru_on_insert(&key)?;
            }
            Inserted::Replaced => {
                if let Some(old) = existing_val_bytes {
                    self.ht[table_idx].val_bytes = self.ht[table_idx].val_bytes + val_bytes - old;
                }
                self.lru_on_touch(&key);
            }
        }
        if !self.rehashing {
            self.maybe_auto_resize();
        }
        Ok(outcome)
    }

    fn delete_from_ht0_only(&mut self, key: &K) {
        let h = hash_of(self.hash_seed, key);
        let idx = Self::slot_index(&self.ht[0], h);
        if let Some(v) = self.ht[0].slots[idx].remove(key) {
            self.ht[0].count -= 1;
            self.ht[0].key_bytes -= key.byte_size();
            self.ht[0].val_bytes -= v.byte_size();
            // Otherwise the LRU entry this key used to own is orphaned:
            // `lru_on_insert` below overwrites `key_to_ptr`'s mapping
            // without freeing the stale node it replaces.
            self.lru_on_delete(key);
        }
    }

    /// Fails with [`CoreError::Precondition`] if `key` already exists.
    pub fn add_nx(&mut self, key: K, value: V) -> CoreResult<Inserted> {
        if self.contains_key(&key) {
            return Err(CoreError::Precondition);
        }
        self.add(key, value)
    }

    /// Fails with [`CoreError::Precondition`] if `key` is absent.
    pub fn add_xx(&mut self, key: K, value: V) -> CoreResult<Inserted> {
        if !self.contains_key(&key) {
            return Err(CoreError::Precondition);
        }
        self.add(key, value)
    }

    pub fn replace(&mut self, key: K, value: V) -> CoreResult<Inserted> {
        self.add(key, value)
    }

    pub fn delete(&mut self, key: &K) -> bool {
        self.rehash_step_if_due();
        let h = hash_of(self.hash_seed, key);
        let i0 = Self::slot_index(&self.ht[0], h);
        if let Some(v) = self.ht[0].slots[i0].remove(key) {
            self.ht[0].count -= 1;
            self.ht[0].key_bytes -= key.byte_size();
            self.ht[0].val_bytes -= v.byte_size();
            self.lru_on_delete(key);
            self.maybe_auto_resize();
            return true;
        }
        if self.rehashing {
            let i1 = Self::slot_index(&self.ht[1], h);
            if let Some(v) = self.ht[1].slots[i1].remove(key) {
                self.ht[1].count -= 1;
                self.ht[1].key_bytes -= key.byte_size();
                self.ht[1].val_bytes -= v.byte_size();
                self.lru_on_delete(key);
                return true;
            }
        }
        false
    }

    pub fn get_and_delete(&mut self, key: &K) -> Option<V> {
        self.rehash_step_if_due();
        let h = hash_of(self.hash_seed, key);
        let i0 = Self::slot_index(&self.ht[0], h);
        if let Some(v) = self.ht[0].slots[i0].remove(key) {
            self.ht[0].count -= 1;
            self.ht[0].key_bytes -= key.byte_size();
            self.ht[0].val_bytes -= v.byte_size();
            self.lru_on_delete(key);
            self.maybe_auto_resize();
            return Some(v);
        }
        if self.rehashing {
            let i1 = Self::slot_index(&self.ht[1], h);
            if let Some(v) = self.ht[1].slots[i1].remove(key) {
                self.ht[1].count -= 1;
                self.ht[1].key_bytes -= key.byte_size();
                self.ht[1].val_bytes -= v.byte_size();
                self.lru_on_delete(key);
                return Some(v);
            }
        }
        None
    }

    fn pick_random_nonempty_table(&self) -> Option<usize> {
        let c0 = self.ht[0].count;
        let c1 = if self.rehashing { self.ht[1].count } else { 0 };
        if c0 + c1 == 0 {
            return None;
        }
        if !self.rehashing {
            return Some(0);
        }
        let r = rand::thread_rng().gen_range(0..(c0 + c1));
        Some(if r < c0 { 0 } else { 1 })
    }

    /// Retries up to 10 times, tolerating a table transiently emptying out
    /// from under the scan across a rehash step.
    pub fn pop_random(&mut self) -> Option<(K, V)> {
        for _ in 0..10 {
            self.rehash_step_if_due();
            let Some(table_idx) = self.pick_random_nonempty_table() else {
                return None;
            };
            let size = self.ht[table_idx].size() as usize;
            if size == 0 {
                continue;
            }
            let start = rand::thread_rng().gen_range(0..size);
            for offset in 0..size {
                let idx = (start + offset) % size;
                if self.ht[table_idx].slots[idx].count() == 0 {
                    continue;
                }
                let pos = rand::thread_rng().gen_range(0..self.ht[table_idx].slots[idx].count() as usize);
                let Some(key) = self.ht[table_idx].slots[idx].key_at_position(pos).cloned() else {
                    continue;
                };
                if let Some(v) = self.ht[table_idx].slots[idx].remove(&key) {
                    self.ht[table_idx].count -= 1;
                    self.ht[table_idx].key_bytes -= key.byte_size();
                    self.ht[table_idx].val_bytes -= v.byte_size();
                    self.lru_on_delete(&key);
                    return Some((key, v));
                }
            }
        }
        None
    }

    /// Samples up to `n` distinct keys, backing off to a fresh random
    /// start once an empty run grows past both 5 and `n` slots.
    pub fn get_some_keys(&mut self, n: usize) -> Vec<K> {
        self.rehash_step_if_due();
        if self.count() == 0 || n == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(n);
        let mut empty_run = 0usize;
        let mut idx = rand::thread_rng().gen_range(0..self.ht[0].size()) as usize;
        let max_attempts = n.saturating_mul(20).max(200);
        let mut attempts = 0usize;
        while out.len() < n && attempts < max_attempts {
            attempts += 1;
            let table_idx = if self.rehashing && rand::thread_rng().gen_bool(0.5) {
                1
            } else {
                0
            };
            let size = self.ht[table_idx].size() as usize;
            let i = idx % size;
            if self.ht[table_idx].slots[i].count() == 0 {
                empty_run += 1;
                if empty_run >= 5 && empty_run > n {
                    idx = rand::thread_rng().gen_range(0..self.ht[0].size()) as usize;
                    empty_run = 0;
                } else {
                    idx += 1;
                }
                continue;
            }
            empty_run = 0;
            for (k, _) in self.ht[table_idx].slots[i].iter() {
                if out.len() >= n {
                    break;
                }
                out.push(k.clone());
            }
            idx += 1;
        }
        out
    }

    /// Reverse-bit cursor scan (the Noordhuis scheme): visiting every
    /// entry present for the whole scan at least once even while the
    /// table grows mid-scan, at the cost of possible duplicates.
    pub fn scan<F: FnMut(&K, &V)>(&mut self, cursor: u64, mut f: F) -> u64 {
        if !self.rehashing {
            let mask = self.ht[0].mask;
            let idx = (cursor & mask) as usize;
            for (k, v) in self.ht[0].slots[idx].iter() {
                f(k, v);
            }
            Self::next_cursor(cursor, mask)
        } else {
            let (small, large) = if self.ht[0].size() <= self.ht[1].size() {
                (0usize, 1usize)
            } else {
                (1usize, 0usize)
            };
            let small_mask = self.ht[small].mask;
            let large_mask = self.ht[large].mask;
            let idx_small = (cursor & small_mask) as usize;
            for (k, v) in self.ht[small].slots[idx_small].iter() {
                f(k, v);
            }
            let mut idx_large = idx_small;
            while (idx_large as u64) <= large_mask {
                for (k, v) in self.ht[large].slots[idx_large].iter() {
                    f(k, v);
                }
                idx_large += small_mask as usize + 1;
            }
            Self::next_cursor(cursor, small_mask)
        }
    }

    fn next_cursor(cursor: u64, mask: u64) -> u64 {
        let mut v = cursor | !mask;
        v = v.reverse_bits();
        v = v.wrapping_add(1);
        v.reverse_bits()
    }

    pub fn set_max_memory(&mut self, bytes: u64) {
        self.options.max_memory = bytes;
    }

    pub fn set_evict_callback(&mut self, cb: impl FnMut(&K, &V) -> bool + 'static) {
        self.evict_callback = Some(Box::new(cb));
    }

    fn lru_victim_key(&mut self) -> Option<K> {
        let (p, target_hash) = {
            let lru = self.lru.as_mut()?;
            let p = lru.lru.remove_minimum()?;
            let backref = *lru.backref.get(p as usize)?;
            if !backref.valid {
                return None;
            }
            (p, backref.key_hash)
        };
        for table_idx in 0..=1usize {
            if table_idx == 1 && !self.rehashing {
                continue;
            }
            let slot_idx = (target_hash & self.ht[table_idx].mask) as usize;
            let found = self.ht[table_idx].slots[slot_idx]
                .iter()
                .find(|(k, _)| hash_of(self.hash_seed, *k) == target_hash)
                .map(|(k, _)| k.clone());
            if let Some(k) = found {
                if self.lru.as_ref().unwrap().key_to_ptr.get(&k) == Some(&p) {
                    return Some(k);
                }
            }
        }
        None
    }

    fn random_victim_key(&mut self) -> Option<K> {
        let table_idx = self.pick_random_nonempty_table()?;
        let size = self.ht[table_idx].size() as usize;
        let start = rand::thread_rng().gen_range(0..size);
        for offset in 0..size {
            let idx = (start + offset) % size;
            if let Some(k) = self.ht[table_idx].slots[idx].last_key() {
                return Some(k.clone());
            }
        }
        None
    }

    /// Evicts entries (LRU or uniform-random per `evict_policy`) until
    /// `key_bytes + val_bytes` is back under `max_memory`, honoring an
    /// eviction callback's veto. Bounded to `2*count + 100` attempts and
    /// 50 consecutive delete failures so a pathological callback can't
    /// spin forever.
    pub fn evict_to_limit(&mut self) -> usize {
        if self.options.max_memory == 0 {
            return 0;
        }
        let max_attempts = 2 * self.count() + 100;
        let mut attempts = 0u64;
        let mut consecutive_failures = 0u32;
        let mut evicted = 0usize;
        while self.key_bytes() + self.val_bytes() > self.options.max_memory
            && attempts < max_attempts
            && consecutive_failures < 50
        {
            attempts += 1;
            let victim = match self.options.evict_policy {
                EvictPolicy::None => break,
                EvictPolicy::Lru => self.lru_victim_key(),
                EvictPolicy::Random => self.random_victim_key(),
            };
            let Some(key) = victim else {
                consecutive_failures += 1;
                continue;
            };
            let allow = match (self.evict_callback.as_mut(), self.peek(&key)) {
                (Some(cb), Some(v)) => cb(&key, v),
                _ => true,
            };
            if !allow {
                consecutive_failures += 1;
                continue;
            }
            if self.delete(&key) {
                tracing::debug!(attempt = attempts, "evicted key to stay under max_memory");
                evicted += 1;
                consecutive_failures = 0;
            } else {
                consecutive_failures += 1;
            }
        }
        evicted
    }

    pub fn iter_unsafe(&self) -> UnsafeDictIter<K, V>
    where
        V: Clone,
    {
        let mut items = Vec::with_capacity((self.ht[0].count + self.ht[1].count) as usize);
        for s in &self.ht[0].slots {
            for (k, v) in s.iter() {
                items.push((k.clone(), v.clone()));
            }
        }
        if self.rehashing {
            for s in &self.ht[1].slots {
                for (k, v) in s.iter() {
                    items.push((k.clone(), v.clone()));
                }
            }
        }
        UnsafeDictIter {
            items: items.into_iter(),
            fingerprint: self.fingerprint(),
        }
    }

    /// Registers a live iteration, suppressing incremental rehash steps
    /// until [`Self::iter_safe_end`] is called.
    pub fn iter_safe_begin(&mut self) -> SafeDictIter {
        self.iterators += 1;
        SafeDictIter {
            table: 0,
            slot: 0,
            pos: 0,
        }
    }

    pub fn iter_safe_next(&self, it: &mut SafeDictIter) -> Option<(K, V)>
    where
        V: Clone,
    {
        loop {
            if it.table > 1 || (it.table == 1 && !self.rehashing) {
                return None;
            }
            let table = &self.ht[it.table];
            if it.slot >= table.slots.len() {
                it.table += 1;
                it.slot = 0;
                it.pos = 0;
                continue;
            }
            let slot = &table.slots[it.slot];
            match slot.key_at_position(it.pos) {
                Some(k) => {
                    let key = k.clone();
                    it.pos += 1;
                    if let Some(v) = slot.find(&key) {
                        return Some((key, v.clone()));
                    }
                    continue;
                }
                None => {
                    it.slot += 1;
                    it.pos = 0;
                    continue;
                }
            }
        }
    }

    pub fn iter_safe_end(&mut self, _it: SafeDictIter) {
        self.iterators = self.iterators.saturating_sub(1);
    }
}

impl<K, V, S> MultiDict<K, V, S>
where
    K: Eq + Hash + Clone + ByteSize,
    V: ByteSize + DictNumeric + Clone,
    S: SlotBackend<K, V>,
{
    /// Creates `key` at `delta` if absent; otherwise adds `delta` to its
    /// current value, failing with [`CoreError::NonNumeric`] if that
    /// value can't be read as an integer, or on overflow.
    pub fn incr_by(&mut self, key: &K, delta: i64) -> CoreResult<i64> {
        self.rehash_step_if_due();
        let h = hash_of(self.hash_seed, key);
        let located = {
            let i0 = Self::slot_index(&self.ht[0], h);
            if self.ht[0].slots[i0].find(key).is_some() {
                Some((0usize, i0))
            } else if self.rehashing {
                let i1 = Self::slot_index(&self.ht[1], h);
                if self.ht[1].slots[i1].find(key).is_some() {
                    Some((1usize, i1))
                } else {
                    None
                }
            } else {
                None
            }
        };
        let Some((table_idx, idx)) = located else {
            self.add(key.clone(), V::from_i64(delta))?;
            return Ok(delta);
        };
        let current = self.ht[table_idx].slots[idx].find(key).expect("located above");
        let current_i = current.as_i64().ok_or(CoreError::NonNumeric)?;
        let new_i = current_i.checked_add(delta).ok_or(CoreError::NonNumeric)?;
        let old_bytes = current.byte_size();
        let new_value = V::from_i64(new_i);
        let new_bytes = new_value.byte_size();
        self.ht[table_idx].slots[idx].insert(key.clone(), new_value);
        self.ht[table_idx].val_bytes = self.ht[table_idx].val_bytes + new_bytes - old_bytes;
        self.lru_on_touch(key);
        Ok(new_i)
    }

    /// As [`Self::incr_by`] but over floats; rejects a result that isn't
    /// finite (NaN/infinite) the same way a non-numeric existing value is
    /// rejected.
    pub fn incr_by_float(&mut self, key: &K, delta: f64) -> CoreResult<f64> {
        self.rehash_step_if_due();
        let h = hash_of(self.hash_seed, key);
        let located = {
            let i0 = Self::slot_index(&self.ht[0], h);
            if self.ht[0].slots[i0].find(key).is_some() {
                Some((0usize, i0))
            } else if self.rehashing {
                let i1 = Self::slot_index(&self.ht[1], h);
                if self.ht[1].slots[i1].find(key).is_some() {
                    Some((1usize, i1))
                } else {
                    None
                }
            } else {
                None
            }
        };
        let Some((table_idx, idx)) = located else {
            if !delta.is_finite() {
                return Err(CoreError::NonNumeric);
            }
            self.add(key.clone(), V::from_f64(delta))?;
            return Ok(delta);
        };
        let current = self.ht[table_idx].slots[idx].find(key).expect("located above");
        let current_f = current.as_f64().ok_or(CoreError::NonNumeric)?;
        let new_f = current_f + delta;
        if !new_f.is_finite() {
            return Err(CoreError::NonNumeric);
        }
        let old_bytes = current.byte_size();
        let new_value = V::from_f64(new_f);
        let new_bytes = new_value.byte_size();
        self.ht[table_idx].slots[idx].insert(key.clone(), new_value);
        self.ht[table_idx].val_bytes = self.ht[table_idx].val_bytes + new_bytes - old_bytes;
        self.lru_on_touch(key);
        Ok(new_f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DictOptions, EvictPolicy, LruOptions};

    fn dict() -> MultiDict<String, String, VecSlot<String, String>> {
        MultiDict::new(DictOptions::default())
    }

    #[test]
    fn add_then_find_roundtrips() {
        let mut d = dict();
        assert_eq!(d.add("a".into(), "1".into()).unwrap(), Inserted::New);
        assert_eq!(d.find(&"a".to_string()), Some(&"1".to_string()));
        assert_eq!(d.add("a".into(), "2".into()).unwrap(), Inserted::Replaced);
        assert_eq!(d.find(&"a".to_string()), Some(&"2".to_string()));
    }

    #[test]
    fn nx_xx_preconditions_are_enforced() {
        let mut d = dict();
        assert!(d.add_nx("a".into(), "1".into()).is_ok());
        assert!(matches!(
            d.add_nx("a".into(), "2".into()),
            Err(CoreError::Precondition)
        ));
        assert!(matches!(
            d.add_xx("b".into(), "1".into()),
            Err(CoreError::Precondition)
        ));
        assert!(d.add_xx("a".into(), "3".into()).is_ok());
    }

    #[test]
    fn delete_and_get_and_delete() {
        let mut d = dict();
        d.add("a".into(), "1".into()).unwrap();
        assert_eq!(d.get_and_delete(&"a".to_string()), Some("1".to_string()));
        assert!(!d.delete(&"a".to_string()));
        d.add("b".into(), "2".into()).unwrap();
        assert!(d.delete(&"b".to_string()));
    }

    #[test]
    fn byte_accounting_matches_total() {
        let mut d = dict();
        for i in 0..20 {
            d.add(format!("key{i}"), format!("value{i}")).unwrap();
        }
        assert_eq!(
            d.total_bytes(),
            d.used_bytes() + d.key_bytes() + d.val_bytes()
        );
    }

    #[test]
    fn incr_by_creates_and_accumulates() {
        let mut d: MultiDict<String, i64, VecSlot<String, i64>> = MultiDict::new(DictOptions::default());
        assert_eq!(d.incr_by(&"c".to_string(), 5).unwrap(), 5);
        assert_eq!(d.incr_by(&"c".to_string(), 3).unwrap(), 8);
        assert_eq!(*d.find(&"c".to_string()).unwrap(), 8);
    }

    #[test]
    fn incr_by_rejects_non_numeric_string_value() {
        let mut d = dict();
        d.add("s".into(), "not-a-number".into()).unwrap();
        assert!(matches!(
            d.incr_by(&"s".to_string(), 1),
            Err(CoreError::NonNumeric)
        ));
    }

    #[test]
    fn incr_by_float_accumulates() {
        let mut d: MultiDict<String, f64, VecSlot<String, f64>> = MultiDict::new(DictOptions::default());
        assert!((d.incr_by_float(&"f".to_string(), 1.5).unwrap() - 1.5).abs() < 1e-9);
        assert!((d.incr_by_float(&"f".to_string(), 2.25).unwrap() - 3.75).abs() < 1e-9);
    }

    #[test]
    fn rehash_correctness_over_2000_keys() {
        let mut d = dict();
        for i in 0..2000 {
            d.add(format!("rehash_test_{i}"), format!("v{i}")).unwrap();
        }
        let current_size = (d.count().max(1)).next_power_of_two();
        d.expand(current_size * 4).unwrap();
        for _ in 0..50 {
            d.rehash_step(1);
        }
        for i in 0..2000 {
            let key = format!("rehash_test_{i}");
            assert_eq!(d.find(&key), Some(&format!("v{i}")));
        }
    }

    #[test]
    fn scan_visits_every_key_across_a_rehash() {
        let mut d = dict();
        for i in 0..1000 {
            d.add(format!("exact_{i:05}"), "v".into()).unwrap();
        }
        d.expand(4096).unwrap();
        for _ in 0..200 {
            d.rehash_step(1);
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor = 0u64;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(k.clone());
            });
            if cursor == 0 {
                break;
            }
        }
        for i in 0..1000 {
            assert!(seen.contains(&format!("exact_{i:05}")));
        }
    }

    #[test]
    fn lru_eviction_protects_hot_keys() {
        let mut d = dict();
        d.enable_lru(LruOptions::default()).unwrap();
        let mut opts = DictOptions::default();
        opts.evict_policy = EvictPolicy::Lru;
        d.options = opts;
        d.set_max_memory(3000);

        for i in 0..50 {
            d.add(format!("hkey{i:04}"), "x".repeat(20)).unwrap();
        }
        for _ in 0..100 {
            d.find(&"hkey0000".to_string());
        }
        for i in 50..200 {
            d.add(format!("hkey{i:04}"), "x".repeat(20)).unwrap();
        }
        d.evict_to_limit();
        assert!(d.find(&"hkey0000".to_string()).is_some());
    }

    #[test]
    fn pop_random_removes_a_real_entry() {
        let mut d = dict();
        for i in 0..10 {
            d.add(format!("k{i}"), format!("v{i}")).unwrap();
        }
        let before = d.count();
        let popped = d.pop_random();
        assert!(popped.is_some());
        assert_eq!(d.count(), before - 1);
        let (k, v) = popped.unwrap();
        assert!(v.starts_with('v'));
        assert!(!d.contains_key(&k));
    }

    #[test]
    fn get_some_keys_returns_distinct_existing_keys() {
        let mut d = dict();
        for i in 0..100 {
            d.add(format!("k{i}"), format!("v{i}")).unwrap();
        }
        let sample = d.get_some_keys(10);
        let unique: std::collections::HashSet<_> = sample.iter().cloned().collect();
        assert_eq!(unique.len(), sample.len());
        for k in &sample {
            assert!(d.contains_key(k));
        }
    }

    #[test]
    fn unsafe_iter_fingerprint_matches_when_untouched() {
        let mut d = dict();
        for i in 0..5 {
            d.add(format!("k{i}"), format!("v{i}")).unwrap();
        }
        let it = d.iter_unsafe();
        let collected: Vec<_> = it.collect();
        assert_eq!(collected.len(), 5);
    }

    #[test]
    fn safe_iter_visits_every_entry() {
        let mut d = dict();
        for i in 0..30 {
            d.add(format!("k{i}"), format!("v{i}")).unwrap();
        }
        let mut it = d.iter_safe_begin();
        let mut seen = std::collections::HashSet::new();
        while let Some((k, _)) = d.iter_safe_next(&mut it) {
            seen.insert(k);
        }
        d.iter_safe_end(it);
        assert_eq!(seen.len(), 30);
    }

    use proptest::prelude::*;
    use std::collections::HashMap as StdMap;

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u32),
        Delete(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u8..20, any::<u32>()).prop_map(|(k, v)| Op::Add(k, v)),
            1 => (0u8..20).prop_map(Op::Delete),
        ]
    }

    proptest! {
        // D-INV-1, D-INV-2, D-INV-3, D-INV-4: hold after every op in an
        // arbitrary add/delete sequence, checked against a reference map.
        #[test]
        fn invariants_hold_across_random_operation_sequences(ops in prop::collection::vec(op_strategy(), 0..400)) {
            let mut d: MultiDict<String, u32, VecSlot<String, u32>> = MultiDict::new(DictOptions::default());
            let mut model: StdMap<String, u32> = StdMap::new();

            for op in ops {
                match op {
                    Op::Add(k, v) => {
                        let key = format!("k{k}");
                        d.add(key.clone(), v).unwrap();
                        model.insert(key, v);
                    }
                    Op::Delete(k) => {
                        let key = format!("k{k}");
                        let removed = d.delete(&key);
                        prop_assert_eq!(removed, model.remove(&key).is_some());
                    }
                }

                // D-INV-1 / D-INV-4
                prop_assert_eq!(d.count() as usize, model.len());
                // D-INV-2
                prop_assert_eq!(d.total_bytes(), d.used_bytes() + d.key_bytes() + d.val_bytes());
            }

            // D-INV-3: every key that survived the sequence still finds its
            // last-written value.
            for (k, v) in &model {
                prop_assert_eq!(d.find(k), Some(v));
            }
        }

        // D-INV-5: scan-to-completion visits every live key at least once,
        // including across an in-progress rehash.
        #[test]
        fn scan_to_completion_visits_every_key(n in 1usize..300, trigger_rehash in any::<bool>()) {
            let mut d: MultiDict<String, u32, VecSlot<String, u32>> = MultiDict::new(DictOptions::default());
            let mut expected = std::collections::HashSet::new();
            for i in 0..n {
                let key = format!("scan{i:05}");
                d.add(key.clone(), i as u32).unwrap();
                expected.insert(key);
            }
            if trigger_rehash {
                let _ = d.expand((n as u64).max(1) * 4);
                for _ in 0..5 {
                    d.rehash_step(4);
                }
            }

            let mut seen = std::collections::HashSet::new();
            let mut cursor = 0u64;
            loop {
                cursor = d.scan(cursor, |k, _| {
                    seen.insert(k.clone());
                });
                if cursor == 0 {
                    break;
                }
            }
            prop_assert!(expected.is_subset(&seen));
        }
    }
}
