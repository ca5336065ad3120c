//! One shard's partition of the keyspace.
//!
//! A `DbSlice` is owned by exactly one shard thread and is only ever touched from hops
//! running on that thread, so it needs no interior locking at all.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────── DbSlice ─────────────────────────────┐
//! │  slots: [ HashMap ][ HashMap ][ HashMap ] ... [ HashMap ]         │
//! │            slot 0     slot 1     slot 2         slot N-1          │
//! │                                                                   │
//! │  expires: BTreeMap<key, deadline_ms>   (keys carrying a TTL)      │
//! │  sweep_cursor: last key examined by the active sweep              │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys are spread over a fixed number of slots by the high half of their hash (the
//! low half picks the shard). The slot count never changes, so a slot index is a
//! stable scan position: a key that lives for a whole SCAN sequence sits in the same
//! slot the entire time and is reported when the cursor passes that slot.
//!
//! ## Expiry
//!
//! Deadlines are absolute unix milliseconds. Every accessor takes the shard's sampled
//! `now` and removes a past-due entry before answering (lazy expiry). The `expires`
//! index lets the active sweep visit only keys that carry a deadline.

use crate::error::{EngineError, EngineResult};
use crate::storage::glob::GlobPattern;
use crate::storage::value::{Value, ValueType};
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use tracing::trace;

/// Hashes a key. The low 32 bits route to a shard, the high 32 bits pick a slot.
///
/// `DefaultHasher::new()` uses fixed keys, so the result is stable for the lifetime of
/// the process (and across processes built with the same std).
#[inline]
pub fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A stored value plus its optional absolute deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    /// Unix milliseconds after which the key is gone (None = persistent)
    pub expire_at: Option<u64>,
}

impl Entry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expire_at: None,
        }
    }

    pub fn with_expiry(value: Value, expire_at: Option<u64>) -> Self {
        Self { value, expire_at }
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }

    /// A deadline equal to `now` counts as passed.
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expire_at, Some(at) if at <= now)
    }

    /// Remaining lifetime in milliseconds, or None for persistent keys.
    pub fn ttl_ms(&self, now: u64) -> Option<u64> {
        self.expire_at.map(|at| at.saturating_sub(now))
    }
}

/// SCAN filters evaluated inside the shard.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub pattern: Option<GlobPattern>,
    pub value_type: Option<ValueType>,
}

impl ScanFilter {
    fn accepts(&self, key: &[u8], entry: &Entry) -> bool {
        if let Some(ty) = self.value_type {
            if entry.value_type() != ty {
                return false;
            }
        }
        self.pattern.as_ref().map_or(true, |p| p.matches(key))
    }
}

/// Outcome of one active-expiry pass over a slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Keys with a deadline that were looked at
    pub examined: usize,
    /// Keys removed because their deadline had passed
    pub expired: usize,
}

/// Result of scanning a run of slots.
#[derive(Debug, Clone, Default)]
pub struct ScanStep {
    pub keys: Vec<Bytes>,
    /// First slot not yet visited, or None when the slice is exhausted
    pub next_slot: Option<usize>,
}

/// Point-in-time counters for a slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceStats {
    pub keys: usize,
    pub expires: usize,
    pub expired_keys: u64,
    pub used_memory: usize,
}

/// The keyspace partition owned by a single shard.
#[derive(Debug)]
pub struct DbSlice {
    slots: Vec<HashMap<Bytes, Entry>>,
    slot_mask: u64,
    expires: BTreeMap<Bytes, u64>,
    sweep_cursor: Option<Bytes>,
    len: usize,
    expired_keys: u64,
}

impl DbSlice {
    /// Creates an empty slice. `slot_count` must be a power of two.
    pub fn new(slot_count: usize) -> Self {
        assert!(
            slot_count.is_power_of_two(),
            "slot count must be a power of two"
        );
        Self {
            slots: (0..slot_count).map(|_| HashMap::new()).collect(),
            slot_mask: slot_count as u64 - 1,
            expires: BTreeMap::new(),
            sweep_cursor: None,
            len: 0,
            expired_keys: 0,
        }
    }

    #[inline]
    fn slot_of(&self, key: &[u8]) -> usize {
        ((key_hash(key) >> 32) & self.slot_mask) as usize
    }

    /// Number of stored keys, including past-due keys not yet reclaimed.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of keys carrying a deadline.
    pub fn expires_len(&self) -> usize {
        self.expires.len()
    }

    /// Removes `key` if its deadline has passed. Returns true if a live entry remains.
    fn expire_if_needed(&mut self, key: &[u8], now: u64) -> bool {
        let slot = self.slot_of(key);
        match self.slots[slot].get(key) {
            None => false,
            Some(entry) if entry.is_expired(now) => {
                self.slots[slot].remove(key);
                self.expires.remove(key);
                self.len -= 1;
                self.expired_keys += 1;
                trace!(slot, "lazily expired key");
                false
            }
            Some(_) => true,
        }
    }

    /// Looks up a live entry.
    pub fn get(&mut self, key: &[u8], now: u64) -> Option<&Entry> {
        if !self.expire_if_needed(key, now) {
            return None;
        }
        let slot = self.slot_of(key);
        self.slots[slot].get(key)
    }

    /// Looks up a live entry that must hold `ty`.
    pub fn get_typed(
        &mut self,
        key: &[u8],
        ty: ValueType,
        now: u64,
    ) -> EngineResult<Option<&Entry>> {
        match self.get(key, now) {
            Some(entry) if entry.value_type() != ty => Err(EngineError::WrongType),
            other => Ok(other),
        }
    }

    /// Mutable access to a live value. Deadlines are changed through
    /// [`set_expiry`](Self::set_expiry) so the expiry index stays in sync.
    pub fn value_mut(&mut self, key: &[u8], now: u64) -> Option<&mut Value> {
        if !self.expire_if_needed(key, now) {
            return None;
        }
        let slot = self.slot_of(key);
        self.slots[slot].get_mut(key).map(|e| &mut e.value)
    }

    /// Mutable access to a live value that must hold `ty`.
    pub fn value_mut_typed(
        &mut self,
        key: &[u8],
        ty: ValueType,
        now: u64,
    ) -> EngineResult<Option<&mut Value>> {
        match self.value_mut(key, now) {
            Some(value) if value.value_type() != ty => Err(EngineError::WrongType),
            other => Ok(other),
        }
    }

    pub fn exists(&mut self, key: &[u8], now: u64) -> bool {
        self.expire_if_needed(key, now)
    }

    /// Stores `entry` under `key`, replacing whatever was there.
    /// Returns the previous entry, expired or not.
    pub fn insert(&mut self, key: Bytes, entry: Entry) -> Option<Entry> {
        match entry.expire_at {
            Some(at) => {
                self.expires.insert(key.clone(), at);
            }
            None => {
                self.expires.remove(&key);
            }
        }
        let slot = self.slot_of(&key);
        let previous = self.slots[slot].insert(key, entry);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Removes `key`, returning its entry if it was live.
    pub fn remove(&mut self, key: &[u8], now: u64) -> Option<Entry> {
        if !self.expire_if_needed(key, now) {
            return None;
        }
        let slot = self.slot_of(key);
        let entry = self.slots[slot].remove(key)?;
        self.expires.remove(key);
        self.len -= 1;
        Some(entry)
    }

    /// Sets or clears the deadline of a live key. A deadline at or before `now` removes
    /// the key at once. Returns false if the key does not exist.
    pub fn set_expiry(&mut self, key: &[u8], expire_at: Option<u64>, now: u64) -> bool {
        if !self.expire_if_needed(key, now) {
            return false;
        }
        if matches!(expire_at, Some(at) if at <= now) {
            self.remove(key, now);
            self.expired_keys += 1;
            return true;
        }

        let slot = self.slot_of(key);
        let Some(entry) = self.slots[slot].get_mut(key) else {
            return false;
        };
        entry.expire_at = expire_at;
        match expire_at {
            Some(at) => {
                self.expires.insert(Bytes::copy_from_slice(key), at);
            }
            None => {
                self.expires.remove(key);
            }
        }
        true
    }

    /// Moves the entry at `src` to `dst` in one step, keeping value and deadline and
    /// overwriting any previous `dst`.
    pub fn rename(&mut self, src: &[u8], dst: Bytes, now: u64) -> EngineResult<()> {
        let entry = self.remove(src, now).ok_or(EngineError::NoSuchKey)?;
        self.insert(dst, entry);
        Ok(())
    }

    /// Active expiry: examines up to `budget` keys carrying a deadline, continuing from
    /// where the previous pass stopped, and removes those already past due.
    pub fn sweep_expired(&mut self, now: u64, budget: usize) -> SweepStats {
        let start = match self.sweep_cursor.take() {
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Unbounded,
        };
        let candidates: Vec<(Bytes, u64)> = self
            .expires
            .range((start, Bound::Unbounded))
            .take(budget)
            .map(|(k, at)| (k.clone(), *at))
            .collect();

        // A short batch means we reached the end; the next pass starts over.
        if candidates.len() == budget {
            self.sweep_cursor = candidates.last().map(|(k, _)| k.clone());
        }

        let mut stats = SweepStats {
            examined: candidates.len(),
            expired: 0,
        };
        for (key, at) in candidates {
            if at <= now {
                let slot = self.slot_of(&key);
                if self.slots[slot].remove(&key).is_some() {
                    self.len -= 1;
                }
                self.expires.remove(&key);
                self.expired_keys += 1;
                stats.expired += 1;
            }
        }
        stats
    }

    /// Collects matching live keys of one slot. Returns the number of entries examined.
    fn scan_slot(
        &mut self,
        slot: usize,
        now: u64,
        filter: &ScanFilter,
        out: &mut Vec<Bytes>,
    ) -> usize {
        let mut expired = Vec::new();
        let mut examined = 0;
        for (key, entry) in &self.slots[slot] {
            examined += 1;
            if entry.is_expired(now) {
                expired.push(key.clone());
            } else if filter.accepts(key, entry) {
                out.push(key.clone());
            }
        }
        for key in expired {
            self.expire_if_needed(&key, now);
        }
        examined
    }

    /// Scans whole slots starting at `start_slot` until roughly `budget` entries have
    /// been examined. Slots are never split between calls.
    pub fn scan(
        &mut self,
        start_slot: usize,
        budget: usize,
        now: u64,
        filter: &ScanFilter,
    ) -> ScanStep {
        let budget = budget.max(1);
        let max_slots = budget.saturating_mul(10);
        let mut step = ScanStep::default();
        let mut slot = start_slot;
        let mut examined = 0;
        let mut visited = 0;

        while slot < self.slots.len() && examined < budget && visited < max_slots {
            examined += self.scan_slot(slot, now, filter, &mut step.keys);
            slot += 1;
            visited += 1;
        }

        step.next_slot = (slot < self.slots.len()).then_some(slot);
        step
    }

    /// Every live key matching `pattern`.
    pub fn keys_matching(&self, pattern: &GlobPattern, now: u64) -> Vec<Bytes> {
        self.slots
            .iter()
            .flat_map(|slot| slot.iter())
            .filter(|(key, entry)| !entry.is_expired(now) && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.expires.clear();
        self.sweep_cursor = None;
        self.len = 0;
    }

    pub fn stats(&self) -> SliceStats {
        let used_memory = self
            .slots
            .iter()
            .flat_map(|slot| slot.iter())
            .map(|(key, entry)| key.len() + entry.value.approximate_size() + 64)
            .sum();
        SliceStats {
            keys: self.len,
            expires: self.expires.len(),
            expired_keys: self.expired_keys,
            used_memory,
        }
    }
}
