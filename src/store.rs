//! In-memory keyspace: string, hash, and sorted-set maps with expiration.
//!
//! One mutex guards all three typed maps plus the unified expiration
//! index; every public operation caches the clock once on entry so a
//! single call never observes an intra-call time advance. Keys of
//! different types live in separate maps and the same name may exist in
//! more than one of them.

use crate::skiplist::{SkipList, zset_order};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sorted sets flip from a sorted vector to a skip list above this size.
pub const ZSET_VECTOR_THRESHOLD: usize = 128;

/// Monotonic milliseconds (CLOCK_MONOTONIC), the time base for every
/// `expire_at_ms` in the store.
pub(crate) fn now_ms() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

/// Canonical textual form for sorted-set scores; used by the ZSCORE
/// reply, the rewrite command stream, and the snapshot format so scores
/// round-trip identically through every persistence path.
pub fn format_score(score: f64) -> String {
    format!("{score:.6}")
}

/// A string value plus its absolute deadline (−1 = no expiry).
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRecord {
    pub value: Bytes,
    pub expire_at_ms: i64,
}

/// A hash value: named fields plus a whole-key deadline.
#[derive(Debug, Clone)]
pub struct HashRecord {
    pub fields: FxHashMap<Bytes, Bytes>,
    pub expire_at_ms: i64,
}

impl Default for HashRecord {
    fn default() -> Self {
        Self {
            fields: FxHashMap::default(),
            expire_at_ms: -1,
        }
    }
}

/// Ordered index of a sorted set. Small sets use a sorted vector; once
/// one grows past [`ZSET_VECTOR_THRESHOLD`] it flips to a skip list and
/// stays there for the life of the record.
#[derive(Debug)]
pub enum ZSetIndex {
    Vec(Vec<(f64, Bytes)>),
    Skip(SkipList),
}

#[derive(Debug)]
pub struct ZSetRecord {
    pub index: ZSetIndex,
    /// Authoritative member → score mapping, kept incrementally.
    pub member_score: FxHashMap<Bytes, f64>,
    pub expire_at_ms: i64,
}

impl Default for ZSetRecord {
    fn default() -> Self {
        Self {
            index: ZSetIndex::Vec(Vec::new()),
            member_score: FxHashMap::default(),
            expire_at_ms: -1,
        }
    }
}

impl ZSetRecord {
    pub fn len(&self) -> usize {
        self.member_score.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_score.is_empty()
    }

    fn items(&self) -> Vec<(f64, Bytes)> {
        match &self.index {
            ZSetIndex::Vec(items) => items.clone(),
            ZSetIndex::Skip(sl) => sl.to_vec(),
        }
    }
}

/// Flattened sorted set handed to the snapshot and rewrite paths.
#[derive(Debug, Clone)]
pub struct ZSetFlat {
    pub key: Bytes,
    pub items: Vec<(f64, Bytes)>,
    pub expire_at_ms: i64,
}

/// What the active-expiration sampler removes when a sampled key's
/// deadline has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpirePolicy {
    /// Remove the name from all three typed maps (observed behavior; the
    /// same name in another map loses its entry even if its own deadline
    /// differs).
    #[default]
    AllMaps,
    /// Remove only the string-map entry.
    StringOnly,
}

struct StoreInner {
    strings: FxHashMap<Bytes, ValueRecord>,
    hashes: FxHashMap<Bytes, HashRecord>,
    zsets: FxHashMap<Bytes, ZSetRecord>,
    /// key → deadline for every key (of any type) with a finite expiry.
    expire_index: FxHashMap<Bytes, i64>,
    rng: StdRng,
}

/// The keyspace. All operations lock the single inner mutex for their
/// duration; snapshots clone under the same lock.
pub struct KeyValueStore {
    inner: Mutex<StoreInner>,
    policy: ExpirePolicy,
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e3779b97f4a7c15);
        Self::with_seed(seed)
    }

    /// Deterministic store for tests: fixes skip-list level generation
    /// and expiration sampling.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                strings: FxHashMap::default(),
                hashes: FxHashMap::default(),
                zsets: FxHashMap::default(),
                expire_index: FxHashMap::default(),
                rng: StdRng::seed_from_u64(seed),
            }),
            policy: ExpirePolicy::default(),
        }
    }

    pub fn with_expire_policy(mut self, policy: ExpirePolicy) -> Self {
        self.policy = policy;
        self
    }

    // ---- string operations ----

    /// Unconditional overwrite. A `SET` without a TTL drops any previous
    /// expiry on the key.
    pub fn set(&self, key: Bytes, value: Bytes, ttl_ms: Option<i64>) -> bool {
        let mut inner = self.inner.lock();
        let expire_at = match ttl_ms {
            Some(ttl) => now_ms() + ttl,
            None => -1,
        };
        inner.strings.insert(
            key.clone(),
            ValueRecord {
                value,
                expire_at_ms: expire_at,
            },
        );
        if expire_at >= 0 {
            inner.expire_index.insert(key, expire_at);
        } else {
            inner.expire_index.remove(&key);
        }
        true
    }

    /// Restore path: stores the absolute deadline as-is (snapshot reload).
    pub fn set_with_expire_at_ms(&self, key: Bytes, value: Bytes, expire_at_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        inner.strings.insert(
            key.clone(),
            ValueRecord {
                value,
                expire_at_ms,
            },
        );
        if expire_at_ms >= 0 {
            inner.expire_index.insert(key, expire_at_ms);
        }
        true
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_string(&mut inner, key, now);
        inner.strings.get(key).map(|r| r.value.clone())
    }

    /// Deletes string-map entries only; hash and sorted-set entries with
    /// the same name are untouched (`exists` still spans all maps).
    pub fn del(&self, keys: &[Bytes]) -> usize {
        let mut inner = self.inner.lock();
        let now = now_ms();
        let mut removed = 0;
        for key in keys {
            Self::cleanup_string(&mut inner, key, now);
            if inner.strings.remove(key.as_ref() as &[u8]).is_some() {
                inner.expire_index.remove(key.as_ref() as &[u8]);
                removed += 1;
            }
        }
        removed
    }

    /// Union over all three typed maps.
    pub fn exists(&self, key: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_string(&mut inner, key, now);
        inner.strings.contains_key(key)
            || inner.hashes.contains_key(key)
            || inner.zsets.contains_key(key)
    }

    /// Applies to the string map only. A negative TTL clears the expiry.
    pub fn expire(&self, key: &[u8], ttl_seconds: i64) -> bool {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_string(&mut inner, key, now);
        let Some(record) = inner.strings.get_mut(key) else {
            return false;
        };
        if ttl_seconds < 0 {
            record.expire_at_ms = -1;
            inner.expire_index.remove(key);
            return true;
        }
        let deadline = now + ttl_seconds * 1000;
        record.expire_at_ms = deadline;
        inner
            .expire_index
            .insert(Bytes::copy_from_slice(key), deadline);
        true
    }

    /// Seconds remaining (floored), −1 when there is no expiry, −2 when
    /// the key is absent or already expired.
    pub fn ttl(&self, key: &[u8]) -> i64 {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_string(&mut inner, key, now);
        let Some(record) = inner.strings.get(key) else {
            return -2;
        };
        if record.expire_at_ms < 0 {
            return -1;
        }
        let ms_left = record.expire_at_ms - now;
        if ms_left <= 0 {
            return -2;
        }
        ms_left / 1000
    }

    /// Sample the expiration index from a random position and remove
    /// every sampled key whose deadline has passed. Bounded by
    /// `max_steps` samples per call; never sweeps the whole keyspace.
    pub fn expire_scan_step(&self, max_steps: usize) -> usize {
        let mut inner = self.inner.lock();
        if max_steps == 0 || inner.expire_index.is_empty() {
            return 0;
        }
        let now = now_ms();
        let n = inner.expire_index.len();
        let start = inner.rng.random_range(0..n);
        let mut sampled: Vec<(Bytes, i64)> = inner
            .expire_index
            .iter()
            .skip(start)
            .take(max_steps)
            .map(|(k, &when)| (k.clone(), when))
            .collect();
        if sampled.len() < max_steps {
            sampled.extend(
                inner
                    .expire_index
                    .iter()
                    .take(max_steps - sampled.len())
                    .map(|(k, &when)| (k.clone(), when)),
            );
        }
        let mut removed = 0;
        for (key, when) in sampled {
            if when < 0 || now < when {
                continue;
            }
            if inner.expire_index.remove(&key).is_none() {
                continue;
            }
            inner.strings.remove(&key);
            if self.policy == ExpirePolicy::AllMaps {
                inner.hashes.remove(&key);
                inner.zsets.remove(&key);
            }
            removed += 1;
        }
        removed
    }

    /// Drop every record of every type.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.strings.clear();
        inner.hashes.clear();
        inner.zsets.clear();
        inner.expire_index.clear();
    }

    // ---- snapshots (the exchange point with the rewrite and RDB paths) ----

    pub fn snapshot(&self) -> Vec<(Bytes, ValueRecord)> {
        let inner = self.inner.lock();
        inner
            .strings
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    pub fn snapshot_hash(&self) -> Vec<(Bytes, HashRecord)> {
        let inner = self.inner.lock();
        inner
            .hashes
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }

    pub fn snapshot_zset(&self) -> Vec<ZSetFlat> {
        let inner = self.inner.lock();
        inner
            .zsets
            .iter()
            .map(|(k, r)| ZSetFlat {
                key: k.clone(),
                items: r.items(),
                expire_at_ms: r.expire_at_ms,
            })
            .collect()
    }

    /// Deduplicated, sorted union of keys across all three maps.
    pub fn list_keys(&self) -> Vec<Bytes> {
        let inner = self.inner.lock();
        let mut out: Vec<Bytes> =
            Vec::with_capacity(inner.strings.len() + inner.hashes.len() + inner.zsets.len());
        out.extend(inner.strings.keys().cloned());
        out.extend(inner.hashes.keys().cloned());
        out.extend(inner.zsets.keys().cloned());
        out.sort();
        out.dedup();
        out
    }

    // ---- hash operations ----

    /// Returns 1 when the field was created, 0 when it overwrote.
    pub fn hset(&self, key: Bytes, field: Bytes, value: Bytes) -> i64 {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_hash(&mut inner, &key, now);
        let record = inner.hashes.entry(key).or_default();
        if record.fields.insert(field, value).is_none() {
            1
        } else {
            0
        }
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_hash(&mut inner, key, now);
        inner.hashes.get(key)?.fields.get(field).cloned()
    }

    /// Removes fields; a hash left with no fields is removed entirely.
    pub fn hdel(&self, key: &[u8], fields: &[Bytes]) -> usize {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_hash(&mut inner, key, now);
        let Some(record) = inner.hashes.get_mut(key) else {
            return 0;
        };
        let mut removed = 0;
        for field in fields {
            if record.fields.remove(field).is_some() {
                removed += 1;
            }
        }
        if record.fields.is_empty() {
            inner.hashes.remove(key);
        }
        removed
    }

    pub fn hexists(&self, key: &[u8], field: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_hash(&mut inner, key, now);
        inner
            .hashes
            .get(key)
            .is_some_and(|r| r.fields.contains_key(field))
    }

    /// Flattened `[field, value, field, value, ...]` pairs.
    pub fn hgetall_flat(&self, key: &[u8]) -> Vec<Bytes> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_hash(&mut inner, key, now);
        let Some(record) = inner.hashes.get(key) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(record.fields.len() * 2);
        for (field, value) in &record.fields {
            out.push(field.clone());
            out.push(value.clone());
        }
        out
    }

    pub fn hlen(&self, key: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_hash(&mut inner, key, now);
        inner.hashes.get(key).map_or(0, |r| r.fields.len())
    }

    /// Restore path for hash deadlines.
    pub fn set_hash_expire_at_ms(&self, key: &[u8], expire_at_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        let Some(record) = inner.hashes.get_mut(key) else {
            return false;
        };
        record.expire_at_ms = expire_at_ms;
        if expire_at_ms >= 0 {
            inner
                .expire_index
                .insert(Bytes::copy_from_slice(key), expire_at_ms);
        } else {
            inner.expire_index.remove(key);
        }
        true
    }

    // ---- sorted-set operations ----

    /// Returns 1 when the member was inserted, 0 when its score was
    /// updated (or unchanged).
    pub fn zadd(&self, key: Bytes, score: f64, member: Bytes) -> i64 {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_zset(&mut inner, &key, now);
        let StoreInner { zsets, rng, .. } = &mut *inner;
        let record = zsets.entry(key).or_default();
        match record.member_score.get(&member).copied() {
            None => {
                Self::zindex_insert(record, score, member.clone(), rng);
                record.member_score.insert(member, score);
                1
            }
            Some(old) if old == score => 0,
            Some(old) => {
                Self::zindex_remove(record, old, &member);
                Self::zindex_insert(record, score, member.clone(), rng);
                record.member_score.insert(member, score);
                0
            }
        }
    }

    /// Removes members; a sorted set left empty is removed entirely.
    pub fn zrem(&self, key: &[u8], members: &[Bytes]) -> usize {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_zset(&mut inner, key, now);
        let Some(record) = inner.zsets.get_mut(key) else {
            return 0;
        };
        let mut removed = 0;
        for member in members {
            let Some(score) = record.member_score.remove(member) else {
                continue;
            };
            if Self::zindex_erase(record, score, member) {
                removed += 1;
            }
        }
        if record.is_empty() {
            inner.zsets.remove(key);
        }
        removed
    }

    /// Members with rank in `[start, stop]`, negative indices counted
    /// from the end, in `(score, member)` order.
    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Vec<Bytes> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_zset(&mut inner, key, now);
        let mut out = Vec::new();
        let Some(record) = inner.zsets.get(key) else {
            return out;
        };
        match &record.index {
            ZSetIndex::Vec(items) => {
                let n = items.len() as i64;
                if n == 0 {
                    return out;
                }
                let norm = |mut idx: i64| {
                    if idx < 0 {
                        idx += n;
                    }
                    idx.clamp(0, n - 1)
                };
                let (s, e) = (norm(start), norm(stop));
                if s > e {
                    return out;
                }
                for (_, member) in &items[s as usize..=e as usize] {
                    out.push(member.clone());
                }
            }
            ZSetIndex::Skip(sl) => sl.range_by_rank(start, stop, &mut out),
        }
        out
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Option<f64> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        Self::cleanup_zset(&mut inner, key, now);
        inner.zsets.get(key)?.member_score.get(member).copied()
    }

    /// Restore path for sorted-set deadlines.
    pub fn set_zset_expire_at_ms(&self, key: &[u8], expire_at_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        let Some(record) = inner.zsets.get_mut(key) else {
            return false;
        };
        record.expire_at_ms = expire_at_ms;
        if expire_at_ms >= 0 {
            inner
                .expire_index
                .insert(Bytes::copy_from_slice(key), expire_at_ms);
        } else {
            inner.expire_index.remove(key);
        }
        true
    }

    // ---- internals ----

    fn expired(expire_at_ms: i64, now: i64) -> bool {
        expire_at_ms >= 0 && now >= expire_at_ms
    }

    fn cleanup_string(inner: &mut StoreInner, key: &[u8], now: i64) {
        if let Some(record) = inner.strings.get(key)
            && Self::expired(record.expire_at_ms, now)
        {
            inner.strings.remove(key);
            inner.expire_index.remove(key);
        }
    }

    fn cleanup_hash(inner: &mut StoreInner, key: &[u8], now: i64) {
        if let Some(record) = inner.hashes.get(key)
            && Self::expired(record.expire_at_ms, now)
        {
            inner.hashes.remove(key);
            inner.expire_index.remove(key);
        }
    }

    fn cleanup_zset(inner: &mut StoreInner, key: &[u8], now: i64) {
        if let Some(record) = inner.zsets.get(key)
            && Self::expired(record.expire_at_ms, now)
        {
            inner.zsets.remove(key);
            inner.expire_index.remove(key);
        }
    }

    fn zindex_insert(record: &mut ZSetRecord, score: f64, member: Bytes, rng: &mut StdRng) {
        let promoted = match &mut record.index {
            ZSetIndex::Vec(items) => {
                let pos = items
                    .binary_search_by(|(s, m)| zset_order(*s, m, score, &member))
                    .unwrap_or_else(|p| p);
                items.insert(pos, (score, member));
                if items.len() > ZSET_VECTOR_THRESHOLD {
                    let mut sl = SkipList::new();
                    for (s, m) in items.drain(..) {
                        sl.insert(s, m, rng);
                    }
                    Some(sl)
                } else {
                    None
                }
            }
            ZSetIndex::Skip(sl) => {
                sl.insert(score, member, rng);
                None
            }
        };
        if let Some(sl) = promoted {
            record.index = ZSetIndex::Skip(sl);
        }
    }

    fn zindex_remove(record: &mut ZSetRecord, score: f64, member: &Bytes) {
        match &mut record.index {
            ZSetIndex::Vec(items) => {
                if let Ok(pos) =
                    items.binary_search_by(|(s, m)| zset_order(*s, m, score, member))
                {
                    items.remove(pos);
                }
            }
            ZSetIndex::Skip(sl) => {
                sl.erase(score, member);
            }
        }
    }

    fn zindex_erase(record: &mut ZSetRecord, score: f64, member: &Bytes) -> bool {
        match &mut record.index {
            ZSetIndex::Vec(items) => {
                match items.binary_search_by(|(s, m)| zset_order(*s, m, score, member)) {
                    Ok(pos) => {
                        items.remove(pos);
                        true
                    }
                    Err(_) => false,
                }
            }
            ZSetIndex::Skip(sl) => sl.erase(score, member),
        }
    }
}
