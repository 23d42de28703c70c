use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::cache::SegmentKey;

#[derive(Debug, Clone)]
struct StoredSegment {
    bytes: Bytes,
    inserted_at: Instant,
    expires_at: Option<Instant>,
    seq: u64,
}

impl StoredSegment {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Point-in-time view of one live segment, used for eviction ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentSegment {
    pub key: SegmentKey,
    pub size: u64,
    pub seq: u64,
    pub age: Duration,
}

#[derive(Debug, Default)]
struct StoreInner {
    map: HashMap<SegmentKey, StoredSegment>,
    used: u64,
    next_seq: u64,
}

impl StoreInner {
    fn take(&mut self, key: &SegmentKey) -> Option<StoredSegment> {
        let old = self.map.remove(key)?;
        self.used = self.used.saturating_sub(old.bytes.len() as u64);
        Some(old)
    }
}

/// Keyed byte storage with per-entry expiry.
///
/// Expired entries are invisible to readers immediately and are physically
/// dropped either lazily on access or by [`SegmentStore::purge_expired`].
#[derive(Debug, Default)]
pub struct SegmentStore {
    inner: Mutex<StoreInner>,
}

impl SegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` under `key`; a `ttl` of `None` never expires.
    /// Returns the bytes that were replaced, if any.
    pub fn put(&self, key: SegmentKey, bytes: Bytes, ttl: Option<Duration>) -> Option<Bytes> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("segment store");
        let replaced = inner.take(&key).map(|old| old.bytes);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.used += bytes.len() as u64;
        inner.map.insert(
            key,
            StoredSegment {
                bytes,
                inserted_at: now,
                expires_at: ttl.map(|ttl| now + ttl),
                seq,
            },
        );
        replaced
    }

    pub fn get(&self, key: &SegmentKey) -> Option<Bytes> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("segment store");
        let expired = inner.map.get(key)?.is_expired(now);
        if expired {
            inner.take(key);
            return None;
        }
        inner.map.get(key).map(|seg| seg.bytes.clone())
    }

    pub fn contains(&self, key: &SegmentKey) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock().expect("segment store");
        inner
            .map
            .get(key)
            .map(|seg| !seg.is_expired(now))
            .unwrap_or(false)
    }

    /// Removes `key` whether or not it has expired.
    pub fn remove(&self, key: &SegmentKey) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("segment store");
        inner.take(key).map(|old| old.bytes)
    }

    pub fn keys(&self) -> Vec<SegmentKey> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("segment store");
        inner
            .map
            .iter()
            .filter(|(_, seg)| !seg.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn resident_segments(&self) -> Vec<ResidentSegment> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("segment store");
        inner
            .map
            .iter()
            .filter(|(_, seg)| !seg.is_expired(now))
            .map(|(key, seg)| ResidentSegment {
                key: key.clone(),
                size: seg.bytes.len() as u64,
                seq: seg.seq,
                age: now.saturating_duration_since(seg.inserted_at),
            })
            .collect()
    }

    /// Number of live segments belonging to `video_id`.
    pub fn segments_for(&self, video_id: &str) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().expect("segment store");
        inner
            .map
            .iter()
            .filter(|(key, seg)| key.video_id == video_id && !seg.is_expired(now))
            .count()
    }

    pub fn remove_video(&self, video_id: &str) -> usize {
        let mut inner = self.inner.lock().expect("segment store");
        let keys: Vec<SegmentKey> = inner
            .map
            .keys()
            .filter(|key| key.video_id == video_id)
            .cloned()
            .collect();
        for key in &keys {
            inner.take(key);
        }
        keys.len()
    }

    /// Drops every expired entry and returns the number of bytes released.
    pub fn purge_expired(&self) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("segment store");
        let expired: Vec<SegmentKey> = inner
            .map
            .iter()
            .filter(|(_, seg)| seg.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        let mut freed = 0;
        for key in &expired {
            if let Some(old) = inner.take(key) {
                freed += old.bytes.len() as u64;
            }
        }
        freed
    }

    /// Bytes held by the store, including expired entries not yet purged.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().expect("segment store").used
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().expect("segment store");
        inner.map.values().filter(|seg| !seg.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("segment store");
        inner.map.clear();
        inner.used = 0;
    }
}
