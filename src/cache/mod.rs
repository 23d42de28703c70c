use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::metrics;
use crate::reader::{FileReader, RangeReader};

pub mod eviction;
pub mod store;
pub mod tracker;

use eviction::EvictionPolicy;
use store::SegmentStore;
use tracker::AccessTracker;

const DEFAULT_MAX_CACHE_SIZE: u64 = 512 * 1024 * 1024;
const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_MAX_SEGMENTS_PER_VIDEO: usize = 10;
const DEFAULT_EVICTION_TARGET_RATIO: f64 = 0.8;
const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Identity of one cached segment: the owning video plus the segment index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey {
    pub video_id: String,
    pub index: u64,
}

impl SegmentKey {
    pub fn new(video_id: impl Into<String>, index: u64) -> Self {
        Self {
            video_id: video_id.into(),
            index,
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "video_{}_segment_{}", self.video_id, self.index)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_cache_size: u64,
    /// Seconds an entry stays live; 0 keeps entries until evicted.
    pub std_ttl: u64,
    /// Hits a video needs before new segments are admitted; 0 admits all.
    pub popularity_threshold: u64,
    pub max_segments_per_video: usize,
    pub eviction_target_ratio: f64,
    #[serde(with = "humantime_serde")]
    pub check_period: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            std_ttl: DEFAULT_TTL_SECS,
            popularity_threshold: 0,
            max_segments_per_video: DEFAULT_MAX_SEGMENTS_PER_VIDEO,
            eviction_target_ratio: DEFAULT_EVICTION_TARGET_RATIO,
            check_period: DEFAULT_CHECK_PERIOD,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_size == 0 {
            return Err(anyhow!("maxCacheSize must be greater than 0"));
        }
        if self.max_segments_per_video == 0 {
            return Err(anyhow!("maxSegmentsPerVideo must be at least 1"));
        }
        if !(self.eviction_target_ratio > 0.0 && self.eviction_target_ratio <= 1.0) {
            return Err(anyhow!("evictionTargetRatio must be within (0, 1]"));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Option<Duration> {
        if self.std_ttl == 0 {
            None
        } else {
            Some(Duration::from_secs(self.std_ttl))
        }
    }

    pub fn apply(&mut self, patch: &ConfigPatch) {
        if let Some(val) = patch.max_cache_size {
            self.max_cache_size = val;
        }
        if let Some(val) = patch.std_ttl {
            self.std_ttl = val;
        }
        if let Some(val) = patch.popularity_threshold {
            self.popularity_threshold = val;
        }
        if let Some(val) = patch.max_segments_per_video {
            self.max_segments_per_video = val;
        }
        if let Some(val) = patch.eviction_target_ratio {
            self.eviction_target_ratio = val;
        }
    }
}

/// Runtime-tunable subset of [`CacheConfig`], as accepted by the admin API.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigPatch {
    pub max_cache_size: Option<u64>,
    #[serde(rename = "stdTTL", alias = "stdTtl", alias = "ttlSeconds")]
    pub std_ttl: Option<u64>,
    pub popularity_threshold: Option<u64>,
    pub max_segments_per_video: Option<usize>,
    pub eviction_target_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub max_cache_size: u64,
    #[serde(rename = "stdTTL")]
    pub std_ttl: u64,
    pub popularity_threshold: u64,
    pub max_segments_per_video: usize,
    pub eviction_target_ratio: f64,
}

impl From<&CacheConfig> for ConfigView {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            max_cache_size: cfg.max_cache_size,
            std_ttl: cfg.std_ttl,
            popularity_threshold: cfg.popularity_threshold,
            max_segments_per_video: cfg.max_segments_per_video,
            eviction_target_ratio: cfg.eviction_target_ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub total_bytes_resident: u64,
    pub hit_rate_percent: f64,
    pub per_video_access_counts: BTreeMap<String, u64>,
    pub entries: usize,
    pub max_cache_size: u64,
    pub keys: Vec<String>,
}

/// In-memory video segment cache.
///
/// Segments are admitted only for videos that have earned enough hits, at
/// most `max_segments_per_video` per video, and within a global byte budget
/// enforced by [`EvictionPolicy`]. Every operation is safe to call from many
/// tasks at once; admissions are serialized so the budget check, eviction and
/// insert of one admission never interleave with another.
///
/// The admission lock also guards a per-video generation that
/// [`SegmentCache::invalidate_video`] bumps. A file read that started under an
/// older generation is discarded instead of inserted.
pub struct SegmentCache {
    store: SegmentStore,
    tracker: AccessTracker,
    config: RwLock<CacheConfig>,
    reader: Arc<dyn RangeReader>,
    admission: Mutex<HashMap<String, u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SegmentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_reader(config, Arc::new(FileReader))
    }

    pub fn with_reader(config: CacheConfig, reader: Arc<dyn RangeReader>) -> Self {
        Self {
            store: SegmentStore::new(),
            tracker: AccessTracker::new(),
            config: RwLock::new(config),
            reader,
            admission: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config.read().expect("cache config").clone()
    }

    pub fn access_count(&self, video_id: &str) -> u64 {
        self.tracker.count(video_id)
    }

    pub fn resident_segments(&self, video_id: &str) -> usize {
        self.store.segments_for(video_id)
    }

    pub fn get_segment(&self, video_id: &str, index: u64) -> Option<Bytes> {
        let key = SegmentKey::new(video_id, index);
        match self.store.get(&key) {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.tracker.record_hit(video_id);
                metrics::record_cache_lookup(true);
                Some(bytes)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup(false);
                None
            }
        }
    }

    /// Stores `bytes` as segment `index` of `video_id`, evicting less popular
    /// segments first when the budget would be exceeded.
    pub fn cache_segment(&self, video_id: &str, index: u64, bytes: Bytes) -> bool {
        let cfg = self.config();
        self.admit(SegmentKey::new(video_id, index), bytes, &cfg, None)
    }

    fn generation(&self, video_id: &str) -> u64 {
        let generations = self.admission.lock().expect("cache admission");
        generations.get(video_id).copied().unwrap_or(0)
    }

    /// Reads `start..=end` of `path` and admits it as segment `index`.
    ///
    /// Returns `true` when the segment is resident afterwards. Refusals
    /// (unpopular video, per-video cap) and read failures return `false`;
    /// neither is an error for the caller, who serves from the file anyway.
    pub async fn cache_segment_from_file(
        &self,
        video_id: &str,
        index: u64,
        path: &Path,
        start: u64,
        end: u64,
    ) -> bool {
        let key = SegmentKey::new(video_id, index);
        if self.store.contains(&key) {
            return true;
        }

        let cfg = self.config();
        let hits = self.tracker.count(video_id);
        if hits < cfg.popularity_threshold {
            log::debug!(
                "skip {key}: {hits} hits below popularity threshold {}",
                cfg.popularity_threshold
            );
            metrics::record_admission("unpopular");
            return false;
        }
        if self.store.segments_for(video_id) >= cfg.max_segments_per_video {
            log::debug!("skip {key}: video holds {} segments", cfg.max_segments_per_video);
            metrics::record_admission("video_cap");
            return false;
        }

        let generation = self.generation(video_id);
        let bytes = match self.reader.read_range(path, start, end).await {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("cache admission of {key} failed: {err:#}");
                metrics::record_admission("io_error");
                return false;
            }
        };
        self.admit(key, bytes, &cfg, Some(generation))
    }

    /// Inserts under the admission lock. With `generation` set, the insert is
    /// dropped when the video was invalidated after that generation was read.
    fn admit(&self, key: SegmentKey, bytes: Bytes, cfg: &CacheConfig, generation: Option<u64>) -> bool {
        let size = bytes.len() as u64;
        if size > cfg.max_cache_size {
            log::warn!(
                "refuse {key}: {size} bytes exceeds cache budget {}",
                cfg.max_cache_size
            );
            metrics::record_admission("too_large");
            return false;
        }

        let generations = self.admission.lock().expect("cache admission");
        let current = generations.get(&key.video_id).copied().unwrap_or(0);
        if generation.is_some_and(|seen| seen != current) {
            log::debug!("drop {key}: video invalidated while reading");
            metrics::record_admission("stale");
            return false;
        }
        if self.store.contains(&key) {
            self.store.remove(&key);
        } else if self.store.segments_for(&key.video_id) >= cfg.max_segments_per_video {
            metrics::record_admission("video_cap");
            return false;
        }

        if self.store.used_bytes().saturating_add(size) > cfg.max_cache_size {
            let purged = self.store.purge_expired();
            if purged > 0 {
                log::debug!("purged {purged} expired bytes before admitting {key}");
            }
        }

        let policy = EvictionPolicy::new(cfg.eviction_target_ratio);
        let required = policy.required_space(self.store.used_bytes(), size, cfg.max_cache_size);
        if required > 0 {
            let report = policy.evict(&self.store, &self.tracker, required);
            metrics::record_evictions(report.evicted.len());
            log::info!(
                "evicted {} segments ({} bytes) to admit {key}",
                report.evicted.len(),
                report.freed
            );
        }

        self.store.put(key, bytes, cfg.ttl());
        metrics::record_admission("admitted");
        metrics::set_resident_bytes(self.store.used_bytes());
        true
    }

    /// Drops every segment of `video_id`, e.g. after its source file changed.
    pub fn invalidate_video(&self, video_id: &str) -> usize {
        let mut generations = self.admission.lock().expect("cache admission");
        *generations.entry(video_id.to_string()).or_insert(0) += 1;
        let removed = self.store.remove_video(video_id);
        metrics::set_resident_bytes(self.store.used_bytes());
        removed
    }

    pub fn purge_expired(&self) -> u64 {
        let _guard = self.admission.lock().expect("cache admission");
        let freed = self.store.purge_expired();
        metrics::set_resident_bytes(self.store.used_bytes());
        freed
    }

    pub fn stats(&self) -> CacheStats {
        self.purge_expired();
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;
        let hit_rate_percent = if total == 0 {
            0.0
        } else {
            (hit_count as f64 * 10_000.0 / total as f64).round() / 100.0
        };
        let mut keys: Vec<SegmentKey> = self.store.keys();
        keys.sort();
        CacheStats {
            hit_count,
            miss_count,
            total_bytes_resident: self.store.used_bytes(),
            hit_rate_percent,
            per_video_access_counts: self.tracker.snapshot(),
            entries: self.store.len(),
            max_cache_size: self.config().max_cache_size,
            keys: keys.iter().map(|key| key.to_string()).collect(),
        }
    }

    /// Removes every segment. Popularity survives: it describes viewers, not
    /// cache contents.
    pub fn clear(&self) {
        let _guard = self.admission.lock().expect("cache admission");
        self.store.clear();
        metrics::set_resident_bytes(0);
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.tracker.reset();
    }

    /// Merges `patch` into the live configuration. The patched result is
    /// validated as a whole and swapped in under one write lock.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<CacheConfig> {
        let next = {
            let mut cfg = self.config.write().expect("cache config");
            let mut next = cfg.clone();
            next.apply(patch);
            next.validate()?;
            *cfg = next.clone();
            next
        };
        self.shrink_to(&next);
        log::info!(
            "cache config updated: max_cache_size={} std_ttl={} popularity_threshold={} max_segments_per_video={}",
            next.max_cache_size,
            next.std_ttl,
            next.popularity_threshold,
            next.max_segments_per_video
        );
        Ok(next)
    }

    /// Evicts down to the target ratio when resident bytes exceed the
    /// budget of `cfg`, e.g. right after the budget was lowered.
    fn shrink_to(&self, cfg: &CacheConfig) {
        let _guard = self.admission.lock().expect("cache admission");
        self.store.purge_expired();
        if self.store.is_empty() {
            metrics::set_resident_bytes(0);
            return;
        }
        let policy = EvictionPolicy::new(cfg.eviction_target_ratio);
        let required = policy.required_space(self.store.used_bytes(), 0, cfg.max_cache_size);
        if required > 0 {
            let report = policy.evict(&self.store, &self.tracker, required);
            metrics::record_evictions(report.evicted.len());
            log::info!(
                "budget lowered to {}: evicted {} segments ({} bytes) down to {:.0}%",
                cfg.max_cache_size,
                report.evicted.len(),
                report.freed,
                policy.target_ratio() * 100.0
            );
        }
        metrics::set_resident_bytes(self.store.used_bytes());
    }
}
