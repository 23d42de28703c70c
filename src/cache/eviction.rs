use std::collections::HashMap;

use crate::cache::store::{ResidentSegment, SegmentStore};
use crate::cache::tracker::AccessTracker;
use crate::cache::SegmentKey;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: Vec<SegmentKey>,
    pub freed: u64,
}

/// Frees space by dropping segments of the least popular videos first.
///
/// Popularity is the owning video's hit count, so an old segment of a
/// frequently watched video outlives a fresh segment of a rarely watched one.
/// Among videos with equal counts the earliest inserted segment goes first.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    target_ratio: f64,
}

impl EvictionPolicy {
    pub fn new(target_ratio: f64) -> Self {
        Self {
            target_ratio: target_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn target_ratio(&self) -> f64 {
        self.target_ratio
    }

    /// Bytes that must be released before `incoming` more bytes can be added
    /// to `used`. Zero while the result stays within `max_size`; otherwise
    /// enough to land on the target fraction of the budget.
    pub fn required_space(&self, used: u64, incoming: u64, max_size: u64) -> u64 {
        let projected = used.saturating_add(incoming);
        if projected <= max_size {
            return 0;
        }
        let target = (max_size as f64 * self.target_ratio).floor() as u64;
        projected.saturating_sub(target.min(max_size))
    }

    /// Orders `resident` into eviction order and keeps the shortest prefix
    /// whose sizes add up to `required`.
    pub fn select_victims(
        &self,
        mut resident: Vec<ResidentSegment>,
        popularity: &HashMap<String, u64>,
        required: u64,
    ) -> Vec<ResidentSegment> {
        if required == 0 {
            return Vec::new();
        }
        resident.sort_by_key(|seg| {
            let hits = popularity.get(&seg.key.video_id).copied().unwrap_or(0);
            (hits, seg.seq)
        });
        let mut freed = 0u64;
        let mut victims = Vec::new();
        for seg in resident {
            if freed >= required {
                break;
            }
            freed += seg.size;
            victims.push(seg);
        }
        victims
    }

    pub fn evict(&self, store: &SegmentStore, tracker: &AccessTracker, required: u64) -> EvictionReport {
        let mut report = EvictionReport::default();
        if required == 0 {
            return report;
        }
        let resident = store.resident_segments();
        let popularity = tracker.counts_for(resident.iter().map(|seg| seg.key.video_id.as_str()));
        for victim in self.select_victims(resident, &popularity, required) {
            if let Some(bytes) = store.remove(&victim.key) {
                log::debug!(
                    "evicted {} ({} bytes, hits={}, age={}s)",
                    victim.key,
                    bytes.len(),
                    popularity.get(&victim.key.video_id).copied().unwrap_or(0),
                    victim.age.as_secs()
                );
                report.freed += bytes.len() as u64;
                report.evicted.push(victim.key);
            }
        }
        report
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new(0.8)
    }
}
