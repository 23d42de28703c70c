use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Per-video hit counters. A video's count is its popularity.
#[derive(Debug, Default)]
pub struct AccessTracker {
    counts: Mutex<HashMap<String, u64>>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, video_id: &str) -> u64 {
        let mut counts = self.counts.lock().expect("access tracker");
        let count = counts.entry(video_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn count(&self, video_id: &str) -> u64 {
        let counts = self.counts.lock().expect("access tracker");
        counts.get(video_id).copied().unwrap_or(0)
    }

    /// Resolves many counts under a single lock acquisition.
    pub fn counts_for<'a, I>(&self, video_ids: I) -> HashMap<String, u64>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let counts = self.counts.lock().expect("access tracker");
        video_ids
            .into_iter()
            .map(|id| (id.to_string(), counts.get(id).copied().unwrap_or(0)))
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let counts = self.counts.lock().expect("access tracker");
        counts.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    pub fn reset(&self) {
        self.counts.lock().expect("access tracker").clear();
    }
}
