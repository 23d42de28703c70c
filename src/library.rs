use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Video {
    pub id: String,
    pub title: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl Video {
    fn from_path(id: String, path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
        if !meta.is_file() {
            return Err(anyhow!("{} is not a regular file", path.display()));
        }
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| id.clone());
        Ok(Self {
            id,
            title,
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(UNIX_EPOCH),
        })
    }

    pub fn modified_unix(&self) -> u64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn content_type(&self) -> &'static str {
        content_type(&self.path)
    }

    fn same_content(&self, other: &Video) -> bool {
        self.size == other.size && self.modified == other.modified
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoView {
    pub id: String,
    pub title: String,
    pub size: u64,
    pub modified: u64,
    pub content_type: &'static str,
    pub stream_url: String,
}

impl From<&Video> for VideoView {
    fn from(video: &Video) -> Self {
        Self {
            id: video.id.clone(),
            title: video.title.clone(),
            size: video.size,
            modified: video.modified_unix(),
            content_type: video.content_type(),
            stream_url: format!("/videos/{}/stream", video.id),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub total: usize,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

/// Video files discovered under the configured library directories.
pub struct Library {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    videos: RwLock<HashMap<String, Video>>,
}

impl Library {
    pub fn new(roots: Vec<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            roots,
            extensions: extensions
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            videos: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &config::Library) -> Self {
        Self::new(cfg.paths.iter().map(PathBuf::from).collect(), cfg.extensions.clone())
    }

    /// Walks every root and replaces the catalog. Videos whose size or
    /// mtime moved, and videos that disappeared, are reported so callers can
    /// drop derived state.
    pub fn scan(&self) -> Result<ScanReport> {
        let mut found = HashMap::new();
        for root in &self.roots {
            let root = fs::canonicalize(root).with_context(|| format!("resolve {}", root.display()))?;
            self.walk(&root, &mut found);
        }

        let mut videos = self.videos.write().expect("library");
        let mut report = ScanReport {
            total: found.len(),
            ..ScanReport::default()
        };
        for (id, old) in videos.iter() {
            match found.get(id) {
                Some(new) if !old.same_content(new) => report.changed.push(id.clone()),
                Some(_) => {}
                None => report.removed.push(id.clone()),
            }
        }
        *videos = found;
        log::info!(
            "library scan: {} videos, {} changed, {} removed",
            report.total,
            report.changed.len(),
            report.removed.len()
        );
        Ok(report)
    }

    fn walk(&self, dir: &Path, found: &mut HashMap<String, Video>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("library: cannot read {}: {err}", dir.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false);
            if hidden {
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                self.walk(&path, found);
                continue;
            }
            if !self.accepts(&path) {
                continue;
            }
            let id = video_id_for(&path);
            if let Some(existing) = found.get(&id) {
                log::warn!(
                    "library: id {id} collides for {} and {}, keeping the first",
                    existing.path.display(),
                    path.display()
                );
                continue;
            }
            match Video::from_path(id.clone(), &path) {
                Ok(video) => {
                    found.insert(id, video);
                }
                Err(err) => log::warn!("library: skip {}: {err:#}", path.display()),
            }
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }

    /// Adds a single file under an explicit id.
    pub fn register(&self, id: &str, path: impl AsRef<Path>) -> Result<Video> {
        let video = Video::from_path(id.to_string(), path.as_ref())?;
        let mut videos = self.videos.write().expect("library");
        videos.insert(id.to_string(), video.clone());
        Ok(video)
    }

    pub fn get(&self, id: &str) -> Option<Video> {
        self.videos.read().expect("library").get(id).cloned()
    }

    pub fn list(&self) -> Vec<Video> {
        let videos = self.videos.read().expect("library");
        let mut list: Vec<Video> = videos.values().cloned().collect();
        list.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn len(&self) -> usize {
        self.videos.read().expect("library").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-stats a known video. Returns the fresh record and whether its size
    /// or mtime differ from the previous observation.
    pub async fn refresh(&self, id: &str) -> Result<Option<(Video, bool)>> {
        let Some(known) = self.get(id) else {
            return Ok(None);
        };
        let meta = tokio::fs::metadata(&known.path)
            .await
            .with_context(|| format!("stat {}", known.path.display()))?;
        let fresh = Video {
            size: meta.len(),
            modified: meta.modified().unwrap_or(UNIX_EPOCH),
            ..known.clone()
        };
        let changed = !known.same_content(&fresh);
        if changed {
            let mut videos = self.videos.write().expect("library");
            videos.insert(id.to_string(), fresh.clone());
        }
        Ok(Some((fresh, changed)))
    }
}

pub fn video_id_for(path: &Path) -> String {
    format!("{:08x}", crc32fast::hash(path.to_string_lossy().as_bytes()))
}

pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "ts" => "video/mp2t",
        _ => "application/octet-stream",
    }
}
