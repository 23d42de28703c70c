use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncSeekExt;

use crate::cache::SegmentCache;
use crate::config;
use crate::constants;
use crate::http_range::{build_content_range, parse_range, unsatisfied_content_range, RangeError, RangeSpec};
use crate::library::{Library, Video};
use crate::response::{self, ResponseBody};

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub segment_size: u64,
    pub max_age: Duration,
}

impl From<&config::Stream> for StreamSettings {
    fn from(cfg: &config::Stream) -> Self {
        Self {
            segment_size: cfg.segment_size.max(1),
            max_age: cfg.max_age,
        }
    }
}

impl StreamSettings {
    pub fn segment_index(&self, offset: u64) -> u64 {
        offset / self.segment_size
    }

    pub fn is_aligned(&self, offset: u64) -> bool {
        offset % self.segment_size == 0
    }

    /// Inclusive byte bounds of segment `index` in a file of `file_size` bytes.
    pub fn segment_bounds(&self, index: u64, file_size: u64) -> (u64, u64) {
        let start = index * self.segment_size;
        let end = start.saturating_add(self.segment_size).min(file_size) - 1;
        (start, end)
    }

    /// Bounds an open-ended request to one segment's worth of bytes.
    pub fn bound_range(&self, range: RangeSpec) -> RangeSpec {
        if !range.open_ended {
            return range;
        }
        let limit = range.start.saturating_add(self.segment_size - 1);
        RangeSpec {
            end: range.end.min(limit),
            ..range
        }
    }
}

pub type Response = http::Response<ResponseBody>;

/// Serves `GET|HEAD /videos/{id}/stream`.
///
/// Segment-aligned range requests go through the segment cache; everything
/// else reads straight from the file. On a miss the client is served from
/// the file right away and the segment is admitted by a detached task.
pub async fn serve(
    method: &Method,
    headers: &HeaderMap,
    video_id: &str,
    library: &Library,
    cache: &Arc<SegmentCache>,
    settings: StreamSettings,
) -> Response {
    let video = match library.refresh(video_id).await {
        Ok(Some((video, changed))) => {
            if changed {
                let dropped = cache.invalidate_video(&video.id);
                log::info!(
                    "video {} changed on disk, dropped {dropped} cached segments",
                    video.id
                );
            }
            video
        }
        Ok(None) => return response::not_found(),
        Err(err) => {
            log::error!("stat video {video_id}: {err:#}");
            return response::internal_error();
        }
    };

    let mut out = base_headers(&video, settings);
    if if_none_match(headers, &video) {
        return response::with_headers(StatusCode::NOT_MODIFIED, out, response::empty());
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| (raw, parse_range(raw, video.size)));
    let range = match range {
        None => None,
        Some((_, Ok(range))) => Some(settings.bound_range(range)),
        Some((raw, Err(RangeError::Invalid))) => {
            log::debug!("ignore malformed range {raw:?} for video {}", video.id);
            None
        }
        Some((_, Err(RangeError::Unsatisfiable))) => {
            out.insert(header::CONTENT_RANGE, header_value(&unsatisfied_content_range(video.size)));
            return response::with_headers(StatusCode::RANGE_NOT_SATISFIABLE, out, response::empty());
        }
    };

    let Some(range) = range else {
        out.insert(header::CONTENT_LENGTH, HeaderValue::from(video.size));
        out.insert(
            constants::PROTOCOL_CACHE_STATUS_KEY,
            HeaderValue::from_static(constants::CACHE_STATUS_BYPASS),
        );
        if method == Method::HEAD {
            return response::with_headers(StatusCode::OK, out, response::empty());
        }
        return match open_at(&video.path, 0).await {
            Ok(file) => response::with_headers(StatusCode::OK, out, response::file_body(file, video.size)),
            Err(err) => {
                log::error!("serve video {}: {err:#}", video.id);
                response::internal_error()
            }
        };
    };

    out.insert(
        header::CONTENT_RANGE,
        header_value(&build_content_range(range.start, range.end, video.size)),
    );
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));
    if method == Method::HEAD {
        out.insert(
            constants::PROTOCOL_CACHE_STATUS_KEY,
            HeaderValue::from_static(constants::CACHE_STATUS_BYPASS),
        );
        return response::with_headers(StatusCode::PARTIAL_CONTENT, out, response::empty());
    }

    let served = if settings.is_aligned(range.start) {
        serve_segment(&video, range, cache, settings, &mut out).await
    } else {
        out.insert(
            constants::PROTOCOL_CACHE_STATUS_KEY,
            HeaderValue::from_static(constants::CACHE_STATUS_BYPASS),
        );
        file_range_body(&video.path, range).await
    };
    match served {
        Ok(body) => response::with_headers(StatusCode::PARTIAL_CONTENT, out, body),
        Err(err) => {
            log::error!("serve video {} range {}-{}: {err:#}", video.id, range.start, range.end);
            response::internal_error()
        }
    }
}

async fn serve_segment(
    video: &Video,
    range: RangeSpec,
    cache: &Arc<SegmentCache>,
    settings: StreamSettings,
    out: &mut HeaderMap,
) -> Result<ResponseBody> {
    let index = settings.segment_index(range.start);
    if let Some(cached) = cache.get_segment(&video.id, index) {
        out.insert(
            constants::PROTOCOL_CACHE_STATUS_KEY,
            HeaderValue::from_static(constants::CACHE_STATUS_HIT),
        );
        return cached_body(video, range, cached).await;
    }

    out.insert(
        constants::PROTOCOL_CACHE_STATUS_KEY,
        HeaderValue::from_static(constants::CACHE_STATUS_MISS),
    );
    let body = file_range_body(&video.path, range).await?;

    let (seg_start, seg_end) = settings.segment_bounds(index, video.size);
    let cache = Arc::clone(cache);
    let video_id = video.id.clone();
    let path = video.path.clone();
    tokio::spawn(async move {
        let admitted = cache
            .cache_segment_from_file(&video_id, index, &path, seg_start, seg_end)
            .await;
        log::debug!("background admission of video {video_id} segment {index}: {admitted}");
    });
    Ok(body)
}

/// Body for `range` when the segment starting at `range.start` is cached.
async fn cached_body(video: &Video, range: RangeSpec, cached: Bytes) -> Result<ResponseBody> {
    let wanted = range.len();
    let cached_len = cached.len() as u64;
    if wanted == cached_len {
        return Ok(response::full(cached));
    }
    if wanted < cached_len {
        return Ok(response::full(cached.slice(..wanted as usize)));
    }
    let tail = open_at(&video.path, range.start + cached_len).await?;
    Ok(response::prefixed_file_body(cached, tail, wanted - cached_len))
}

async fn file_range_body(path: &Path, range: RangeSpec) -> Result<ResponseBody> {
    let file = open_at(path, range.start).await?;
    Ok(response::file_body(file, range.len()))
}

async fn open_at(path: &Path, offset: u64) -> Result<File> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|| format!("seek {} to {offset}", path.display()))?;
    }
    Ok(file)
}

pub fn etag(video: &Video) -> String {
    format!("\"{}-{:x}-{:x}\"", video.id, video.modified_unix(), video.size)
}

fn base_headers(video: &Video, settings: StreamSettings) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(video.content_type()));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::ETAG, header_value(&etag(video)));
    headers.insert(
        header::LAST_MODIFIED,
        header_value(&httpdate::fmt_http_date(video.modified)),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header_value(&format!("public, max-age={}", settings.max_age.as_secs())),
    );
    headers
}

fn if_none_match(headers: &HeaderMap, video: &Video) -> bool {
    let Some(raw) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let current = etag(video);
    raw.split(',')
        .map(|tag| tag.trim().trim_start_matches("W/"))
        .any(|tag| tag == "*" || tag == current)
}

fn header_value(raw: &str) -> HeaderValue {
    HeaderValue::from_str(raw).unwrap_or_else(|_| HeaderValue::from_static("-"))
}
