use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use serde::Serialize;

use crate::cache::{ConfigPatch, ConfigView};
use crate::library::VideoView;
use crate::metrics;
use crate::response::{self, ResponseBody};
use crate::server::App;

const MAX_BODY_BYTES: usize = 64 * 1024;

type Response = http::Response<ResponseBody>;

#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub commit: &'static str,
    pub build_time: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_REV").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown"),
    }
}

/// Everything except the stream endpoint. Cache administration and metrics
/// answer only when the request's host is in the local allow list.
pub async fn route(req: Request<Incoming>, app: &Arc<App>, is_local: bool) -> Response {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let method = req.method().clone();

    if path == "/metrics" || path.starts_with("/api/cache") {
        if !is_local {
            return response::not_found();
        }
        return cache_admin(req, &method, &path, app).await;
    }

    match (method, path.as_str()) {
        (Method::GET, "/healthz/startup-probe") => response::text_response(StatusCode::OK, "ok"),
        (Method::GET, "/healthz/liveness-probe" | "/healthz/readiness-probe") => {
            response::empty_response(StatusCode::OK)
        }
        (Method::GET, "/version") => response::json_response(StatusCode::OK, &build_info()),
        (Method::GET, "/api/videos") => {
            let videos: Vec<VideoView> = app.library().list().iter().map(VideoView::from).collect();
            response::json_response(StatusCode::OK, &videos)
        }
        (Method::POST, "/api/library/rescan") => rescan(app).await,
        (Method::GET, other) => match other.strip_prefix("/api/videos/") {
            Some(id) if !id.contains('/') => match app.library().get(id) {
                Some(video) => response::json_response(StatusCode::OK, &VideoView::from(&video)),
                None => response::json_error(StatusCode::NOT_FOUND, "video not found"),
            },
            _ => response::not_found(),
        },
        (_, "/api/videos" | "/api/library/rescan" | "/version") => response::method_not_allowed(),
        _ => response::not_found(),
    }
}

async fn cache_admin(req: Request<Incoming>, method: &Method, path: &str, app: &App) -> Response {
    let cache = app.cache();
    match (method, path) {
        (&Method::GET, "/metrics") => response::text_response(StatusCode::OK, &metrics::render()),
        (&Method::GET, "/api/cache/stats") => response::json_response(StatusCode::OK, &cache.stats()),
        (&Method::POST, "/api/cache/stats/reset") => {
            cache.reset_stats();
            log::info!("cache statistics reset");
            response::json_response(StatusCode::OK, &cache.stats())
        }
        (&Method::POST, "/api/cache/clear") | (&Method::DELETE, "/api/cache") => {
            let before = cache.stats();
            cache.clear();
            log::info!(
                "cache cleared: {} segments, {} bytes",
                before.entries,
                before.total_bytes_resident
            );
            response::json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "cleared": before.entries,
                    "freedBytes": before.total_bytes_resident,
                }),
            )
        }
        (&Method::GET, "/api/cache/config") => {
            response::json_response(StatusCode::OK, &ConfigView::from(&cache.config()))
        }
        (&Method::PATCH, "/api/cache/config") => {
            let body = match read_body(req).await {
                Ok(body) => body,
                Err(message) => return response::json_error(StatusCode::BAD_REQUEST, &message),
            };
            let patch: ConfigPatch = match serde_json::from_slice(&body) {
                Ok(patch) => patch,
                Err(err) => {
                    return response::json_error(StatusCode::BAD_REQUEST, &format!("invalid config: {err}"))
                }
            };
            match cache.update_config(&patch) {
                Ok(cfg) => response::json_response(StatusCode::OK, &ConfigView::from(&cfg)),
                Err(err) => response::json_error(StatusCode::BAD_REQUEST, &format!("{err:#}")),
            }
        }
        (_, "/metrics" | "/api/cache/stats" | "/api/cache/stats/reset" | "/api/cache/clear" | "/api/cache" | "/api/cache/config") => {
            response::method_not_allowed()
        }
        _ => response::not_found(),
    }
}

/// Walks the library roots on the blocking pool, then drops cached segments
/// of every changed or removed video.
async fn rescan(app: &Arc<App>) -> Response {
    let scanning = Arc::clone(app);
    let report = match tokio::task::spawn_blocking(move || scanning.library().scan()).await {
        Ok(Ok(report)) => report,
        Ok(Err(err)) => {
            log::error!("library rescan: {err:#}");
            return response::internal_error();
        }
        Err(err) => {
            log::error!("library rescan task failed: {err}");
            return response::internal_error();
        }
    };
    for id in report.changed.iter().chain(report.removed.iter()) {
        let dropped = app.cache().invalidate_video(id);
        if dropped > 0 {
            log::info!("rescan dropped {dropped} cached segments of video {id}");
        }
    }
    response::json_response(StatusCode::OK, &report)
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, String> {
    Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|err| format!("read body: {err}"))
}
