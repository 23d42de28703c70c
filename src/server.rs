use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::FutureExt;
use http::{HeaderMap, HeaderValue, Method, Request, Response};
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::{AccessLogger, AccessRecord};
use crate::api;
use crate::cache::SegmentCache;
use crate::config::Bootstrap;
use crate::constants;
use crate::library::Library;
use crate::logging;
use crate::metrics;
use crate::response::{self, ResponseBody};
use crate::stream::{self, StreamSettings};

const DEFAULT_LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "127.1", "[::1]"];
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Shared server state: the library, the segment cache and request plumbing.
pub struct App {
    cache: Arc<SegmentCache>,
    library: Library,
    stream: StreamSettings,
    local_hosts: HashSet<String>,
    access_logger: Option<AccessLogger>,
}

impl App {
    /// Builds the state and runs the initial library scan.
    pub fn new(cfg: &Bootstrap) -> Result<Arc<Self>> {
        let library = Library::from_config(&cfg.library);
        library.scan().context("initial library scan")?;
        Ok(Arc::new(Self {
            cache: Arc::new(SegmentCache::new(cfg.cache.clone())),
            library,
            stream: StreamSettings::from(&cfg.stream),
            local_hosts: build_local_hosts(cfg),
            access_logger: build_access_logger(cfg),
        }))
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn stream_settings(&self) -> StreamSettings {
        self.stream
    }

    fn is_local(&self, host: Option<&str>) -> bool {
        let Some(host) = host else {
            return false;
        };
        let name = if host.starts_with('[') {
            host.split_once(']').map(|(h, _)| format!("{h}]")).unwrap_or_default()
        } else {
            host.split(':').next().unwrap_or(host).to_string()
        };
        self.local_hosts.contains(&name)
    }
}

fn build_local_hosts(cfg: &Bootstrap) -> HashSet<String> {
    DEFAULT_LOCAL_HOSTS
        .iter()
        .map(|host| host.to_string())
        .chain(cfg.server.local_api_allow_hosts.iter().cloned())
        .collect()
}

fn build_access_logger(cfg: &Bootstrap) -> Option<AccessLogger> {
    let access = cfg.server.access_log.as_ref()?;
    if !access.enabled {
        return None;
    }
    match AccessLogger::new(Some(access.path.as_str())) {
        Ok(logger) => Some(logger),
        Err(err) => {
            log::warn!("failed to init access log: {err:#}");
            None
        }
    }
}

/// Binds `server.addr` and serves until SIGTERM or SIGINT.
pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let app = App::new(&cfg)?;
    let addr = bind_addr(&cfg.server.addr);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!(
        "listening on {addr}, {} videos in library",
        app.library().len()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);
    serve(listener, app, shutdown_rx).await
}

fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGTERM, shutting down"),
            _ = async {
                match sigint.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGINT, shutting down"),
        }
        let _ = shutdown.send(true);
    });
}

/// Accepts connections on `listener` until `shutdown` flips. Also runs the
/// periodic expiry sweep of the segment cache.
pub async fn serve(listener: TcpListener, app: Arc<App>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    spawn_expiry_sweeper(Arc::clone(&app), shutdown.clone());
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let app = Arc::clone(&app);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&app), peer));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection from {peer} closed: {err}");
                    }
                });
            }
        }
    }
    log::info!("server stopped accepting connections");
    Ok(())
}

fn spawn_expiry_sweeper(app: Arc<App>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        loop {
            let period = app.cache().config().check_period.max(MIN_SWEEP_PERIOD);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(period) => {
                    let freed = app.cache().purge_expired();
                    if freed > 0 {
                        log::debug!("expiry sweep freed {freed} bytes");
                    }
                }
            }
        }
    });
}

async fn handle(
    req: Request<Incoming>,
    app: Arc<App>,
    peer: SocketAddr,
) -> Result<Response<ResponseBody>, Infallible> {
    let info = RequestInfo::from_request(&req, peer);
    let is_local = app.is_local(extract_host(&req).as_deref());

    let dispatched = AssertUnwindSafe(dispatch(req, &app, is_local)).catch_unwind();
    let traced = logging::with_trace_id(info.request_id.clone(), dispatched);
    let mut resp = match metrics::with_request_context(info.protocol.clone(), traced).await {
        Ok(resp) => resp,
        Err(_) => {
            log::error!("handler panicked on {} {}", info.method, info.uri);
            response::internal_error()
        }
    };
    if let Ok(val) = HeaderValue::from_str(&info.request_id) {
        resp.headers_mut().insert(constants::PROTOCOL_REQUEST_ID_KEY, val);
    }
    log_access(&app, &info, &resp);
    Ok(resp)
}

async fn dispatch(req: Request<Incoming>, app: &Arc<App>, is_local: bool) -> Response<ResponseBody> {
    let Some(video_id) = stream_video_id(req.uri().path()) else {
        return api::route(req, app, is_local).await;
    };
    let method = req.method();
    if method != Method::GET && method != Method::HEAD {
        return response::method_not_allowed();
    }
    stream::serve(
        method,
        req.headers(),
        &video_id,
        app.library(),
        app.cache(),
        app.stream_settings(),
    )
    .await
}

fn stream_video_id(path: &str) -> Option<String> {
    let id = path.strip_prefix("/videos/")?.strip_suffix("/stream")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}

fn extract_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(host) = req.headers().get(http::header::HOST) {
        return host.to_str().ok().map(|v| v.to_string());
    }
    req.uri().host().map(|v| v.to_string())
}

struct RequestInfo {
    method: Method,
    uri: String,
    client_ip: String,
    user_agent: String,
    range: String,
    request_id: String,
    protocol: String,
    start_at: Instant,
}

impl RequestInfo {
    fn from_request(req: &Request<Incoming>, peer: SocketAddr) -> Self {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        Self {
            method: req.method().clone(),
            uri: req.uri().to_string(),
            client_ip: client_ip(peer, req.headers()),
            user_agent: header("User-Agent"),
            range: header("Range"),
            request_id: metrics::request_id_from_headers(req.headers()),
            protocol: format!("{:?}", req.version()),
            start_at: Instant::now(),
        }
    }
}

fn client_ip(peer: SocketAddr, headers: &HeaderMap) -> String {
    headers
        .get("X-Real-IP")
        .or_else(|| headers.get("X-Forwarded-For"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn log_access(app: &App, req: &RequestInfo, resp: &Response<ResponseBody>) {
    let Some(logger) = &app.access_logger else {
        return;
    };
    let body_bytes = resp
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or_else(|| resp.body().size_hint().exact())
        .unwrap_or(0);
    let cache_status = resp
        .headers()
        .get(constants::PROTOCOL_CACHE_STATUS_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    logger.log(&AccessRecord {
        client_ip: &req.client_ip,
        method: req.method.as_str(),
        uri: &req.uri,
        protocol: &req.protocol,
        status: resp.status().as_u16(),
        body_bytes,
        range: &req.range,
        cache_status,
        user_agent: &req.user_agent,
        duration_ms: req.start_at.elapsed().as_millis(),
        request_id: &req.request_id,
    });
}
