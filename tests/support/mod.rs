#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use marquee::config::Bootstrap;
use marquee::reader::{BoxFuture, RangeReader};
use marquee::server::{self, App};
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const MIB: usize = 1024 * 1024;

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .map(|v| v.to_str().expect("header value"))
            .unwrap_or("")
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

#[derive(Clone)]
pub struct TestClient {
    addr: SocketAddr,
}

impl TestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn send(&self, method: Method, url: &str, headers: HeaderMap) -> TestResponse {
        self.send_body(method, url, headers, Bytes::new()).await
    }

    pub async fn send_body(&self, method: Method, url: &str, headers: HeaderMap, body: Bytes) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .expect("connect server");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let uri: http::Uri = url.parse().expect("uri");
        let mut builder = Request::builder().method(method).uri(uri.clone());
        if !headers.contains_key(http::header::HOST) {
            if let Some(authority) = uri.authority() {
                builder = builder.header(http::header::HOST, authority.as_str());
            }
        }
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(body)).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

/// An in-process server on an ephemeral port, stopped on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub app: Arc<App>,
    pub client: TestClient,
    shutdown: watch::Sender<bool>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with<F>(edit: F) -> Self
    where
        F: FnOnce(&mut Bootstrap),
    {
        let mut cfg = Bootstrap::default();
        edit(&mut cfg);
        let app = App::new(&cfg).expect("app");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(server::serve(listener, Arc::clone(&app), rx));
        Self {
            addr,
            app,
            client: TestClient::new(addr),
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str, edit: impl FnOnce(&mut HeaderMap)) -> TestResponse {
        self.request(Method::GET, path, edit).await
    }

    pub async fn request(&self, method: Method, path: &str, edit: impl FnOnce(&mut HeaderMap)) -> TestResponse {
        let mut headers = HeaderMap::new();
        edit(&mut headers);
        self.client.send(method, &self.url(path), headers).await
    }

    pub async fn stream(&self, video_id: &str, range: Option<&str>) -> TestResponse {
        let path = format!("/videos/{video_id}/stream");
        self.get(&path, |headers| {
            if let Some(range) = range {
                headers.insert("Range", range.parse().unwrap());
            }
        })
        .await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct MockFile {
    pub path: PathBuf,
    pub data: Vec<u8>,
    _temp_dir: tempfile::TempDir,
}

impl MockFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn range(&self, start: usize, end: usize) -> &[u8] {
        &self.data[start..=end]
    }

    /// Replaces the content with `size` fresh random bytes.
    pub fn rewrite(&mut self, size: usize) {
        self.data = random_bytes(size);
        std::fs::write(&self.path, &self.data).expect("rewrite file");
    }
}

pub fn gen_file(size: usize) -> MockFile {
    let data = random_bytes(size);
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(format!("video-{size}.mp4"));
    std::fs::write(&path, &data).expect("write file");
    MockFile {
        path,
        data,
        _temp_dir: dir,
    }
}

pub fn random_bytes(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub fn hash_bytes(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Polls `cond` until it holds, failing the test after two seconds.
pub async fn wait_until<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Range reader that fabricates bytes and counts how often it was asked.
#[derive(Default)]
pub struct CountingReader {
    reads: AtomicUsize,
}

impl CountingReader {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl RangeReader for CountingReader {
    fn read_range(&self, _path: &Path, start: u64, end: u64) -> BoxFuture<Result<Bytes>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let len = (end - start + 1) as usize;
        Box::pin(async move { Ok(Bytes::from(vec![0xab; len])) })
    }
}

/// Range reader that answers after a fixed delay.
pub struct DelayedReader {
    pub delay: Duration,
}

impl RangeReader for DelayedReader {
    fn read_range(&self, _path: &Path, start: u64, end: u64) -> BoxFuture<Result<Bytes>> {
        let delay = self.delay;
        let len = (end - start + 1) as usize;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(Bytes::from(vec![0xcd; len]))
        })
    }
}
