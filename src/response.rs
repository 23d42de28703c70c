use std::convert::Infallible;
use std::io;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::{header, HeaderMap, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::metrics;

pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

const READ_CHUNK: u64 = 64 * 1024;

pub fn full(bytes: Bytes) -> ResponseBody {
    Full::new(bytes)
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

pub fn empty() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

/// Streams `len` bytes from the current position of `file`. Dropping the
/// body (client went away) drops the file handle with it.
pub fn file_body(file: File, len: u64) -> ResponseBody {
    StreamBody::new(file_frames(file, len)).boxed_unsync()
}

/// `head` followed by `len` bytes from `file`.
pub fn prefixed_file_body(head: Bytes, file: File, len: u64) -> ResponseBody {
    let head = futures::stream::once(async move { Ok::<_, io::Error>(Frame::data(head)) });
    StreamBody::new(head.chain(file_frames(file, len))).boxed_unsync()
}

fn file_frames(file: File, len: u64) -> impl Stream<Item = io::Result<Frame<Bytes>>> + Send + 'static {
    futures::stream::unfold((file, len), |(mut file, remaining)| async move {
        if remaining == 0 {
            return None;
        }
        let mut buf = BytesMut::zeroed(remaining.min(READ_CHUNK) as usize);
        match file.read(&mut buf).await {
            Ok(0) => Some((
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file shorter than advertised")),
                (file, 0),
            )),
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Frame::data(buf.freeze())), (file, remaining - n as u64)))
            }
            Err(err) => Some((Err(err), (file, 0))),
        }
    })
}

pub fn with_headers(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Response<ResponseBody> {
    metrics::record(status);
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

pub fn text_response(status: StatusCode, body: &str) -> Response<ResponseBody> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    with_headers(status, headers, full(Bytes::from(body.to_string())))
}

pub fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    with_headers(status, HeaderMap::new(), empty())
}

pub fn json_response<T: serde::Serialize>(status: StatusCode, payload: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json; charset=utf-8"),
            );
            with_headers(status, headers, full(Bytes::from(bytes)))
        }
        Err(err) => {
            log::error!("encode json response: {err}");
            internal_error()
        }
    }
}

pub fn json_error(status: StatusCode, message: &str) -> Response<ResponseBody> {
    json_response(status, &serde_json::json!({ "error": message }))
}

pub fn not_found() -> Response<ResponseBody> {
    text_response(StatusCode::NOT_FOUND, "not found")
}

pub fn method_not_allowed() -> Response<ResponseBody> {
    text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

/// Generic 500; details belong in the server log, never in the body.
pub fn internal_error() -> Response<ResponseBody> {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}
