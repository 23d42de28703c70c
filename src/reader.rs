use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Byte-range read capability over video files. `start` and `end` are
/// inclusive offsets.
pub trait RangeReader: Send + Sync {
    fn read_range(&self, path: &Path, start: u64, end: u64) -> BoxFuture<Result<Bytes>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileReader;

impl RangeReader for FileReader {
    fn read_range(&self, path: &Path, start: u64, end: u64) -> BoxFuture<Result<Bytes>> {
        let path = path.to_path_buf();
        Box::pin(async move { read_file_range(path, start, end).await })
    }
}

async fn read_file_range(path: PathBuf, start: u64, end: u64) -> Result<Bytes> {
    if end < start {
        return Err(anyhow!("invalid range {start}-{end}"));
    }
    let len = usize::try_from(end - start + 1).context("range too large")?;
    let mut file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    file.seek(SeekFrom::Start(start))
        .await
        .with_context(|| format!("seek {} to {start}", path.display()))?;
    let mut buf = BytesMut::zeroed(len);
    file.read_exact(&mut buf)
        .await
        .with_context(|| format!("read {} bytes {start}-{end}", path.display()))?;
    Ok(buf.freeze())
}
