//! Resolution of storage locators into the byte streams that get published.

use crate::error::{Error, Result};
use crate::model::StorageLocator;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncReadExt;
use tokio_stream::Stream;

/// Size of each read from a stored file.
const READ_BUFFER: usize = 256 * 1024;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// The bytes of one video, ready to be streamed exactly once.
pub struct VideoPayload {
    /// Total length of `stream` in bytes.
    pub len: u64,
    pub content_type: String,
    pub stream: ByteStream,
}

impl fmt::Debug for VideoPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoPayload")
            .field("len", &self.len)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait VideoSource: Send + Sync {
    async fn open(&self, locator: &StorageLocator) -> Result<VideoPayload>;
}

/// Serves locators as paths relative to a media root directory.
#[derive(Debug, Clone)]
pub struct FsVideoSource {
    root: PathBuf,
}

impl FsVideoSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, locator: &StorageLocator) -> Result<PathBuf> {
        let relative = Path::new(locator.as_str());
        // locators come from intake and must stay inside the media root
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::Storage(format!(
                "locator {locator} escapes the media root"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl VideoSource for FsVideoSource {
    #[tracing::instrument(skip(self), err)]
    async fn open(&self, locator: &StorageLocator) -> Result<VideoPayload> {
        let path = self.resolve(locator)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::Storage(format!("stat {}: {e}", path.display())))?
            .len();

        Ok(VideoPayload {
            len,
            content_type: content_type_for(&path).to_string(),
            stream: Box::pin(read_chunks(file)),
        })
    }
}

fn read_chunks(mut file: tokio::fs::File) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    async_stream::try_stream! {
        loop {
            let mut buf = BytesMut::with_capacity(READ_BUFFER);
            let n = file.read_buf(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield buf.freeze();
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

/// Drains a payload into memory. Only meant for payloads known to be small.
#[cfg(any(test, feature = "mock"))]
pub(crate) async fn collect(mut stream: ByteStream) -> std::io::Result<Bytes> {
    use tokio_stream::StreamExt;
    let mut all = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        all.extend_from_slice(&chunk?);
    }
    Ok(all.freeze())
}
