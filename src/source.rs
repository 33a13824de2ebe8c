use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::StreamError;

/// One unit of compressed video payload. The core treats `data` as opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_id: u32,
    pub pts_ms: f32,
    pub data: Bytes,
}

/// A finite sequence of frames, ordered by frame id and starting at 0
#[async_trait]
pub trait FrameSource: Send + 'static {
    async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>>;
}

/// Opens a fresh [FrameSource] for each session
#[async_trait]
pub trait FrameSourceFactory: Send + Sync + 'static {
    async fn open(&self, video_id: &str) -> Result<Box<dyn FrameSource>, StreamError>;
}

pub fn pts_for_frame(frame_id: u32, frame_rate: f64) -> f32 {
    (frame_id as f64 * 1000.0 / frame_rate) as f32
}

/// Splits a pre-encoded file into fixed-size chunks, one chunk per frame.
pub struct ChunkedFileSource {
    file: File,
    chunk_size: usize,
    frame_rate: f64,
    next_frame_id: u32,
}

impl ChunkedFileSource {
    pub fn new(file: File, chunk_size: usize, frame_rate: f64) -> ChunkedFileSource {
        ChunkedFileSource {
            file,
            chunk_size,
            frame_rate,
            next_frame_id: 0,
        }
    }
}

#[async_trait]
impl FrameSource for ChunkedFileSource {
    async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        (&mut self.file)
            .take(self.chunk_size as u64)
            .read_to_end(&mut chunk)
            .await?;

        if chunk.is_empty() {
            return Ok(None);
        }

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        Ok(Some(Frame {
            frame_id,
            pts_ms: pts_for_frame(frame_id, self.frame_rate),
            data: Bytes::from(chunk),
        }))
    }
}

/// Resolves video ids as plain file names inside a media directory
pub struct DirectorySourceFactory {
    root: PathBuf,
    chunk_size: usize,
    frame_rate: f64,
}

impl DirectorySourceFactory {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize, frame_rate: f64) -> DirectorySourceFactory {
        DirectorySourceFactory {
            root: root.into(),
            chunk_size,
            frame_rate,
        }
    }

    fn resolve(&self, video_id: &str) -> Result<PathBuf, StreamError> {
        let mut components = Path::new(video_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.root.join(name)),
            _ => Err(StreamError::InvalidRequest(format!("video name {:?} is not a plain file name", video_id))),
        }
    }
}

#[async_trait]
impl FrameSourceFactory for DirectorySourceFactory {
    async fn open(&self, video_id: &str) -> Result<Box<dyn FrameSource>, StreamError> {
        let path = self.resolve(video_id)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("video file {:?} does not exist", path);
                return Err(StreamError::UnknownVideo(video_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !file.metadata().await?.is_file() {
            return Err(StreamError::UnknownVideo(video_id.to_string()));
        }
        Ok(Box::new(ChunkedFileSource::new(file, self.chunk_size, self.frame_rate)))
    }
}
