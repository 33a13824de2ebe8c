use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::client::playback::{FrameSink, PlayedFrame};
use crate::error::StreamError;
use crate::source::{pts_for_frame, Frame, FrameSource, FrameSourceFactory};

/// Generates `num_frames` frames of `frame_len` bytes each. The payload is derived from the
///  frame id, so corrupted or mixed-up frames are detectable.
pub struct SyntheticSource {
    num_frames: u32,
    frame_rate: f64,
    frame_len: usize,
    next_frame_id: u32,
}

impl SyntheticSource {
    pub fn new(num_frames: u32, frame_rate: f64, frame_len: usize) -> SyntheticSource {
        SyntheticSource {
            num_frames,
            frame_rate,
            frame_len,
            next_frame_id: 0,
        }
    }

    pub fn frame(frame_id: u32, frame_rate: f64, frame_len: usize) -> Frame {
        let data: Vec<u8> = frame_id.to_be_bytes().iter()
            .cycle()
            .take(frame_len)
            .copied()
            .collect();
        Frame {
            frame_id,
            pts_ms: pts_for_frame(frame_id, frame_rate),
            data: Bytes::from(data),
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.next_frame_id >= self.num_frames {
            return Ok(None);
        }
        let frame = Self::frame(self.next_frame_id, self.frame_rate, self.frame_len);
        self.next_frame_id += 1;
        Ok(Some(frame))
    }
}

/// Opens a [SyntheticSource] for every video id in `videos`
pub struct SyntheticSourceFactory {
    pub videos: Vec<String>,
    pub num_frames: u32,
    pub frame_rate: f64,
    pub frame_len: usize,
}

#[async_trait]
impl FrameSourceFactory for SyntheticSourceFactory {
    async fn open(&self, video_id: &str) -> Result<Box<dyn FrameSource>, StreamError> {
        if !self.videos.iter().any(|v| v == video_id) {
            return Err(StreamError::UnknownVideo(video_id.to_string()));
        }
        Ok(Box::new(SyntheticSource::new(self.num_frames, self.frame_rate, self.frame_len)))
    }
}

/// A [FrameSink] that forwards every played frame to a channel
#[derive(Clone)]
pub struct CollectingSink {
    sender: mpsc::UnboundedSender<PlayedFrame>,
}

impl CollectingSink {
    pub fn new() -> (CollectingSink, mpsc::UnboundedReceiver<PlayedFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (CollectingSink { sender }, receiver)
    }
}

impl FrameSink for CollectingSink {
    fn on_frame_played(&mut self, frame: &PlayedFrame) {
        let _ = self.sender.send(frame.clone());
    }
}

/// Drains everything currently in the channel
pub fn collect_played(receiver: &mut mpsc::UnboundedReceiver<PlayedFrame>) -> Vec<PlayedFrame> {
    let mut result = Vec::new();
    while let Ok(frame) = receiver.try_recv() {
        result.push(frame);
    }
    result
}
