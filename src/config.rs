use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

use crate::wire::media::MediaPacket;

/// Largest payload of a UDP datagram over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65_507;

pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Directory containing the pre-encoded video files. PLAY requests name a file in this
    ///  directory, never a path.
    pub media_root: PathBuf,

    /// Bytes per frame when splitting a video file into frames. Each frame travels in a single
    ///  datagram, so this plus the 20 byte media header must fit into `max_datagram_size`.
    pub chunk_size: usize,

    pub frame_rate: f64,

    /// PLAY requests beyond this number of concurrent sessions are rejected
    pub max_sessions: usize,

    /// Number of replies remembered per control peer for answering retransmitted commands.
    ///  Since clients have at most one outstanding command, small values are sufficient.
    pub reply_cache_size: usize,

    /// Per-peer control state is discarded after this long without a command from the peer
    pub peer_state_ttl: Duration,

    /// A session that is neither stopped nor at the end of its video after this long is closed
    ///  by the server
    pub max_session_lifetime: Duration,

    pub max_datagram_size: usize,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind_addr,
            media_root: PathBuf::from("video_source"),
            chunk_size: 4096,
            frame_rate: 24.0,
            max_sessions: 16,
            reply_cache_size: 32,
            peer_state_ttl: Duration::from_secs(60),
            max_session_lifetime: Duration::from_secs(4 * 3600),
            max_datagram_size: 65536,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            bail!("frame rate must be positive, was {}", self.frame_rate);
        }
        if self.chunk_size == 0 {
            bail!("chunk size must not be 0");
        }
        if self.chunk_size + MediaPacket::HEADER_LEN > self.max_datagram_size.min(MAX_UDP_PAYLOAD) {
            bail!("chunk size {} does not fit into a single datagram", self.chunk_size);
        }
        if self.max_sessions == 0 {
            bail!("max_sessions must not be 0");
        }
        if self.reply_cache_size == 0 {
            bail!("reply cache size must not be 0");
        }
        if self.max_session_lifetime.is_zero() {
            bail!("max session lifetime must not be 0");
        }
        Ok(())
    }
}

pub struct ClientConfig {
    pub server_addr: SocketAddr,

    /// Local address of the control socket. Replies come back to this address.
    pub control_bind_addr: SocketAddr,

    /// Local IP the media socket is bound to - the port is part of each PLAY request
    pub media_bind_ip: IpAddr,

    /// Retransmission timeout for control commands
    pub ack_timeout: Duration,

    /// Total number of transmissions of a control command (first send plus retries) before it
    ///  is reported as undelivered
    pub max_attempts: u32,

    /// Frames buffered before playback starts
    pub prebuffer_frames: usize,

    /// Upper bound for the number of frames held in the jitter buffer. Frames arriving while it
    ///  is full are dropped and counted.
    pub jitter_buffer_capacity: usize,

    /// Capacity of the queue between the receiving and the playback task
    pub playback_queue_capacity: usize,

    /// Longest time playback waits for a missing frame before it resumes
    pub stall_timeout: Duration,

    /// Playback ends when no frame arrived for this long after a stall, or while pre-buffering.
    ///  Covers a lost end of stream marker.
    pub idle_timeout: Duration,

    /// Frame rate assumed for predicting when the next frame is due, until two frames were
    ///  played and the actual spacing is known
    pub nominal_frame_rate: f64,

    pub max_datagram_size: usize,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            server_addr,
            control_bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            media_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ack_timeout: Duration::from_millis(500),
            max_attempts: 5,
            prebuffer_frames: 10,
            jitter_buffer_capacity: 512,
            playback_queue_capacity: 256,
            stall_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5),
            nominal_frame_rate: 24.0,
            max_datagram_size: 65536,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must not be 0");
        }
        if self.idle_timeout.is_zero() {
            bail!("idle timeout must not be 0");
        }
        if self.jitter_buffer_capacity == 0 || self.playback_queue_capacity == 0 {
            bail!("buffer capacities must not be 0");
        }
        if self.prebuffer_frames > self.jitter_buffer_capacity {
            bail!("pre-buffering {} frames requires a jitter buffer of at least that size, was {}", self.prebuffer_frames, self.jitter_buffer_capacity);
        }
        if !(self.nominal_frame_rate.is_finite() && self.nominal_frame_rate > 0.0) {
            bail!("nominal frame rate must be positive, was {}", self.nominal_frame_rate);
        }
        if self.max_datagram_size < MediaPacket::HEADER_LEN {
            bail!("max datagram size {} is smaller than a media header", self.max_datagram_size);
        }
        Ok(())
    }
}
