use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::server::session_registry::{Session, SessionRegistry, SessionStatus};
use crate::source::FrameSource;
use crate::transport::DatagramSocket;
use crate::wire::media::MediaPacket;

/// Streams one session's frames at the target frame rate, fire-and-forget.
///
/// Frame `n` is sent at `stream_start + n / frame_rate`, so timer lag on one frame does not
///  shift the ones after it. Streaming ends at the end of the source, on STOP, or when the
///  session outlives `max_lifetime`.
pub struct MediaPacer {
    socket: Arc<dyn DatagramSocket>,
    registry: Arc<SessionRegistry>,
    frame_rate: f64,
    max_lifetime: Duration,
}

impl MediaPacer {
    pub fn new(socket: Arc<dyn DatagramSocket>, registry: Arc<SessionRegistry>, frame_rate: f64, max_lifetime: Duration) -> MediaPacer {
        MediaPacer {
            socket,
            registry,
            frame_rate,
            max_lifetime,
        }
    }

    pub fn start(self, session: Session, source: Box<dyn FrameSource>) -> JoinHandle<()> {
        tokio::spawn(self.run(session, source))
    }

    async fn run(self, session: Session, mut source: Box<dyn FrameSource>) {
        let conn_id = session.conn_id;
        let mut status = session.subscribe();
        if session.status() != SessionStatus::Pending {
            debug!(conn_id = conn_id.0, "session was stopped before streaming started");
            return;
        }
        session.set_status(SessionStatus::Streaming);
        info!(conn_id = conn_id.0, "streaming {:?} to {:?}", session.video_id, session.media_endpoint);

        let stream_start = Instant::now();
        let expires_at = stream_start + self.max_lifetime;
        let mut buf = BytesMut::new();
        let mut num_sent: u64 = 0;
        loop {
            let frame = match source.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(conn_id = conn_id.0, "error reading frame source, ending the stream: {}", e);
                    break;
                }
            };

            let send_at = stream_start + Duration::from_secs_f64(frame.frame_id as f64 / self.frame_rate);
            select! {
                _ = sleep_until(send_at.min(expires_at)) => {}
                _ = stopped(&mut status) => {}
            }
            if *status.borrow() != SessionStatus::Streaming {
                info!(conn_id = conn_id.0, "stream stopped after {} frames", num_sent);
                return;
            }
            if Instant::now() >= expires_at {
                warn!(conn_id = conn_id.0, "session expired after {:?} and {} frames - closing it", self.max_lifetime, num_sent);
                session.set_status(SessionStatus::Stopping);
                break;
            }

            let packet = MediaPacket::new(conn_id, frame.frame_id, frame.pts_ms, frame.data);
            buf.clear();
            packet.ser(&mut buf);
            trace!(conn_id = conn_id.0, "sending frame #{} (pts {} ms, {} bytes)", packet.frame_id, packet.pts_ms, packet.data.len());
            self.socket.send_to(session.media_endpoint, &buf).await;
            num_sent += 1;
        }

        if *status.borrow() == SessionStatus::Streaming {
            buf.clear();
            MediaPacket::end_of_stream(conn_id).ser(&mut buf);
            self.socket.send_to(session.media_endpoint, &buf).await;
            info!(conn_id = conn_id.0, "stream complete after {} frames", num_sent);
        }
        self.registry.close(conn_id).await;
    }
}

/// completes as soon as the session is no longer streaming
async fn stopped(status: &mut watch::Receiver<SessionStatus>) {
    loop {
        let current = *status.borrow_and_update();
        if current != SessionStatus::Streaming {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}
