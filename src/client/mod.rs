pub mod cli;
pub mod loss_detector;
pub mod playback;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::loss_detector::{Detection, LossDetector};
use crate::client::playback::{FrameSink, LoggingSink, PlaybackInput, PlaybackScheduler, PlaybackSettings};
use crate::config::ClientConfig;
use crate::control::sender::ControlSender;
use crate::error::StreamError;
use crate::metrics::{DropCause, Metrics, MetricsSnapshot, SharedMetrics};
use crate::transport::{DatagramSocket, SocketFactory, UdpSocketFactory};
use crate::wire::control::{decode_control, CommandType, ControlPacket, PlayRequest, StopRequest};
use crate::wire::media::decode_media;
use crate::wire::ConnId;

pub type SinkFactory = Arc<dyn Fn() -> Box<dyn FrameSink> + Send + Sync>;

/// The receiving and the playback task of one stream. Both are aborted when this is dropped.
struct ActiveStream {
    conn_id: ConnId,
    metrics: SharedMetrics,
    playback_done: watch::Receiver<bool>,
    receive_handle: JoinHandle<()>,
    playback_handle: JoinHandle<()>,
}

impl ActiveStream {
    fn is_finished(&self) -> bool {
        self.playback_handle.is_finished()
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.receive_handle.abort();
        self.playback_handle.abort();
    }
}

enum StreamState {
    Idle,
    /// PLAY was sent and is waiting for its reply
    Requesting { stop_requested: bool, metrics: SharedMetrics },
    Active(ActiveStream),
}

/// Client side of the streaming protocol: issues PLAY and STOP over the reliable control
///  channel, and runs the receive / playback pipeline of one stream at a time.
pub struct StreamClient {
    config: Arc<ClientConfig>,
    sockets: Arc<dyn SocketFactory>,
    sink_factory: SinkFactory,
    control: Arc<ControlSender>,
    reply_handle: JoinHandle<()>,
    state: Mutex<StreamState>,
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.reply_handle.abort();
    }
}

impl StreamClient {
    /// Connects over UDP, logging played frames
    pub async fn connect(config: ClientConfig) -> anyhow::Result<StreamClient> {
        let sockets = Arc::new(UdpSocketFactory { max_datagram_size: config.max_datagram_size });
        StreamClient::new(config, sockets, Arc::new(|| Box::new(LoggingSink) as Box<dyn FrameSink>)).await
    }

    pub async fn new(config: ClientConfig, sockets: Arc<dyn SocketFactory>, sink_factory: SinkFactory) -> anyhow::Result<StreamClient> {
        config.validate()?;
        let config = Arc::new(config);

        let control_socket = sockets.bind(config.control_bind_addr).await?;
        let control = Arc::new(ControlSender::new(
            control_socket.clone(),
            config.server_addr,
            config.ack_timeout,
            config.max_attempts,
            rand::random(),
        ));
        let reply_handle = tokio::spawn(recv_replies(control_socket, control.clone()));

        Ok(StreamClient {
            config,
            sockets,
            sink_factory,
            control,
            reply_handle,
            state: Mutex::new(StreamState::Idle),
        })
    }

    /// Requests `video` to be streamed to `port` on this host, and starts playback once the
    ///  server acknowledged. Returns the session's conn_id.
    pub async fn play(&self, video: &str, port: u16) -> Result<ConnId, StreamError> {
        let metrics = Metrics::new_shared();
        {
            let mut state = self.state.lock().await;
            match &*state {
                StreamState::Requesting { .. } => return Err(StreamError::AlreadyPlaying),
                StreamState::Active(active) if !active.is_finished() => return Err(StreamError::AlreadyPlaying),
                _ => {}
            }
            *state = StreamState::Requesting { stop_requested: false, metrics: metrics.clone() };
        }

        let result = self.start_stream(video, port, metrics.clone()).await;

        // STOP or QUIT may have replaced this request while it was in flight
        let mut state = self.state.lock().await;
        let (is_current, stop_requested) = match &*state {
            StreamState::Requesting { stop_requested, metrics: m } if Arc::ptr_eq(m, &metrics) => (true, *stop_requested),
            _ => (false, true),
        };
        match result {
            Ok(active) if !stop_requested => {
                let conn_id = active.conn_id;
                *state = StreamState::Active(active);
                Ok(conn_id)
            }
            Ok(active) => {
                debug!(conn_id = active.conn_id.0, "PLAY acknowledged after the stream was stopped or discarded - discarding it");
                if is_current {
                    *state = StreamState::Idle;
                }
                Err(StreamError::CommandCancelled(CommandType::Play))
            }
            Err(e) => {
                if is_current {
                    *state = StreamState::Idle;
                }
                Err(e)
            }
        }
    }

    async fn start_stream(&self, video: &str, port: u16, metrics: SharedMetrics) -> Result<ActiveStream, StreamError> {
        // bound before sending PLAY, so frames arriving ahead of the ACK wait in the socket
        let media_socket = self.sockets.bind(SocketAddr::new(self.config.media_bind_ip, port)).await
            .map_err(|e| StreamError::MediaPortUnavailable { port, reason: e.to_string() })?;

        metrics.lock().await.mark_requested(Instant::now());
        let request = PlayRequest { video_id: video.to_string(), port };
        let conn_id = ConnId(self.control.send_command(CommandType::Play, request.to_payload()).await?);
        info!(conn_id = conn_id.0, "server is streaming {:?} to port {}", video, port);

        let (queue_sender, queue_receiver) = mpsc::channel(self.config.playback_queue_capacity);
        let scheduler = PlaybackScheduler::new(
            PlaybackSettings::from_config(&self.config),
            queue_receiver,
            metrics.clone(),
            (self.sink_factory)(),
        );
        let (done_sender, playback_done) = watch::channel(false);
        let playback_handle = tokio::spawn(async move {
            scheduler.run().await;
            let _ = done_sender.send(true);
        });
        let receive_handle = tokio::spawn(recv_media(media_socket, LossDetector::new(conn_id), queue_sender, metrics.clone()));

        Ok(ActiveStream {
            conn_id,
            metrics,
            playback_done,
            receive_handle,
            playback_handle,
        })
    }

    /// Waits until the current stream was played to its end, and returns its metrics
    pub async fn wait_for_playback_end(&self) -> Result<MetricsSnapshot, StreamError> {
        let (mut playback_done, metrics) = match &*self.state.lock().await {
            StreamState::Active(active) => (active.playback_done.clone(), active.metrics.clone()),
            _ => return Err(StreamError::NotPlaying),
        };
        // an error means the playback task is gone, which is an end as well
        let _ = playback_done.wait_for(|done| *done).await;
        let snapshot = metrics.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Snapshot of the current stream's metrics, if there is one
    pub async fn metrics(&self) -> Option<MetricsSnapshot> {
        let metrics = match &*self.state.lock().await {
            StreamState::Idle => return None,
            StreamState::Requesting { metrics, .. } => metrics.clone(),
            StreamState::Active(active) => active.metrics.clone(),
        };
        let snapshot = metrics.lock().await.snapshot();
        Some(snapshot)
    }

    /// Ends playback locally and tells the server to stop streaming. Returns the final metrics.
    ///
    /// Local teardown happens even if the server cannot be reached, in which case
    ///  [StreamError::StoppedLocally] carries the final metrics. Stopping while PLAY is still
    ///  retrying cancels the PLAY.
    pub async fn stop(&self) -> Result<MetricsSnapshot, StreamError> {
        let (conn_id, metrics) = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, StreamState::Idle) {
                StreamState::Idle => return Err(StreamError::NotPlaying),
                StreamState::Requesting { metrics, .. } => {
                    *state = StreamState::Requesting { stop_requested: true, metrics: metrics.clone() };
                    // the session may or may not exist on the server, so stop all of ours
                    (None, metrics)
                }
                StreamState::Active(active) => (Some(active.conn_id), active.metrics.clone()),
            }
        };

        let snapshot = {
            let mut metrics = metrics.lock().await;
            metrics.mark_playback_end(Instant::now());
            metrics.snapshot()
        };

        match self.control.send_command(CommandType::Stop, StopRequest { conn_id }.to_payload()).await {
            Ok(_) => Ok(snapshot),
            Err(e) => {
                warn!("STOP was not acknowledged: {}", e);
                Err(StreamError::StoppedLocally { metrics: Box::new(snapshot), cause: Box::new(e) })
            }
        }
    }

    /// Discards the current stream without stopping it on the server or reporting metrics. A
    ///  PLAY that is still retrying is cancelled once it completes.
    pub async fn quit(&self) {
        let mut state = self.state.lock().await;
        if let StreamState::Active(active) = &*state {
            debug!(conn_id = active.conn_id.0, "quitting with an active stream");
        }
        *state = StreamState::Idle;
    }
}

async fn recv_replies(socket: Arc<dyn DatagramSocket>, control: Arc<ControlSender>) {
    loop {
        let (buf, from) = match socket.recv_from().await {
            Ok(x) => x,
            Err(e) => {
                error!("control socket error: {} - no more replies can be received", e);
                return;
            }
        };

        match decode_control(&buf) {
            Ok(ControlPacket::Reply(reply)) => {
                trace!("received {:?} from {:?}", reply, from);
                control.on_reply(reply).await;
            }
            Ok(ControlPacket::Command(command)) => {
                debug!("unexpected {:?} command from {:?} - dropping", command.command_type, from);
            }
            Err(e) => {
                debug!("undecodable control packet from {:?}: {} - dropping", from, e);
            }
        }
    }
}

/// Receives the media packets of one session, classifies them and feeds delivered frames to
///  the playback queue. Ends with the end of stream.
async fn recv_media(socket: Arc<dyn DatagramSocket>, mut detector: LossDetector, queue: mpsc::Sender<PlaybackInput>, metrics: SharedMetrics) {
    loop {
        let (buf, from) = match socket.recv_from().await {
            Ok(x) => x,
            Err(e) => {
                error!("media socket error: {} - ending the stream", e);
                break;
            }
        };
        let packet = match decode_media(&buf) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("undecodable media packet from {:?}: {} - dropping", from, e);
                continue;
            }
        };

        match detector.on_packet(packet) {
            Detection::Delivered { frame, lost } => {
                if lost > 0 {
                    metrics.lock().await.record_dropped_many(DropCause::Lost, lost as u64);
                }
                match queue.try_send(PlaybackInput::Frame(frame)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("playback queue is full - dropping frame");
                        metrics.lock().await.record_dropped(DropCause::Overflow);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("playback has ended - no longer receiving");
                        return;
                    }
                }
            }
            Detection::Rejected { record, .. } => {
                if let Some(cause) = record.drop_cause() {
                    metrics.lock().await.record_dropped(cause);
                }
            }
            Detection::Discarded => {}
            Detection::EndOfStream => break,
        }
    }

    let _ = queue.send(PlaybackInput::EndOfStream).await;
}
