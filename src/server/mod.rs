pub mod pacer;
pub mod session_registry;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::control::receiver::{CommandHandler, ControlReceiver};
use crate::error::StreamError;
use crate::server::pacer::MediaPacer;
use crate::server::session_registry::{SessionRegistry, SessionStatus};
use crate::source::{DirectorySourceFactory, FrameSourceFactory};
use crate::transport::{DatagramSocket, UdpDatagramSocket};
use crate::wire::control::{decode_control, Command, CommandType, ControlPacket, PlayRequest, StopRequest};

/// The streaming server: a single receive loop for control commands, plus one pacer task per
///  active session.
pub struct StreamServer {
    config: Arc<ServerConfig>,
    socket: Arc<dyn DatagramSocket>,
    registry: Arc<SessionRegistry>,
    handler: Arc<ServerCommandHandler>,
}

impl StreamServer {
    /// Binds a UDP socket and serves videos from the configured media directory
    pub async fn bind(config: ServerConfig) -> anyhow::Result<StreamServer> {
        config.validate()?;
        let socket = UdpDatagramSocket::bind(config.bind_addr, config.max_datagram_size).await?;
        let sources = DirectorySourceFactory::new(config.media_root.clone(), config.chunk_size, config.frame_rate);
        StreamServer::new(config, Arc::new(socket), Arc::new(sources))
    }

    pub fn new(config: ServerConfig, socket: Arc<dyn DatagramSocket>, sources: Arc<dyn FrameSourceFactory>) -> anyhow::Result<StreamServer> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let handler = Arc::new(ServerCommandHandler {
            config: config.clone(),
            socket: socket.clone(),
            registry: registry.clone(),
            sources,
        });

        Ok(StreamServer {
            config,
            socket,
            registry,
            handler,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Runs until the socket fails. Undecodable datagrams are logged and dropped.
    pub async fn recv_loop(&self) -> anyhow::Result<()> {
        info!("serving control commands on {:?}", self.local_addr());

        let mut receiver = ControlReceiver::new(
            self.socket.clone(),
            self.handler.clone(),
            self.config.reply_cache_size,
            self.config.peer_state_ttl,
        );

        loop {
            let (buf, from) = match self.socket.recv_from().await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    return Err(e);
                }
            };

            match decode_control(&buf) {
                Ok(ControlPacket::Command(command)) => receiver.on_command(from, command).await,
                Ok(ControlPacket::Reply(reply)) => {
                    debug!("unexpected reply #{} from {:?} - dropping", reply.seq(), from);
                }
                Err(e) => {
                    warn!("undecodable control packet from {:?}: {} - dropping", from, e);
                }
            }
        }
    }
}

struct ServerCommandHandler {
    config: Arc<ServerConfig>,
    socket: Arc<dyn DatagramSocket>,
    registry: Arc<SessionRegistry>,
    sources: Arc<dyn FrameSourceFactory>,
}

impl ServerCommandHandler {
    async fn on_play(&self, peer: SocketAddr, command: &Command) -> Result<u32, StreamError> {
        let request = PlayRequest::parse(&command.payload)?;
        let media_endpoint = SocketAddr::new(peer.ip(), request.port);

        // opening the source first means a missing video leaves no session behind
        let source = self.sources.open(&request.video_id).await?;
        let session = self.registry.create(peer, media_endpoint, &request.video_id, command.seq).await?;
        let conn_id = session.conn_id;

        MediaPacer::new(self.socket.clone(), self.registry.clone(), self.config.frame_rate, self.config.max_session_lifetime)
            .start(session, source);
        Ok(conn_id.0)
    }

    async fn on_stop(&self, peer: SocketAddr, command: &Command) -> Result<u32, StreamError> {
        let request = StopRequest::parse(&command.payload)?;

        let sessions = match request.conn_id {
            Some(conn_id) => match self.registry.lookup(conn_id).await {
                Ok(session) if session.control_peer == peer => vec![session],
                Ok(_) => {
                    warn!(conn_id = conn_id.0, "STOP from {:?}, which does not own the session - ignoring", peer);
                    vec![]
                }
                Err(_) => {
                    debug!(conn_id = conn_id.0, "STOP for a session that is closed already");
                    vec![]
                }
            },
            None => self.registry.sessions_of_peer(peer).await,
        };

        for session in sessions {
            session.set_status(SessionStatus::Stopping);
            self.registry.close(session.conn_id).await;
        }
        Ok(0)
    }
}

#[async_trait]
impl CommandHandler for ServerCommandHandler {
    async fn handle_command(&self, peer: SocketAddr, command: &Command) -> Result<u32, StreamError> {
        match command.command_type {
            CommandType::Play => self.on_play(peer, command).await,
            CommandType::Stop => self.on_stop(peer, command).await,
        }
    }
}
