use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::StreamError;
use crate::transport::DatagramSocket;
use crate::wire::control::{Command, Reply};

/// Executes a control command. Called at most once per (peer, sequence number); the returned
///  value is sent back as the ACK's metadata, an error becomes a REJECT.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle_command(&self, peer: SocketAddr, command: &Command) -> Result<u32, StreamError>;
}

struct PeerState {
    /// replies to recently processed commands, oldest first
    replies: VecDeque<Reply>,
    /// newest sequence number processed for this peer
    highest_seq: u32,
    last_seen: Instant,
}

impl PeerState {
    /// Sequence numbers up to this far behind the newest processed one are stale. Anything
    ///  further behind is taken as a restarted peer with a fresh random start.
    const STALE_WINDOW: u32 = 1 << 16;

    /// `seq` precedes the newest processed command in serial number order
    fn is_stale(&self, seq: u32) -> bool {
        let behind = self.highest_seq.wrapping_sub(seq);
        behind != 0 && behind <= Self::STALE_WINDOW
    }

    fn cached_reply(&self, seq: u32) -> Option<Reply> {
        self.replies.iter()
            .find(|r| r.seq() == seq)
            .copied()
    }

    fn remember(&mut self, reply: Reply, capacity: usize) {
        while self.replies.len() >= capacity {
            self.replies.pop_front();
        }
        self.replies.push_back(reply);
    }
}

/// Receiver side of the Stop-and-Wait control protocol: processes each command at most once
///  and answers duplicates (retransmissions after a lost reply) with the cached reply.
///
/// Commands are processed in sequence number order per peer. A delayed copy of a command that
///  was superseded by a newer one is dropped unprocessed, so a PLAY overtaken by its STOP does
///  not start a stream.
pub struct ControlReceiver {
    socket: Arc<dyn DatagramSocket>,
    handler: Arc<dyn CommandHandler>,
    reply_cache_size: usize,
    peer_state_ttl: Duration,
    peers: FxHashMap<SocketAddr, PeerState>,
}

impl ControlReceiver {
    pub fn new(socket: Arc<dyn DatagramSocket>, handler: Arc<dyn CommandHandler>, reply_cache_size: usize, peer_state_ttl: Duration) -> ControlReceiver {
        ControlReceiver {
            socket,
            handler,
            reply_cache_size: reply_cache_size.max(1),
            peer_state_ttl,
            peers: Default::default(),
        }
    }

    pub async fn on_command(&mut self, peer: SocketAddr, command: Command) {
        let now = Instant::now();
        self.expire_idle_peers(now);

        if let Some(state) = self.peers.get_mut(&peer) {
            state.last_seen = now;
            if let Some(cached) = state.cached_reply(command.seq) {
                debug!("duplicate {:?} command #{} from {:?} - re-sending cached reply", command.command_type, command.seq, peer);
                self.send_reply(peer, cached).await;
                return;
            }
            if state.is_stale(command.seq) {
                debug!("{:?} command #{} from {:?} is older than #{} - dropping", command.command_type, command.seq, peer, state.highest_seq);
                return;
            }
        }

        trace!("processing {:?} command #{} from {:?}", command.command_type, command.seq, peer);
        let reply = match self.handler.handle_command(peer, &command).await {
            Ok(metadata) => Reply::Ack { seq: command.seq, metadata },
            Err(e) => {
                info!("rejecting {:?} command #{} from {:?}: {}", command.command_type, command.seq, peer, e);
                Reply::Reject { seq: command.seq, reason: e.reject_reason() }
            }
        };

        let state = self.peers.entry(peer)
            .or_insert_with(|| PeerState { replies: VecDeque::new(), highest_seq: command.seq, last_seen: now });
        state.highest_seq = command.seq;
        state.remember(reply, self.reply_cache_size);
        self.send_reply(peer, reply).await;
    }

    fn expire_idle_peers(&mut self, now: Instant) {
        let ttl = self.peer_state_ttl;
        self.peers.retain(|peer, state| {
            let keep = now.saturating_duration_since(state.last_seen) < ttl;
            if !keep {
                debug!("forgetting control state of idle peer {:?}", peer);
            }
            keep
        });
    }

    async fn send_reply(&self, peer: SocketAddr, reply: Reply) {
        let mut buf = BytesMut::with_capacity(Reply::SERIALIZED_LEN);
        reply.ser(&mut buf);
        self.socket.send_to(peer, &buf).await;
    }
}
