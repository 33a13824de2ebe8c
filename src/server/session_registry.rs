use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::error::StreamError;
use crate::wire::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Streaming,
    Stopping,
    Closed,
}

/// One client's stream as the registry knows it. Clones share the status channel, so a status
///  change is visible to the session's pacer.
#[derive(Debug, Clone)]
pub struct Session {
    pub conn_id: ConnId,
    /// the address PLAY was received from
    pub control_peer: SocketAddr,
    /// where media packets go: the control peer's IP with the port requested in PLAY
    pub media_endpoint: SocketAddr,
    pub video_id: String,
    /// sequence number of the PLAY command that created the session
    pub control_seq: u32,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }
}

struct RegistryInner {
    last_conn_id: u32,
    sessions: FxHashMap<ConnId, Session>,
}

/// The server's table of active sessions. `conn_id`s are assigned from a monotonic counter
///  and never handed out twice by the same registry.
pub struct SessionRegistry {
    max_sessions: usize,
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> SessionRegistry {
        SessionRegistry {
            max_sessions,
            inner: RwLock::new(RegistryInner {
                last_conn_id: 0,
                sessions: Default::default(),
            }),
        }
    }

    pub async fn create(&self, control_peer: SocketAddr, media_endpoint: SocketAddr, video_id: &str, control_seq: u32) -> Result<Session, StreamError> {
        let mut inner = self.inner.write().await;

        if inner.sessions.len() >= self.max_sessions {
            return Err(StreamError::CapacityExceeded { limit: self.max_sessions });
        }
        if inner.sessions.values().any(|s| s.media_endpoint == media_endpoint) {
            return Err(StreamError::PortInUse(media_endpoint));
        }
        let Some(next_conn_id) = inner.last_conn_id.checked_add(1) else {
            return Err(StreamError::CapacityExceeded { limit: self.max_sessions });
        };
        inner.last_conn_id = next_conn_id;

        let (status, _) = watch::channel(SessionStatus::Pending);
        let session = Session {
            conn_id: ConnId(next_conn_id),
            control_peer,
            media_endpoint,
            video_id: video_id.to_string(),
            control_seq,
            status: Arc::new(status),
        };
        inner.sessions.insert(session.conn_id, session.clone());

        info!(conn_id = session.conn_id.0, ?media_endpoint, "created session for video {:?}", video_id);
        Ok(session)
    }

    pub async fn lookup(&self, conn_id: ConnId) -> Result<Session, StreamError> {
        self.inner.read().await
            .sessions.get(&conn_id)
            .cloned()
            .ok_or(StreamError::UnknownSession(conn_id))
    }

    pub async fn sessions_of_peer(&self, control_peer: SocketAddr) -> Vec<Session> {
        self.inner.read().await
            .sessions.values()
            .filter(|s| s.control_peer == control_peer)
            .cloned()
            .collect()
    }

    /// Removes the session and marks it closed. Returns `None` if it was closed already.
    pub async fn close(&self, conn_id: ConnId) -> Option<Session> {
        let removed = self.inner.write().await
            .sessions.remove(&conn_id);

        match &removed {
            Some(session) => {
                session.set_status(SessionStatus::Closed);
                info!(conn_id = conn_id.0, "closed session");
            }
            None => debug!(conn_id = conn_id.0, "session was closed already"),
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
