use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, info, trace};

/// This is an abstraction for a datagram socket, introduced to facilitate mocking the I/O part
///  away for testing and to run complete sessions over an in-memory network.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Sending is fire-and-forget: errors are logged rather than returned, since media has no
    ///  recovery and control recovers through retransmission
    async fn send_to(&self, to: SocketAddr, buf: &[u8]);

    async fn recv_from(&self) -> anyhow::Result<(Bytes, SocketAddr)>;

    fn local_addr(&self) -> SocketAddr;
}

/// Creates bound sockets - the client binds its media socket per PLAY request
#[async_trait]
pub trait SocketFactory: Send + Sync + 'static {
    async fn bind(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn DatagramSocket>>;
}

pub struct UdpDatagramSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    max_datagram_size: usize,
}

impl UdpDatagramSocket {
    pub async fn bind(addr: SocketAddr, max_datagram_size: usize) -> anyhow::Result<UdpDatagramSocket> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);
        Ok(UdpDatagramSocket {
            socket,
            local_addr,
            max_datagram_size,
        })
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        if let Err(e) = self.socket.send_to(buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    async fn recv_from(&self) -> anyhow::Result<(Bytes, SocketAddr)> {
        let mut buf = BytesMut::with_capacity(self.max_datagram_size);
        let (num_read, from) = self.socket.recv_buf_from(&mut buf).await?;
        trace!("UDP socket: received {} bytes from {:?}", num_read, from);
        Ok((buf.freeze(), from))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct UdpSocketFactory {
    pub max_datagram_size: usize,
}

#[async_trait]
impl SocketFactory for UdpSocketFactory {
    async fn bind(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn DatagramSocket>> {
        Ok(Arc::new(UdpDatagramSocket::bind(addr, self.max_datagram_size).await?))
    }
}
