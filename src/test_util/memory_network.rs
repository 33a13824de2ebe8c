use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::transport::{DatagramSocket, SocketFactory};

/// A datagram as it was handed to the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Bytes,
}

/// What the network does with a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Deliver,
    Drop,
    Delay(Duration),
    /// flip all bits of the byte at this offset (modulo the datagram's length), then deliver
    Corrupt { offset: usize },
}

type Filter = Box<dyn FnMut(&Datagram) -> Fate + Send>;
type Inbox = mpsc::UnboundedSender<(Bytes, SocketAddr)>;

struct NetworkInner {
    endpoints: FxHashMap<SocketAddr, Inbox>,
    filters: Vec<Filter>,
    sent: Vec<Datagram>,
    next_ephemeral_port: u16,
}

/// An in-process datagram network. Delivery is immediate unless a filter decides otherwise,
///  which makes sessions fully deterministic on a runtime with paused time.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        MemoryNetwork::new()
    }
}

impl MemoryNetwork {
    const FIRST_EPHEMERAL_PORT: u16 = 49152;

    pub fn new() -> MemoryNetwork {
        MemoryNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                endpoints: Default::default(),
                filters: Vec::new(),
                sent: Vec::new(),
                next_ephemeral_port: Self::FIRST_EPHEMERAL_PORT,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Filters are consulted in the order they were added; the first one that does not return
    ///  [Fate::Deliver] decides.
    pub fn add_filter(&self, filter: impl FnMut(&Datagram) -> Fate + Send + 'static) {
        self.lock().filters.push(Box::new(filter));
    }

    /// All datagrams sent so far, including those that were dropped
    pub fn sent(&self) -> Vec<Datagram> {
        self.lock().sent.clone()
    }

    pub fn num_sent_to(&self, to: SocketAddr) -> usize {
        self.lock().sent.iter()
            .filter(|d| d.to == to)
            .count()
    }

    pub fn bind_socket(&self, addr: SocketAddr) -> anyhow::Result<MemorySocket> {
        let mut inner = self.lock();

        let ip = if addr.ip().is_unspecified() { IpAddr::V4(Ipv4Addr::LOCALHOST) } else { addr.ip() };
        let local_addr = if addr.port() == 0 {
            loop {
                let candidate = SocketAddr::new(ip, inner.next_ephemeral_port);
                inner.next_ephemeral_port = inner.next_ephemeral_port.checked_add(1)
                    .unwrap_or(Self::FIRST_EPHEMERAL_PORT);
                if !inner.endpoints.contains_key(&candidate) {
                    break candidate;
                }
            }
        }
        else {
            SocketAddr::new(ip, addr.port())
        };

        if inner.endpoints.contains_key(&local_addr) {
            bail!("address {:?} is already bound", local_addr);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        inner.endpoints.insert(local_addr, sender);
        trace!("memory network: bound {:?}", local_addr);

        Ok(MemorySocket {
            network: self.clone(),
            local_addr,
            receiver: tokio::sync::Mutex::new(receiver),
        })
    }

    fn unbind(&self, addr: SocketAddr) {
        self.lock().endpoints.remove(&addr);
    }

    fn send(&self, datagram: Datagram) {
        let (fate, inbox) = {
            let mut inner = self.lock();
            inner.sent.push(datagram.clone());

            let mut fate = Fate::Deliver;
            for filter in inner.filters.iter_mut() {
                fate = filter(&datagram);
                if fate != Fate::Deliver {
                    break;
                }
            }
            (fate, inner.endpoints.get(&datagram.to).cloned())
        };

        let Some(inbox) = inbox else {
            trace!("memory network: no socket bound to {:?} - dropping", datagram.to);
            return;
        };

        match fate {
            Fate::Deliver => {
                let _ = inbox.send((datagram.data, datagram.from));
            }
            Fate::Drop => {
                trace!("memory network: dropping datagram {:?} -> {:?}", datagram.from, datagram.to);
            }
            Fate::Delay(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbox.send((datagram.data, datagram.from));
                });
            }
            Fate::Corrupt { offset } => {
                let mut data = BytesMut::from(datagram.data.as_ref());
                if !data.is_empty() {
                    let offset = offset % data.len();
                    data[offset] = !data[offset];
                }
                let _ = inbox.send((data.freeze(), datagram.from));
            }
        }
    }
}

#[async_trait]
impl SocketFactory for MemoryNetwork {
    async fn bind(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn DatagramSocket>> {
        Ok(Arc::new(self.bind_socket(addr)?))
    }
}

pub struct MemorySocket {
    network: MemoryNetwork,
    local_addr: SocketAddr,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.unbind(self.local_addr);
    }
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) {
        self.network.send(Datagram {
            from: self.local_addr,
            to,
            data: Bytes::copy_from_slice(buf),
        });
    }

    async fn recv_from(&self) -> anyhow::Result<(Bytes, SocketAddr)> {
        self.receiver.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("memory socket {:?} is closed", self.local_addr))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
