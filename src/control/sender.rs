use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::StreamError;
use crate::transport::DatagramSocket;
use crate::wire::control::{Command, CommandType, Reply};

struct Outstanding {
    seq: u32,
    reply_sender: oneshot::Sender<Reply>,
}

/// Stop-and-Wait sender for control commands: at most one command is outstanding at any
///  time, and it is retransmitted until a reply with its sequence number arrives or the
///  attempts are exhausted.
///
/// Starting a new command while another one is outstanding cancels the older one, whose
///  caller gets [StreamError::CommandCancelled]. This is what lets STOP preempt a PLAY that
///  is still retrying.
pub struct ControlSender {
    socket: Arc<dyn DatagramSocket>,
    server_addr: SocketAddr,
    ack_timeout: Duration,
    max_attempts: u32,
    next_seq: AtomicU32,
    outstanding: Mutex<Option<Outstanding>>,
}

impl ControlSender {
    pub fn new(socket: Arc<dyn DatagramSocket>, server_addr: SocketAddr, ack_timeout: Duration, max_attempts: u32, initial_seq: u32) -> ControlSender {
        ControlSender {
            socket,
            server_addr,
            ack_timeout,
            max_attempts,
            next_seq: AtomicU32::new(initial_seq),
            outstanding: Mutex::new(None),
        }
    }

    /// Sends a command and waits for its reply. Returns the ACK's metadata.
    pub async fn send_command(&self, command_type: CommandType, payload: Bytes) -> Result<u32, StreamError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply_sender, mut reply_receiver) = oneshot::channel();

        if let Some(previous) = self.outstanding.lock().await.replace(Outstanding { seq, reply_sender }) {
            // dropping the previous reply sender wakes up the previous caller
            debug!("command #{} superseded by #{} - cancelling it", previous.seq, seq);
        }

        let mut buf = BytesMut::with_capacity(Command::HEADER_LEN + payload.len());
        Command { command_type, seq, payload }.ser(&mut buf);

        for attempt in 1..=self.max_attempts {
            trace!("sending {:?} command #{} to {:?}, attempt {}", command_type, seq, self.server_addr, attempt);
            self.socket.send_to(self.server_addr, &buf).await;

            match timeout(self.ack_timeout, &mut reply_receiver).await {
                Ok(Ok(reply)) => return Self::reply_to_result(reply),
                Ok(Err(_)) => return Err(StreamError::CommandCancelled(command_type)),
                Err(_) => {
                    // a reply may have been handed over just as the timer fired
                    if let Ok(reply) = reply_receiver.try_recv() {
                        return Self::reply_to_result(reply);
                    }
                    debug!("no reply for {:?} command #{} after attempt {}", command_type, seq, attempt);
                }
            }
        }

        self.clear_outstanding(seq).await;
        if let Ok(reply) = reply_receiver.try_recv() {
            return Self::reply_to_result(reply);
        }

        warn!("{:?} command #{} undelivered after {} attempts", command_type, seq, self.max_attempts);
        Err(StreamError::CommandUndelivered { command: command_type, attempts: self.max_attempts })
    }

    /// Hands a reply received on the control socket to the outstanding command, if it matches
    pub async fn on_reply(&self, reply: Reply) {
        let mut outstanding = self.outstanding.lock().await;
        match outstanding.as_ref() {
            Some(o) if o.seq == reply.seq() => {
                if let Some(o) = outstanding.take() {
                    trace!("received reply for command #{}", o.seq);
                    let _ = o.reply_sender.send(reply);
                }
            }
            _ => {
                debug!("reply for #{} does not match the outstanding command - dropping", reply.seq());
            }
        }
    }

    async fn clear_outstanding(&self, seq: u32) {
        let mut outstanding = self.outstanding.lock().await;
        if outstanding.as_ref().map(|o| o.seq) == Some(seq) {
            outstanding.take();
        }
    }

    fn reply_to_result(reply: Reply) -> Result<u32, StreamError> {
        match reply {
            Reply::Ack { metadata, .. } => Ok(metadata),
            Reply::Reject { reason, .. } => Err(StreamError::Rejected(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockDatagramSocket;
    use crate::wire::control::RejectReason;
    use std::sync::atomic::AtomicUsize;
    use tokio::runtime::Builder;
    use tokio::time::{sleep, Instant};

    const SERVER: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 8000);

    fn command_bytes(command_type: CommandType, seq: u32, payload: &'static [u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Command { command_type, seq, payload: Bytes::from_static(payload) }.ser(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_undelivered_after_max_attempts() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let expected = command_bytes(CommandType::Play, 100, b"clip 9000");
            let mut socket = MockDatagramSocket::new();
            socket.expect_send_to()
                .times(5)
                .withf(move |to, buf| to == &SERVER && buf == expected.as_slice())
                .returning(|_, _| ());

            let sender = ControlSender::new(Arc::new(socket), SERVER, Duration::from_millis(500), 5, 100);

            let start = Instant::now();
            let result = sender.send_command(CommandType::Play, Bytes::from_static(b"clip 9000")).await;
            assert!(matches!(result, Err(StreamError::CommandUndelivered { command: CommandType::Play, attempts: 5 })));
            assert!(start.elapsed() >= Duration::from_millis(2500));
            assert!(start.elapsed() < Duration::from_millis(2510));

            // a late reply must not be picked up by anything
            sender.on_reply(Reply::Ack { seq: 100, metadata: 1 }).await;
            assert!(sender.outstanding.lock().await.is_none());
        });
    }

    #[rstest::rstest]
    #[case::ack(Reply::Ack { seq: 7, metadata: 42 }, Some(42))]
    #[case::reject(Reply::Reject { seq: 7, reason: RejectReason::UnknownVideo }, None)]
    fn test_reply_releases_caller(#[case] reply: Reply, #[case] expected: Option<u32>) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let num_sent = Arc::new(AtomicUsize::new(0));
            let mut socket = MockDatagramSocket::new();
            let counter = num_sent.clone();
            socket.expect_send_to()
                .returning(move |_, _| { counter.fetch_add(1, Ordering::SeqCst); });

            let sender = Arc::new(ControlSender::new(Arc::new(socket), SERVER, Duration::from_millis(500), 5, 7));

            let replier = sender.clone();
            tokio::spawn(async move {
                // after two timeouts
                sleep(Duration::from_millis(1200)).await;
                replier.on_reply(Reply::Ack { seq: 6, metadata: 0 }).await;
                replier.on_reply(reply).await;
            });

            let result = sender.send_command(CommandType::Stop, Bytes::new()).await;
            match expected {
                Some(metadata) => assert_eq!(result.unwrap(), metadata),
                None => assert!(matches!(result, Err(StreamError::Rejected(RejectReason::UnknownVideo)))),
            }
            assert_eq!(num_sent.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn test_new_command_cancels_outstanding() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut socket = MockDatagramSocket::new();
            socket.expect_send_to()
                .returning(|_, _| ());

            let sender = Arc::new(ControlSender::new(Arc::new(socket), SERVER, Duration::from_millis(500), 5, 1));

            let play_sender = sender.clone();
            let play = tokio::spawn(async move {
                play_sender.send_command(CommandType::Play, Bytes::from_static(b"clip 9000")).await
            });

            sleep(Duration::from_millis(700)).await;
            let stop_sender = sender.clone();
            let stop = tokio::spawn(async move {
                stop_sender.send_command(CommandType::Stop, Bytes::new()).await
            });

            sleep(Duration::from_millis(10)).await;
            assert!(matches!(play.await.unwrap(), Err(StreamError::CommandCancelled(CommandType::Play))));

            sender.on_reply(Reply::Ack { seq: 2, metadata: 0 }).await;
            assert_eq!(stop.await.unwrap().unwrap(), 0);
        });
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
            let mut socket = MockDatagramSocket::new();
            let s = seen.clone();
            socket.expect_send_to()
                .returning(move |_, buf| s.lock().unwrap().push(u32::from_be_bytes(buf[1..5].try_into().unwrap())));

            let sender = Arc::new(ControlSender::new(Arc::new(socket), SERVER, Duration::from_millis(500), 5, u32::MAX));
            for expected_seq in [u32::MAX, 0, 1] {
                let replier = sender.clone();
                tokio::spawn(async move {
                    sleep(Duration::from_millis(1)).await;
                    replier.on_reply(Reply::Ack { seq: expected_seq, metadata: 0 }).await;
                });
                sender.send_command(CommandType::Stop, Bytes::new()).await.unwrap();
            }
            assert_eq!(*seen.lock().unwrap(), vec![u32::MAX, 0, 1]);
        });
    }
}
