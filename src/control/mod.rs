//! Reliable control sub-protocol: Stop-and-Wait commands with ACK / REJECT replies on top of
//!  an unreliable datagram socket.

pub mod receiver;
pub mod sender;
