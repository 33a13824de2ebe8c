use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::DecodeError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::{ensure_consumed, ensure_remaining, ConnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandType {
    Play = 1,
    Stop = 2,
}

/// Reason code carried in the metadata field of a REJECT reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum RejectReason {
    CapacityExceeded = 1,
    PortInUse = 2,
    UnknownVideo = 3,
    InvalidRequest = 4,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectReason::CapacityExceeded => "server session capacity exceeded",
            RejectReason::PortInUse => "port already in use by an active session",
            RejectReason::UnknownVideo => "unknown video",
            RejectReason::InvalidRequest => "invalid request",
        };
        f.write_str(text)
    }
}

pub const ACK_TYPE: u8 = 10;
pub const REJECT_TYPE: u8 = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_type: CommandType,
    pub seq: u32,
    pub payload: Bytes,
}

impl Command {
    pub const HEADER_LEN: usize = 9;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command_type.into());
        buf.put_u32(self.seq);
        buf.put_u32(self.payload.len().prechecked_cast());
        buf.put_slice(&self.payload);
    }

    fn deser_body(command_type: CommandType, buf: &mut impl Buf) -> Result<Command, DecodeError> {
        ensure_remaining(buf, Self::HEADER_LEN - 1)?;
        let seq = buf.get_u32();
        let declared = buf.get_u32();
        if buf.remaining() != declared.safe_cast() {
            return Err(DecodeError::LengthMismatch { declared, actual: buf.remaining() });
        }
        let payload = buf.copy_to_bytes(declared.safe_cast());
        Ok(Command { command_type, seq, payload })
    }
}

/// The receiver's answer to a command, matched to it by sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack { seq: u32, metadata: u32 },
    Reject { seq: u32, reason: RejectReason },
}

impl Reply {
    pub const SERIALIZED_LEN: usize = 9;

    pub fn seq(&self) -> u32 {
        match self {
            Reply::Ack { seq, .. } => *seq,
            Reply::Reject { seq, .. } => *seq,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match *self {
            Reply::Ack { seq, metadata } => {
                buf.put_u8(ACK_TYPE);
                buf.put_u32(seq);
                buf.put_u32(metadata);
            }
            Reply::Reject { seq, reason } => {
                buf.put_u8(REJECT_TYPE);
                buf.put_u32(seq);
                buf.put_u32(reason.into());
            }
        }
    }

    fn deser_body(packet_type: u8, buf: &mut impl Buf) -> Result<Reply, DecodeError> {
        ensure_remaining(buf, Self::SERIALIZED_LEN - 1)?;
        let seq = buf.get_u32();
        let metadata = buf.get_u32();
        ensure_consumed(buf)?;

        if packet_type == ACK_TYPE {
            return Ok(Reply::Ack { seq, metadata });
        }
        let reason = RejectReason::try_from(metadata)
            .map_err(|_| DecodeError::InvalidPayload(format!("unknown reject reason {}", metadata)))?;
        Ok(Reply::Reject { seq, reason })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Command(Command),
    Reply(Reply),
}

impl ControlPacket {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            ControlPacket::Command(command) => command.ser(buf),
            ControlPacket::Reply(reply) => reply.ser(buf),
        }
    }

    /// Decodes a complete datagram - trailing bytes are an error
    pub fn deser(buf: &mut impl Buf) -> Result<ControlPacket, DecodeError> {
        ensure_remaining(buf, 1)?;
        let packet_type = buf.get_u8();
        match packet_type {
            ACK_TYPE | REJECT_TYPE => Ok(ControlPacket::Reply(Reply::deser_body(packet_type, buf)?)),
            other => {
                let command_type = CommandType::try_from(other)
                    .map_err(|_| DecodeError::UnknownType(other))?;
                Ok(ControlPacket::Command(Command::deser_body(command_type, buf)?))
            }
        }
    }
}

pub fn encode_control(packet: &ControlPacket) -> Bytes {
    let mut buf = BytesMut::new();
    packet.ser(&mut buf);
    buf.freeze()
}

pub fn decode_control(mut buf: &[u8]) -> Result<ControlPacket, DecodeError> {
    ControlPacket::deser(&mut buf)
}

/// PLAY arguments, sent as UTF-8 `"<video> <udp_port>"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRequest {
    pub video_id: String,
    pub port: u16,
}

impl PlayRequest {
    pub fn to_payload(&self) -> Bytes {
        Bytes::from(format!("{} {}", self.video_id, self.port))
    }

    pub fn parse(payload: &[u8]) -> Result<PlayRequest, DecodeError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| DecodeError::InvalidPayload("PLAY payload is not UTF-8".to_string()))?;

        // the port is the last token, so video names may contain blanks
        let (video_id, port) = text.trim().rsplit_once(' ')
            .ok_or_else(|| DecodeError::InvalidPayload(format!("expected '<video> <port>', got {:?}", text)))?;
        let video_id = video_id.trim();
        if video_id.is_empty() {
            return Err(DecodeError::InvalidPayload("empty video name".to_string()));
        }
        let port = match port.parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => return Err(DecodeError::InvalidPayload(format!("invalid port {:?}", port))),
        };

        Ok(PlayRequest { video_id: video_id.to_string(), port })
    }
}

/// STOP arguments: the decimal conn_id of the session to stop. An empty payload stops all
///  sessions opened by the sending control peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    pub conn_id: Option<ConnId>,
}

impl StopRequest {
    pub fn to_payload(&self) -> Bytes {
        match self.conn_id {
            Some(conn_id) => Bytes::from(conn_id.to_string()),
            None => Bytes::new(),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<StopRequest, DecodeError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| DecodeError::InvalidPayload("STOP payload is not UTF-8".to_string()))?
            .trim();
        if text.is_empty() {
            return Ok(StopRequest { conn_id: None });
        }
        let conn_id = text.parse::<u32>()
            .map_err(|_| DecodeError::InvalidPayload(format!("invalid conn_id {:?}", text)))?;
        Ok(StopRequest { conn_id: Some(ConnId(conn_id)) })
    }
}
