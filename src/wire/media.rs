use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, IntegrityError};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::checksum::Checksum;
use crate::wire::{ensure_remaining, ConnId};

/// Reserved frame id marking the end of a session's stream
pub const END_OF_STREAM_FRAME_ID: u32 = 0xFFFF_FFFF;

/// One frame in flight: `conn_id:u32 frame_id:u32 pts_ms:f32 len:u32 checksum:u32 data`
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPacket {
    pub conn_id: ConnId,
    pub frame_id: u32,
    pub pts_ms: f32,
    pub checksum: Checksum,
    pub data: Bytes,
}

impl MediaPacket {
    pub const HEADER_LEN: usize = 20;

    pub fn new(conn_id: ConnId, frame_id: u32, pts_ms: f32, data: Bytes) -> MediaPacket {
        MediaPacket {
            conn_id,
            frame_id,
            pts_ms,
            checksum: Checksum::of(&data),
            data,
        }
    }

    pub fn end_of_stream(conn_id: ConnId) -> MediaPacket {
        MediaPacket {
            conn_id,
            frame_id: END_OF_STREAM_FRAME_ID,
            pts_ms: 0.0,
            checksum: Checksum(0),
            data: Bytes::new(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.frame_id == END_OF_STREAM_FRAME_ID
    }

    pub fn verify_checksum(&self) -> Result<(), IntegrityError> {
        self.checksum.verify(&self.data)
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.data.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.conn_id.0);
        buf.put_u32(self.frame_id);
        buf.put_f32(self.pts_ms);
        buf.put_u32(self.data.len().prechecked_cast());
        buf.put_u32(self.checksum.0);
        buf.put_slice(&self.data);
    }

    /// Decodes a complete datagram. The checksum is *not* verified here - that is a
    ///  classification decision made by the receiver.
    pub fn deser(buf: &mut impl Buf) -> Result<MediaPacket, DecodeError> {
        ensure_remaining(buf, Self::HEADER_LEN)?;
        let conn_id = ConnId(buf.get_u32());
        let frame_id = buf.get_u32();
        let pts_ms = buf.get_f32();
        let declared = buf.get_u32();
        let checksum = Checksum(buf.get_u32());

        if buf.remaining() != declared.safe_cast() {
            return Err(DecodeError::LengthMismatch { declared, actual: buf.remaining() });
        }
        let data = buf.copy_to_bytes(declared.safe_cast());

        Ok(MediaPacket {
            conn_id,
            frame_id,
            pts_ms,
            checksum,
            data,
        })
    }
}

pub fn encode_media(packet: &MediaPacket) -> Bytes {
    let mut buf = BytesMut::with_capacity(packet.serialized_len());
    packet.ser(&mut buf);
    buf.freeze()
}

pub fn decode_media(mut buf: &[u8]) -> Result<MediaPacket, DecodeError> {
    MediaPacket::deser(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first_frame(1, 0, 0.0, b"abc".as_slice())]
    #[case::highest_regular_id(0xffff_ffff, 0xffff_fffe, 178_956_960.0, b"x".as_slice())]
    #[case::empty_payload(5, 12, 500.0, b"".as_slice())]
    #[case::fractional_pts(5, 1, 41.666_668, b"\0\x01\x02".as_slice())]
    fn test_round_trip(#[case] conn_id: u32, #[case] frame_id: u32, #[case] pts_ms: f32, #[case] data: &[u8]) {
        let packet = MediaPacket::new(ConnId(conn_id), frame_id, pts_ms, Bytes::copy_from_slice(data));
        let encoded = encode_media(&packet);
        assert_eq!(encoded.len(), MediaPacket::HEADER_LEN + data.len());

        let decoded = decode_media(&encoded).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.verify_checksum().is_ok());
    }

    #[test]
    fn test_ser_layout() {
        let packet = MediaPacket {
            conn_id: ConnId(1),
            frame_id: 2,
            pts_ms: 1.0,
            checksum: Checksum(0x0102_0304),
            data: Bytes::from_static(b"ab"),
        };
        assert_eq!(
            encode_media(&packet).as_ref(),
            b"\0\0\0\x01\0\0\0\x02\x3f\x80\0\0\0\0\0\x02\x01\x02\x03\x04ab".as_slice()
        );
    }

    #[test]
    fn test_end_of_stream_marker() {
        let marker = MediaPacket::end_of_stream(ConnId(9));
        let encoded = encode_media(&marker);
        assert_eq!(encoded.as_ref(), b"\0\0\0\x09\xff\xff\xff\xff\0\0\0\0\0\0\0\0\0\0\0\0".as_slice());

        let decoded = decode_media(&encoded).unwrap();
        assert!(decoded.is_end_of_stream());
        assert!(decoded.verify_checksum().is_ok());
    }

    #[rstest]
    #[case::empty(b"".as_slice(), DecodeError::Truncated { needed: 20, available: 0 })]
    #[case::short_header(b"\0\0\0\x01\0\0\0\x02".as_slice(), DecodeError::Truncated { needed: 20, available: 8 })]
    #[case::short_payload(b"\0\0\0\x01\0\0\0\x02\0\0\0\0\0\0\0\x04\0\0\0\0ab".as_slice(), DecodeError::LengthMismatch { declared: 4, actual: 2 })]
    #[case::long_payload(b"\0\0\0\x01\0\0\0\x02\0\0\0\0\0\0\0\x01\0\0\0\0ab".as_slice(), DecodeError::LengthMismatch { declared: 1, actual: 2 })]
    fn test_decode_fails_closed(#[case] buf: &[u8], #[case] expected: DecodeError) {
        assert_eq!(decode_media(buf).unwrap_err(), expected);
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let packet = MediaPacket::new(ConnId(1), 3, 125.0, Bytes::from_static(b"frame payload"));
        let mut encoded = encode_media(&packet).to_vec();
        encoded[MediaPacket::HEADER_LEN + 2] ^= 0x80;

        let decoded = decode_media(&encoded).unwrap();
        assert!(decoded.verify_checksum().is_err());
    }
}
