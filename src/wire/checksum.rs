use std::fmt::{Debug, Formatter};

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::IntegrityError;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 over a media payload. The empty payload has checksum 0, which is what the
///  end-of-stream marker carries.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Checksum(pub u32);

impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl Checksum {
    pub fn of(data: &[u8]) -> Checksum {
        Checksum(CRC32.checksum(data))
    }

    pub fn verify(self, data: &[u8]) -> Result<(), IntegrityError> {
        let actual = Self::of(data);
        if actual != self {
            return Err(IntegrityError { expected: self.0, actual: actual.0 });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"", 0)]
    #[case::check_value(b"123456789", 0xcbf4_3926)]
    #[case::single(b"a", 0xe8b7_be43)]
    fn test_of(#[case] data: &[u8], #[case] expected: u32) {
        assert_eq!(Checksum::of(data), Checksum(expected));
    }

    #[test]
    fn test_verify_detects_flipped_byte() {
        let mut data = b"some compressed frame".to_vec();
        let checksum = Checksum::of(&data);
        assert!(checksum.verify(&data).is_ok());

        data[3] ^= 0x01;
        let err = checksum.verify(&data).unwrap_err();
        assert_eq!(err.expected, checksum.0);
        assert_ne!(err.actual, checksum.0);
    }
}
