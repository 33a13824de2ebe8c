//! Fixed-layout packet formats. All integers are in network byte order.

pub mod checksum;
pub mod control;
pub mod media;

use std::fmt::{Display, Formatter};

use bytes::Buf;

use crate::error::DecodeError;

/// Server-assigned session identifier, unique for the lifetime of a server process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated { needed, available: buf.remaining() });
    }
    Ok(())
}

fn ensure_consumed(buf: &impl Buf) -> Result<(), DecodeError> {
    if buf.has_remaining() {
        return Err(DecodeError::TrailingBytes(buf.remaining()));
    }
    Ok(())
}
