/// Widening casts that cannot lose information on the supported targets
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// Narrowing casts for lengths that were range checked before they reach the wire.
/// NB: panics if the value does not fit, which is a bug in the calling code
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: payload length should have been bounded by the datagram size")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_casts() {
        let len: usize = 4096;
        let on_wire: u32 = len.prechecked_cast();
        assert_eq!(on_wire, 4096);
        let back: usize = on_wire.safe_cast();
        assert_eq!(back, len);
    }

    #[test]
    #[should_panic]
    #[cfg(target_pointer_width = "64")]
    fn test_prechecked_cast_out_of_range() {
        let _: u32 = (u32::MAX as usize + 1).prechecked_cast();
    }
}
