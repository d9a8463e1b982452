//! LE device addresses ([Vol 6] Part B, Section 1.3).

use std::fmt::{Debug, Display, Formatter};

/// Typed device address used to identify advertising sets.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Addr {
    Public(RawAddr),
    Random(RawAddr),
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Public(raw) => write!(f, "{raw}"),
            Self::Random(raw) => write!(f, "{raw} (random)"),
        }
    }
}

/// Untyped 48-bit address in little-endian byte order, as transferred over
/// HCI.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct RawAddr([u8; 6]);

impl From<[u8; 6]> for RawAddr {
    #[inline(always)]
    fn from(v: [u8; 6]) -> Self {
        Self(v)
    }
}

impl Debug for RawAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Most significant byte first ([Vol 3] Part C, Section 3.2.1.3)
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl Display for RawAddr {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
