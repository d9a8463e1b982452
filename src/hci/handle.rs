use std::fmt::{Debug, Display, Formatter};
use std::num::{NonZeroU16, NonZeroU8};

use crate::util::name_of;

/// Connection handle ([Vol 4] Part E, Section 5.4.2).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnHandle(NonZeroU16);

impl ConnHandle {
    /// Number of meaningful bits in the ACL data packet header.
    pub(crate) const BITS: u16 = 12;
    /// Mask of the handle bits in the ACL data packet header.
    pub(crate) const MASK: u16 = (1 << Self::BITS) - 1;
    /// Maximum valid connection handle.
    pub const MAX: u16 = 0xEFF;

    /// Wraps a raw connection handle. Returns `None` if the handle is outside
    /// of the valid range.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Option<Self> {
        if v > Self::MAX {
            return None;
        }
        // v can't be 0xFFFF, so !v is never 0
        match NonZeroU16::new(!v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }
}

impl From<ConnHandle> for u16 {
    #[inline]
    fn from(cn: ConnHandle) -> Self {
        !cn.0.get()
    }
}

impl Debug for ConnHandle {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#05X})", name_of!(ConnHandle), u16::from(*self))
    }
}

impl Display for ConnHandle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Advertising set handle ([Vol 4] Part E, Section 7.8.53).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct AdvHandle(NonZeroU8);

impl AdvHandle {
    /// Maximum valid advertising handle.
    pub const MAX: u8 = 0xEF;

    /// Wraps a raw advertising handle. Returns `None` if the handle is invalid.
    #[inline]
    #[must_use]
    pub const fn new(v: u8) -> Option<Self> {
        if v > Self::MAX {
            return None;
        }
        match NonZeroU8::new(!v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }
}

impl From<AdvHandle> for u8 {
    #[inline]
    fn from(h: AdvHandle) -> Self {
        !h.0.get()
    }
}

impl Debug for AdvHandle {
    #[allow(clippy::use_self)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#04X})", name_of!(AdvHandle), u8::from(*self))
    }
}

impl Display for AdvHandle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
