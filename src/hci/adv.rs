use std::collections::HashMap;

use tracing::trace;

use crate::le::Addr;

use super::*;

/// Bidirectional map between device addresses and advertising handles
/// ([Vol 4] Part E, Section 7.8.53). Handles are allocated round-robin, so a
/// released handle is not reused until all other free handles were assigned.
#[derive(Clone, Debug)]
pub struct AdvHandleMap {
    by_addr: HashMap<Addr, AdvHandle>,
    by_handle: HashMap<AdvHandle, Addr>,
    cap: usize,
    last: Option<u8>,
}

impl AdvHandleMap {
    /// Creates an empty map that can allocate handles `0..cap`.
    ///
    /// # Panics
    ///
    /// Panics if `cap` exceeds the number of valid advertising handles.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        assert!(
            cap <= usize::from(AdvHandle::MAX) + 1,
            "invalid advertising handle map capacity: {cap}"
        );
        Self {
            by_addr: HashMap::with_capacity(cap),
            by_handle: HashMap::with_capacity(cap),
            cap,
            last: None,
        }
    }

    /// Returns the handle mapped to `addr`, allocating a new one if needed.
    /// Returns `None` if all handles are in use.
    pub fn map_handle(&mut self, addr: Addr) -> Option<AdvHandle> {
        if let Some(&h) = self.by_addr.get(&addr) {
            return Some(h);
        }
        if self.by_addr.len() >= self.cap {
            return None;
        }
        let start = self.last.map_or(0, |v| usize::from(v) + 1);
        let h = (start..start + self.cap)
            .filter_map(|v| AdvHandle::new((v % self.cap) as u8))
            .find(|h| !self.by_handle.contains_key(h))?;
        self.by_addr.insert(addr, h);
        self.by_handle.insert(h, addr);
        self.last = Some(u8::from(h));
        trace!("Mapped {addr} to {h}");
        Some(h)
    }

    /// Returns the handle mapped to `addr` without allocating.
    #[inline]
    #[must_use]
    pub fn get_handle(&self, addr: Addr) -> Option<AdvHandle> {
        self.by_addr.get(&addr).copied()
    }

    /// Returns the address mapped to handle `h`.
    #[inline]
    #[must_use]
    pub fn get_address(&self, h: AdvHandle) -> Option<Addr> {
        self.by_handle.get(&h).copied()
    }

    /// Removes handle `h`, returning its address.
    pub fn remove_handle(&mut self, h: AdvHandle) -> Option<Addr> {
        let addr = self.by_handle.remove(&h)?;
        self.by_addr.remove(&addr);
        trace!("Unmapped {h}");
        Some(addr)
    }

    /// Removes the mapping for `addr`, returning its handle.
    pub fn remove_address(&mut self, addr: Addr) -> Option<AdvHandle> {
        let h = self.by_addr.remove(&addr)?;
        self.by_handle.remove(&h);
        trace!("Unmapped {h}");
        Some(h)
    }

    /// Removes all mappings. The next allocation continues after the last
    /// assigned handle.
    #[inline]
    pub fn clear(&mut self) {
        self.by_addr.clear();
        self.by_handle.clear();
    }

    /// Returns the number of mapped handles.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.by_addr.len(), self.by_handle.len());
        self.by_addr.len()
    }

    /// Returns whether the map is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the maximum number of mapped handles.
    #[inline(always)]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.cap
    }
}
