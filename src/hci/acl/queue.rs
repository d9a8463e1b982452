use std::collections::VecDeque;

use super::*;

/// Outbound ACL data packet waiting for controller buffer space.
#[derive(Debug)]
pub struct QueuedPacket {
    packet: AclPacket,
    link: LinkType,
    cid: ChannelId,
    priority: Priority,
}

impl QueuedPacket {
    /// Returns the packet.
    #[inline(always)]
    #[must_use]
    pub const fn packet(&self) -> &AclPacket {
        &self.packet
    }

    /// Returns the destination connection handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> ConnHandle {
        self.packet.handle()
    }

    /// Returns the link type of the destination connection.
    #[inline(always)]
    #[must_use]
    pub const fn link_type(&self) -> LinkType {
        self.link
    }

    /// Returns the logical channel identifier supplied by the sender.
    #[inline(always)]
    #[must_use]
    pub const fn channel(&self) -> ChannelId {
        self.cid
    }

    /// Returns the packet priority.
    #[inline(always)]
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    fn is_low(&self, hdl: ConnHandle, cid: ChannelId) -> bool {
        self.priority == Priority::Low && self.cid == cid && self.handle() == hdl
    }
}

/// Priority send queue. All high-priority packets precede all low-priority
/// packets, and each class is kept in arrival order.
#[derive(Debug, Default)]
pub(super) struct SendQueue {
    q: VecDeque<QueuedPacket>,
    /// Number of high-priority packets at the front of the queue.
    high: usize,
}

impl SendQueue {
    #[inline]
    pub fn len(&self) -> usize {
        self.q.len()
    }

    #[inline]
    pub fn get(&self, i: usize) -> Option<&QueuedPacket> {
        self.q.get(i)
    }

    /// Removes the packet at index `i`.
    pub fn remove(&mut self, i: usize) -> Option<QueuedPacket> {
        let p = self.q.remove(i)?;
        if p.priority == Priority::High {
            self.high -= 1;
        }
        Some(p)
    }

    /// Removes all packets for which `f` returns `false`. Returns the number of
    /// removed packets.
    pub fn retain(&mut self, mut f: impl FnMut(&QueuedPacket) -> bool) -> usize {
        let n = self.q.len();
        self.q.retain(|p| f(p));
        self.high = (self.q.iter())
            .take_while(|p| p.priority == Priority::High)
            .count();
        n - self.q.len()
    }

    /// Appends a batch of packets for one connection. Low-priority packets
    /// beyond `limit` for the same connection and channel cause the oldest
    /// queued PDUs of that channel to be dropped. Returns the number of
    /// dropped packets.
    pub fn push(
        &mut self,
        pkts: Vec<AclPacket>,
        link: LinkType,
        cid: ChannelId,
        priority: Priority,
        limit: usize,
    ) -> usize {
        let dropped = match (priority, pkts.first()) {
            (Priority::Low, Some(p)) => self.make_room(p.handle(), cid, pkts.len(), limit),
            _ => 0,
        };
        for packet in pkts {
            let p = QueuedPacket {
                packet,
                link,
                cid,
                priority,
            };
            match priority {
                Priority::High => {
                    self.q.insert(self.high, p);
                    self.high += 1;
                }
                Priority::Low => self.q.push_back(p),
            }
        }
        dropped
    }

    /// Drops the oldest low-priority PDUs queued for `(hdl, cid)` until `n`
    /// more packets fit within `limit`. A PDU consists of the oldest packet
    /// and any continuing fragments that follow it.
    fn make_room(&mut self, hdl: ConnHandle, cid: ChannelId, n: usize, limit: usize) -> usize {
        let mut queued = (self.q.iter()).filter(|p| p.is_low(hdl, cid)).count();
        let mut dropped = 0;
        while queued > 0 && queued + n > limit {
            let Some(i) = self.q.iter().position(|p| p.is_low(hdl, cid)) else {
                break;
            };
            self.q.remove(i);
            (queued, dropped) = (queued - 1, dropped + 1);
            while let Some(j) = self.q.iter().position(|p| p.is_low(hdl, cid)) {
                if !self.q[j].packet.boundary().is_continuation() {
                    break;
                }
                self.q.remove(j);
                (queued, dropped) = (queued - 1, dropped + 1);
            }
        }
        dropped
    }
}
