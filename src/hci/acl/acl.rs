//! ACL data flow control ([Vol 4] Part E, Section 4.1).
//!
//! The controller has a fixed number of ACL data packet buffers. The host may
//! only send a packet when it knows that a buffer is free, and learns that
//! buffers were released from `HCI_Number_Of_Completed_Packets` events. LE
//! links use a separate buffer pool when the controller provides one and share
//! the BR/EDR pool otherwise.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace, warn};

pub use queue::*;

use crate::host::{self, Channel, Dispatcher};

use super::*;

mod queue;

#[cfg(test)]
mod tests;

/// Opaque logical channel identifier used to group queued packets.
pub type ChannelId = u16;

/// Received ACL data packet handler.
pub type DataRxHandler = Box<dyn FnMut(AclPacket) + Send>;

/// Controller ACL data buffer description ([Vol 4] Part E, Sections 7.4.5
/// and 7.8.2).
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
)]
pub struct BufferInfo {
    /// Maximum payload length of one ACL data packet.
    pub max_data_len: usize,
    /// Total number of ACL data packets that the controller can hold.
    pub max_num_pkts: usize,
}

impl BufferInfo {
    /// Creates a new buffer description.
    #[inline]
    #[must_use]
    pub const fn new(max_data_len: u16, max_num_pkts: u16) -> Self {
        Self {
            max_data_len: max_data_len as usize,
            max_num_pkts: max_num_pkts as usize,
        }
    }

    /// Returns whether the buffer can hold any packets.
    #[inline]
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.max_num_pkts != 0
    }
}

/// Physical link type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LinkType {
    BrEdr,
    Le,
}

/// Outbound packet priority.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Priority {
    High,
    #[default]
    Low,
}

/// Handling of completion reports for more packets than were sent.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[non_exhaustive]
pub enum OvercountPolicy {
    /// Log the anomaly and treat the outstanding count as zero.
    #[default]
    Clamp,
    /// Panic.
    Panic,
}

/// ACL data channel configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct AclConfig {
    /// Maximum number of unsent low-priority packets for one connection and
    /// logical channel.
    pub max_queued_per_channel: usize,
    /// Completion over-report handling.
    pub overcount: OvercountPolicy,
}

impl Default for AclConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_queued_per_channel: 64,
            overcount: OvercountPolicy::Clamp,
        }
    }
}

/// Owner of the ACL data channel. Like [`CommandChannel`], this handle is
/// `!Send` and controls the channel lifecycle, while [`AclData`] handles
/// provide the concurrent API.
#[derive(Debug)]
pub struct AclDataChannel {
    acl: AclData,
    _not_send: PhantomData<*const ()>,
}

impl AclDataChannel {
    /// Creates an uninitialized ACL data channel. `events` provides the
    /// `NumberOfCompletedPackets` and `DataBufferOverflow` events. An
    /// unavailable `le` buffer means that LE links share the BR/EDR buffer.
    ///
    /// # Panics
    ///
    /// Panics if neither buffer is available.
    #[must_use]
    pub fn new(
        chan: impl Channel + 'static,
        events: Arc<dyn EventSource>,
        bredr: BufferInfo,
        le: BufferInfo,
        d: Arc<dyn Dispatcher>,
        cfg: AclConfig,
    ) -> Self {
        assert!(
            bredr.is_available() || le.is_available(),
            "no ACL data buffers available"
        );
        Self {
            acl: AclData(Arc::new(Inner {
                chan: Box::new(chan),
                events,
                dispatcher: d,
                bredr,
                le,
                cfg,
                io: Mutex::default(),
                tx: Mutex::default(),
                rx: Arc::default(),
            })),
            _not_send: PhantomData,
        }
    }

    /// Subscribes to flow control events and starts receiving data packets. A
    /// failure to watch the transport is returned, but the channel remains
    /// initialized for sending.
    ///
    /// # Panics
    ///
    /// Panics if the channel is already initialized or if called outside of a
    /// Tokio runtime.
    pub fn initialize(&self) -> Result<()> {
        self.acl.0.initialize()
    }

    /// Unsubscribes from events, stops receiving data packets, drops all
    /// queued packets, and resets all flow control state.
    #[inline]
    pub fn shut_down(&self) {
        self.acl.0.shut_down();
    }

    /// Returns a shareable ACL data channel handle.
    #[inline]
    #[must_use]
    pub fn data(&self) -> AclData {
        self.acl.clone()
    }
}

impl Deref for AclDataChannel {
    type Target = AclData;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.acl
    }
}

impl Drop for AclDataChannel {
    #[inline]
    fn drop(&mut self) {
        self.acl.0.shut_down();
    }
}

/// Shareable ACL data channel handle.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct AclData(Arc<Inner>);

impl AclData {
    /// Registers a connection that may receive data packets.
    ///
    /// # Panics
    ///
    /// Panics if the connection is already registered.
    pub fn register_link(&self, hdl: ConnHandle, link: LinkType) {
        let mut tx = self.0.tx.lock();
        let prev = tx.links.insert(hdl, link);
        assert!(prev.is_none(), "{hdl} is already registered");
        debug!("Registered {link:?} link {hdl}");
    }

    /// Unregisters a connection and drops any of its packets that were not
    /// yet sent. Packets already sent to the controller remain outstanding
    /// until completed or cleared by [`Self::clear_controller_packet_count`].
    pub fn unregister_link(&self, hdl: ConnHandle) {
        let mut tx = self.0.tx.lock();
        if tx.links.remove(&hdl).is_none() {
            warn!("Unregistering unknown {hdl}");
            return;
        }
        let n = tx.queue.retain(|p| p.handle() != hdl);
        debug!("Unregistered {hdl} ({n} queued packets dropped)");
    }

    /// Releases controller buffer credits for packets sent to an
    /// unregistered connection. This is used when the controller will not
    /// report their completion, such as after a disconnection.
    ///
    /// # Panics
    ///
    /// Panics if the connection is still registered.
    pub fn clear_controller_packet_count(&self, hdl: ConnHandle) {
        let mut tx = self.0.tx.lock();
        assert!(
            !tx.links.contains_key(&hdl),
            "clearing packet count of registered {hdl}"
        );
        let Some(p) = tx.pending.remove(&hdl) else {
            return;
        };
        debug!("Cleared {} outstanding packets of {hdl}", p.count);
        let pool = self.0.pool(p.link);
        *tx.sent_mut(pool) -= p.count;
        self.0.try_send(&mut tx);
    }

    /// Queues a packet for transmission.
    #[inline]
    pub fn send_packet(&self, pkt: AclPacket, cid: ChannelId, priority: Priority) -> Result<()> {
        self.0.send(vec![pkt], cid, priority)
    }

    /// Queues a batch of packets for one connection. The batch is either
    /// accepted or rejected as a whole.
    ///
    /// # Panics
    ///
    /// Panics if the packets are for different connections or if the first
    /// packet is a continuing fragment.
    #[inline]
    pub fn send_packets(
        &self,
        pkts: Vec<AclPacket>,
        cid: ChannelId,
        priority: Priority,
    ) -> Result<()> {
        self.0.send(pkts, cid, priority)
    }

    /// Drops all unsent packets for which `f` returns `true`. Returns the number
    /// of dropped packets.
    pub fn drop_queued_packets(&self, mut f: impl FnMut(&QueuedPacket) -> bool) -> usize {
        let n = self.0.tx.lock().queue.retain(|p| !f(p));
        trace!("Dropped {n} queued packets");
        n
    }

    /// Sets the handler for received data packets, replacing any existing one.
    pub fn set_data_rx_handler(&self, f: impl FnMut(AclPacket) + Send + 'static) {
        *self.0.rx.lock() = Some(Box::new(f));
    }

    /// Returns the BR/EDR buffer information.
    #[inline(always)]
    #[must_use]
    pub fn buffer_info(&self) -> BufferInfo {
        self.0.bredr
    }

    /// Returns the LE buffer information.
    #[inline(always)]
    #[must_use]
    pub fn le_buffer_info(&self) -> BufferInfo {
        self.0.le
    }

    /// Returns the number of packets waiting for controller buffer space.
    #[inline]
    #[must_use]
    pub fn queued_packets(&self) -> usize {
        self.0.tx.lock().queue.len()
    }

    /// Returns the number of packets sent to `hdl` that were not yet
    /// completed by the controller.
    #[inline]
    #[must_use]
    pub fn pending_packets(&self, hdl: ConnHandle) -> usize {
        self.0.tx.lock().pending.get(&hdl).map_or(0, |p| p.count)
    }

    /// Returns whether the channel is initialized.
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.0.tx.lock().initialized
    }
}

/// Shared ACL data channel state. The `io` lock is acquired before `tx`.
struct Inner {
    chan: Box<dyn Channel>,
    events: Arc<dyn EventSource>,
    dispatcher: Arc<dyn Dispatcher>,
    bredr: BufferInfo,
    le: BufferInfo,
    cfg: AclConfig,
    io: Mutex<Option<Io>>,
    tx: Mutex<TxState>,
    rx: Arc<Mutex<Option<DataRxHandler>>>,
}

/// Runtime state of an initialized channel.
#[derive(Debug)]
struct Io {
    handlers: SmallVec<[HandlerId; 2]>,
    _guard: DropGuard,
}

impl Inner {
    fn initialize(self: &Arc<Self>) -> Result<()> {
        let mut io = self.io.lock();
        assert!(io.is_none(), "ACL data channel already initialized");
        let mut handlers = SmallVec::new();
        for code in [
            EventCode::NumberOfCompletedPackets,
            EventCode::DataBufferOverflow,
        ] {
            let inner = Arc::downgrade(self);
            let f = move |evt: EventPacket| {
                if let Some(inner) = Weak::upgrade(&inner) {
                    inner.handle_event(&evt);
                }
                CallbackResult::Continue
            };
            match self.events.add_event_handler(code, Box::new(f)) {
                Ok(id) => handlers.push(id),
                Err(e) => {
                    error!("Failed to subscribe to {code:?} events: {e}");
                    handlers.into_iter().for_each(|id| self.events.remove_event_handler(id));
                    return Err(e);
                }
            }
        }
        let cancel = CancellationToken::new();
        let r = match self.chan.watch() {
            Ok(ready) => {
                tokio::spawn(Self::read_loop(Arc::clone(self), ready, cancel.clone()));
                Ok(())
            }
            Err(e) => {
                error!("Failed to watch ACL data channel: {e}");
                Err(Error::Host(e))
            }
        };
        self.tx.lock().initialized = true;
        *io = Some(Io {
            handlers,
            _guard: cancel.drop_guard(),
        });
        debug!("ACL data channel initialized");
        r
    }

    fn shut_down(&self) {
        let mut io = self.io.lock();
        let Some(Io {
            handlers,
            _guard: guard,
        }) = io.take()
        else {
            return;
        };
        debug!("ACL data channel shutting down");
        for id in handlers {
            self.events.remove_event_handler(id);
        }
        self.chan.unwatch();
        drop(guard);
        let mut tx = self.tx.lock();
        let n = tx.queue.len();
        *tx = TxState::default();
        drop(tx);
        drop(io);
        debug!("ACL data channel shut down ({n} queued packets dropped)");
    }

    /// Returns the buffer pool used by `link`.
    #[inline]
    fn pool(&self, link: LinkType) -> LinkType {
        if link == LinkType::Le && self.le.is_available() {
            LinkType::Le
        } else {
            LinkType::BrEdr
        }
    }

    /// Returns the buffer information of a pool.
    #[inline]
    const fn buffer(&self, pool: LinkType) -> &BufferInfo {
        match pool {
            LinkType::BrEdr => &self.bredr,
            LinkType::Le => &self.le,
        }
    }

    /// Validates and queues a batch of packets.
    fn send(&self, pkts: Vec<AclPacket>, cid: ChannelId, priority: Priority) -> Result<()> {
        let Some(first) = pkts.first() else {
            return Err(Error::EmptyBatch);
        };
        let hdl = first.handle();
        assert!(
            !first.boundary().is_continuation(),
            "ACL data batch for {hdl} starts with a continuing fragment"
        );
        assert!(
            pkts.iter().all(|p| p.handle() == hdl),
            "ACL data batch for {hdl} contains packets for other connections"
        );
        let mut tx = self.tx.lock();
        if !tx.initialized {
            return Err(Error::NotInitialized);
        }
        let Some(&link) = tx.links.get(&hdl) else {
            return Err(Error::UnknownLink(hdl));
        };
        let buf = self.buffer(self.pool(link));
        if !buf.is_available() {
            return Err(Error::NoBuffer(hdl));
        }
        let mtu = buf.max_data_len;
        if let Some(p) = pkts.iter().find(|p| p.payload().len() > mtu) {
            return Err(Error::PacketTooLong {
                len: p.payload().len(),
                mtu,
            });
        }
        let n = pkts.len();
        let limit = self.cfg.max_queued_per_channel;
        let dropped = tx.queue.push(pkts, link, cid, priority, limit);
        if dropped > 0 {
            warn!("Dropped {dropped} queued packets for {hdl} channel {cid:#06X}");
        }
        trace!("Queued {n} {priority:?} priority packets for {hdl}");
        self.try_send(&mut tx);
        Ok(())
    }

    /// Sends queued packets while the controller has free buffers.
    fn try_send(&self, tx: &mut TxState) {
        let mut bredr_free = self.bredr.max_num_pkts - tx.bredr_sent;
        let mut le_free = if self.le.is_available() {
            self.le.max_num_pkts - tx.le_sent
        } else {
            0
        };
        let mut batch = Vec::new();
        let mut i = 0;
        while bredr_free + le_free > 0 {
            let Some(p) = tx.queue.get(i) else {
                break;
            };
            let free = match self.pool(p.link_type()) {
                LinkType::BrEdr => &mut bredr_free,
                LinkType::Le => &mut le_free,
            };
            if *free == 0 {
                i += 1;
                continue;
            }
            *free -= 1;
            batch.extend(tx.queue.remove(i));
        }
        if batch.is_empty() {
            return;
        }
        let (mut bredr, mut le) = (0, 0);
        for p in batch {
            let hdl = p.handle();
            trace!("ACL data: {:02X?}", p.packet().as_ref());
            if let Err(e) = self.chan.write(p.packet().as_ref()) {
                error!("Failed to send ACL data packet to {hdl}: {e}");
                continue;
            }
            let link = p.link_type();
            tx.pending.entry(hdl).or_insert(Pending { link, count: 0 }).count += 1;
            match self.pool(link) {
                LinkType::BrEdr => bredr += 1,
                LinkType::Le => le += 1,
            }
        }
        tx.bredr_sent += bredr;
        tx.le_sent += le;
        assert!(
            tx.bredr_sent <= self.bredr.max_num_pkts && tx.le_sent <= self.le.max_num_pkts,
            "ACL data buffer credit overflow"
        );
    }

    /// Handles flow control events.
    fn handle_event(&self, evt: &EventPacket) {
        match evt.typ() {
            EventType::Hci(EventCode::NumberOfCompletedPackets) => {
                self.number_of_completed_packets(evt);
            }
            EventType::Hci(EventCode::DataBufferOverflow) => {
                error!("Controller ACL data buffer overflow: {:02X?}", evt.params());
                panic!("controller ACL data buffer overflow");
            }
            typ => warn!("Unexpected {typ} event"),
        }
    }

    /// Releases buffer credits for completed packets
    /// ([Vol 4] Part E, Section 7.7.19).
    fn number_of_completed_packets(&self, evt: &EventPacket) {
        let mut p = evt.unpack();
        let declared = usize::from(p.u8());
        let present = p.len() / 4;
        if declared != present || p.len() % 4 != 0 {
            warn!("NumberOfCompletedPackets with {declared} handles and {present} entries");
        }
        let mut tx = self.tx.lock();
        let (mut bredr, mut le) = (0, 0);
        for _ in 0..declared.min(present) {
            let (raw, mut n) = (p.u16(), usize::from(p.u16()));
            let Some(hdl) = ConnHandle::new(raw & ConnHandle::MASK) else {
                warn!("Completed packets for invalid handle {raw:#06X}");
                continue;
            };
            let Some(pend) = tx.pending.get_mut(&hdl) else {
                warn!("Completed packets for unknown {hdl}");
                continue;
            };
            if n > pend.count {
                match self.cfg.overcount {
                    OvercountPolicy::Clamp => warn!(
                        "Controller completed {n} packets for {hdl} with {} outstanding",
                        pend.count
                    ),
                    OvercountPolicy::Panic => panic!(
                        "controller completed {n} packets for {hdl} with {} outstanding",
                        pend.count
                    ),
                }
                n = pend.count;
            }
            pend.count -= n;
            match self.pool(pend.link) {
                LinkType::BrEdr => bredr += n,
                LinkType::Le => le += n,
            }
            if pend.count == 0 {
                tx.pending.remove(&hdl);
            }
        }
        assert!(
            bredr <= tx.bredr_sent && le <= tx.le_sent,
            "ACL data buffer credit underflow"
        );
        tx.bredr_sent -= bredr;
        tx.le_sent -= le;
        trace!("Completed {bredr} BR/EDR and {le} LE packets");
        self.try_send(&mut tx);
    }

    async fn read_loop(inner: Arc<Self>, ready: Arc<Notify>, c: CancellationToken) {
        debug!("ACL data read loop started");
        let mut buf = vec![0; ACL_BUF];
        loop {
            tokio::select! {
                _ = ready.notified() => {}
                _ = c.cancelled() => break,
            }
            inner.read_packets(&mut buf);
        }
        debug!("ACL data read loop terminating");
    }

    /// Receives all available data packets.
    fn read_packets(&self, buf: &mut [u8]) {
        loop {
            let n = match self.chan.read(buf) {
                Ok(n) => n,
                Err(host::Error::WouldBlock) => return,
                Err(host::Error::TooLarge(n)) => {
                    warn!("Dropped oversized ACL data packet ({n} bytes)");
                    continue;
                }
                Err(e) => {
                    error!("ACL data read error: {e}");
                    return;
                }
            };
            if n < ACL_HDR {
                error!("ACL data packet with missing header: {:02X?}", &buf[..n]);
                return;
            }
            match AclPacket::parse(buf[..n].to_vec()) {
                Ok(pkt) => self.deliver(pkt),
                Err(e) => warn!("Dropped ACL data packet: {e}"),
            }
        }
    }

    /// Posts a received packet to the data handler.
    fn deliver(&self, pkt: AclPacket) {
        trace!("ACL data received: {:02X?}", pkt.as_ref());
        let rx = Arc::clone(&self.rx);
        self.dispatcher.post(Box::new(move || match rx.lock().as_mut() {
            Some(f) => f(pkt),
            None => trace!("Dropped ACL data packet for {} (no handler)", pkt.handle()),
        }));
    }
}

impl Debug for Inner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("chan", &self.chan)
            .field("bredr", &self.bredr)
            .field("le", &self.le)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

/// Transmit state protected by a single lock.
#[derive(Debug, Default)]
struct TxState {
    initialized: bool,
    queue: SendQueue,
    links: HashMap<ConnHandle, LinkType>,
    pending: HashMap<ConnHandle, Pending>,
    bredr_sent: usize,
    le_sent: usize,
}

impl TxState {
    #[inline]
    fn sent_mut(&mut self, pool: LinkType) -> &mut usize {
        match pool {
            LinkType::BrEdr => &mut self.bredr_sent,
            LinkType::Le => &mut self.le_sent,
        }
    }
}

/// Packets sent to one connection that were not yet completed.
#[derive(Clone, Copy, Debug)]
struct Pending {
    link: LinkType,
    count: usize,
}
