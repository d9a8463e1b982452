use std::sync::atomic::{AtomicUsize, Ordering};

use matches::assert_matches;

use crate::host::{self, ManualDispatcher, MemChannel};

use super::*;

/// Event source that delivers events synchronously to registered handlers.
#[derive(Default)]
struct FakeEvents {
    handlers: Mutex<Vec<(HandlerId, EventCode, EventCallback)>>,
}

impl FakeEvents {
    fn emit(&self, evt: EventPacket) {
        let EventType::Hci(code) = evt.typ() else {
            return;
        };
        for (_, c, f) in self.handlers.lock().iter_mut() {
            if *c == code {
                f(evt.clone());
            }
        }
    }

    fn count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl Debug for FakeEvents {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeEvents")
            .field("handlers", &self.count())
            .finish()
    }
}

impl EventSource for FakeEvents {
    fn add_event_handler(&self, code: EventCode, f: EventCallback) -> Result<HandlerId> {
        let id = HandlerId::next();
        self.handlers.lock().push((id, code, f));
        Ok(id)
    }

    fn add_le_meta_event_handler(
        &self,
        code: SubeventCode,
        _: EventCallback,
    ) -> Result<HandlerId> {
        Err(Error::HandlerConflict(EventType::Le(code)))
    }

    fn remove_event_handler(&self, id: HandlerId) {
        self.handlers.lock().retain(|h| h.0 != id);
    }

    fn send_command(
        &self,
        _: CommandPacket,
        _: EventCode,
        _: CommandCallback,
    ) -> Result<TransactionId> {
        Err(Error::NotInitialized)
    }
}

struct Fixture {
    ch: AclDataChannel,
    ctl: MemChannel,
    ev: Arc<FakeEvents>,
    d: Arc<ManualDispatcher>,
}

impl Fixture {
    fn new(bredr: BufferInfo, le: BufferInfo) -> Self {
        Self::with_config(bredr, le, AclConfig::default())
    }

    fn with_config(bredr: BufferInfo, le: BufferInfo, cfg: AclConfig) -> Self {
        let (host, ctl) = host::pair();
        Self::with_channel(host, ctl, bredr, le, cfg)
    }

    fn with_channel(
        host: MemChannel,
        ctl: MemChannel,
        bredr: BufferInfo,
        le: BufferInfo,
        cfg: AclConfig,
    ) -> Self {
        let ev = Arc::new(FakeEvents::default());
        let d = ManualDispatcher::new();
        let events: Arc<dyn EventSource> = ev.clone();
        let ch = AclDataChannel::new(host, events, bredr, le, Arc::clone(&d) as _, cfg);
        ch.initialize().unwrap();
        Self { ch, ctl, ev, d }
    }

    /// Returns the first payload byte of all packets sent since the last
    /// call.
    fn sent(&self) -> Vec<u8> {
        std::iter::from_fn(|| self.ctl.try_recv())
            .map(|p| AclPacket::parse(p).unwrap().payload()[0])
            .collect()
    }

    fn send(&self, h: u16, v: u8) {
        (self.ch.send_packet(pkt(h, v), 0x40, Priority::Low)).unwrap();
    }
}

fn hdl(v: u16) -> ConnHandle {
    ConnHandle::new(v).unwrap()
}

fn pkt(h: u16, v: u8) -> AclPacket {
    AclPacket::new(hdl(h), BoundaryFlag::FirstFlushable, &[v])
}

fn nocp(entries: &[(u16, u16)]) -> EventPacket {
    let n = entries.len() as u8;
    let mut raw = vec![EventCode::NumberOfCompletedPackets as u8, 1 + 4 * n, n];
    for &(h, c) in entries {
        raw.extend_from_slice(&h.to_le_bytes());
        raw.extend_from_slice(&c.to_le_bytes());
    }
    EventPacket::parse(raw).unwrap()
}

const BREDR: BufferInfo = BufferInfo::new(5, 5);
const NONE: BufferInfo = BufferInfo::new(0, 0);

#[tokio::test]
async fn flow_control() {
    let f = Fixture::new(BREDR, NONE);
    assert_eq!(f.ev.count(), 2);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(2), LinkType::BrEdr);
    for i in 0..10 {
        f.send(1 + u16::from(i % 2), i);
    }
    assert_eq!(f.sent(), [0, 1, 2, 3, 4]);
    assert_eq!(f.ch.pending_packets(hdl(1)), 3);
    assert_eq!(f.ch.pending_packets(hdl(2)), 2);
    assert_eq!(f.ch.queued_packets(), 5);

    f.ev.emit(nocp(&[(1, 3), (2, 2)]));
    assert_eq!(f.sent(), [5, 6, 7, 8, 9]);
    assert_eq!(f.ch.pending_packets(hdl(1)), 2);
    assert_eq!(f.ch.pending_packets(hdl(2)), 3);
    assert_eq!(f.ch.queued_packets(), 0);
}

#[tokio::test]
async fn drop_queued_packets() {
    let f = Fixture::new(BREDR, NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(2), LinkType::BrEdr);
    for i in 0..10 {
        f.send(1 + u16::from(i % 2), i);
    }
    f.sent();
    let n = f.ch.drop_queued_packets(|p| p.handle() == hdl(2));
    assert_eq!(n, 3);
    assert_eq!(f.ch.queued_packets(), 2);
    assert_eq!(f.ch.pending_packets(hdl(2)), 2);

    f.ev.emit(nocp(&[(1, 3), (2, 2)]));
    assert_eq!(f.sent(), [6, 8]);
}

#[tokio::test]
#[should_panic(expected = "already registered")]
async fn duplicate_link() {
    let f = Fixture::new(BREDR, NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(1), LinkType::Le);
}

#[tokio::test]
async fn priority() {
    let f = Fixture::new(BufferInfo::new(5, 1), NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.send(1, 0);
    f.send(1, 1);
    f.send(1, 2);
    (f.ch.send_packet(pkt(1, 3), 0x01, Priority::High)).unwrap();
    assert_eq!(f.sent(), [0]);
    for v in [3, 1, 2] {
        f.ev.emit(nocp(&[(1, 1)]));
        assert_eq!(f.sent(), [v]);
    }
}

#[tokio::test]
async fn unregister_link() {
    let f = Fixture::new(BufferInfo::new(5, 2), NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(2), LinkType::BrEdr);
    f.send(1, 0);
    f.send(1, 1);
    f.send(1, 2);
    f.send(2, 3);
    assert_eq!(f.sent(), [0, 1]);

    f.ch.unregister_link(hdl(1));
    assert_eq!(f.ch.queued_packets(), 1);
    assert_eq!(f.ch.pending_packets(hdl(1)), 2);
    assert_matches!(
        f.ch.send_packet(pkt(1, 4), 0, Priority::Low),
        Err(Error::UnknownLink(h)) if h == hdl(1)
    );
    // Unknown handles are ignored
    f.ch.unregister_link(hdl(1));

    // The controller still reports completion of sent packets
    f.ev.emit(nocp(&[(1, 1)]));
    assert_eq!(f.sent(), [3]);
    assert_eq!(f.ch.pending_packets(hdl(1)), 1);
}

#[tokio::test]
async fn clear_controller_packet_count() {
    let f = Fixture::new(BufferInfo::new(5, 2), NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(2), LinkType::BrEdr);
    f.send(1, 0);
    f.send(1, 1);
    f.send(2, 2);
    assert_eq!(f.sent(), [0, 1]);

    f.ch.unregister_link(hdl(1));
    f.ch.clear_controller_packet_count(hdl(1));
    assert_eq!(f.ch.pending_packets(hdl(1)), 0);
    assert_eq!(f.sent(), [2]);
    // Nothing left to clear
    f.ch.clear_controller_packet_count(hdl(1));
}

#[tokio::test]
#[should_panic(expected = "registered")]
async fn clear_registered_link() {
    let f = Fixture::new(BREDR, NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.clear_controller_packet_count(hdl(1));
}

#[tokio::test]
async fn completed_unknown_handle() {
    let f = Fixture::new(BufferInfo::new(5, 1), NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.send(1, 0);
    f.send(1, 1);
    f.sent();
    f.ev.emit(nocp(&[(2, 1), (0xFFF, 1)]));
    assert!(f.sent().is_empty());
    f.ev.emit(nocp(&[(2, 1), (1, 1)]));
    assert_eq!(f.sent(), [1]);
}

#[tokio::test]
async fn completed_overcount_clamp() {
    let f = Fixture::new(BufferInfo::new(5, 2), NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(2), LinkType::BrEdr);
    f.send(1, 0);
    f.send(2, 1);
    f.send(2, 2);
    f.sent();
    f.ev.emit(nocp(&[(1, 3)]));
    assert_eq!(f.ch.pending_packets(hdl(1)), 0);
    assert_eq!(f.sent(), [2]);
    assert_eq!(f.ch.pending_packets(hdl(2)), 2);
}

#[tokio::test]
#[should_panic(expected = "outstanding")]
async fn completed_overcount_panic() {
    let cfg = AclConfig {
        overcount: OvercountPolicy::Panic,
        ..AclConfig::default()
    };
    let f = Fixture::with_config(BREDR, NONE, cfg);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.send(1, 0);
    f.ev.emit(nocp(&[(1, 2)]));
}

#[tokio::test]
async fn completed_malformed() {
    let f = Fixture::new(BufferInfo::new(5, 2), NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(2), LinkType::BrEdr);
    f.send(1, 0);
    f.send(2, 1);
    f.send(1, 2);
    f.sent();
    // Two handles declared, one entry present
    let raw = vec![EventCode::NumberOfCompletedPackets as u8, 5, 2, 1, 0, 1, 0];
    f.ev.emit(EventPacket::parse(raw).unwrap());
    assert_eq!(f.ch.pending_packets(hdl(1)), 1);
    assert_eq!(f.ch.pending_packets(hdl(2)), 1);
    assert_eq!(f.sent(), [2]);
}

#[tokio::test]
#[should_panic(expected = "overflow")]
async fn buffer_overflow() {
    let f = Fixture::new(BREDR, NONE);
    let raw = vec![EventCode::DataBufferOverflow as u8, 1, 0x01];
    f.ev.emit(EventPacket::parse(raw).unwrap());
}

#[tokio::test]
async fn send_errors() {
    let f = Fixture::new(BREDR, BufferInfo::new(3, 2));
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(2), LinkType::Le);
    assert_matches!(
        f.ch.send_packets(Vec::new(), 0, Priority::Low),
        Err(Error::EmptyBatch)
    );
    let long = AclPacket::new(hdl(2), BoundaryFlag::FirstFlushable, &[0; 4]);
    assert_matches!(
        f.ch.send_packet(long, 0, Priority::Low),
        Err(Error::PacketTooLong { len: 4, mtu: 3 })
    );
    let ok = AclPacket::new(hdl(1), BoundaryFlag::FirstFlushable, &[0; 4]);
    assert!(f.ch.send_packet(ok, 0, Priority::Low).is_ok());
    assert_matches!(
        f.ch.send_packet(pkt(3, 0), 0, Priority::Low),
        Err(Error::UnknownLink(_))
    );
    assert_eq!(f.ch.queued_packets(), 0);

    f.ch.shut_down();
    assert!(!f.ch.is_initialized());
    assert_eq!(f.ev.count(), 0);
    assert_matches!(
        f.ch.send_packet(pkt(1, 0), 0, Priority::Low),
        Err(Error::NotInitialized)
    );
}

#[tokio::test]
#[should_panic(expected = "other connections")]
async fn mixed_batch() {
    let f = Fixture::new(BREDR, NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    let _ = f.ch.send_packets(vec![pkt(1, 0), pkt(2, 1)], 0, Priority::Low);
}

#[tokio::test]
#[should_panic(expected = "continuing fragment")]
async fn continuing_batch() {
    let f = Fixture::new(BREDR, NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    let p = AclPacket::new(hdl(1), BoundaryFlag::ContinuingFragment, &[0]);
    let _ = f.ch.send_packet(p, 0, Priority::Low);
}

#[tokio::test]
async fn fragmented_batch() {
    let f = Fixture::new(BufferInfo::new(5, 2), NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    let frag = |b, v| AclPacket::new(hdl(1), b, &[v]);
    let pkts = vec![
        frag(BoundaryFlag::FirstNonFlushable, 0),
        frag(BoundaryFlag::ContinuingFragment, 1),
        frag(BoundaryFlag::ContinuingFragment, 2),
    ];
    (f.ch.send_packets(pkts, 0x40, Priority::Low)).unwrap();
    assert_eq!(f.sent(), [0, 1]);
    f.ev.emit(nocp(&[(1, 2)]));
    assert_eq!(f.sent(), [2]);
}

#[tokio::test]
async fn separate_le_buffer() {
    let f = Fixture::new(BufferInfo::new(5, 1), BufferInfo::new(5, 1));
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(2), LinkType::Le);
    f.send(1, 0);
    f.send(1, 1);
    f.send(2, 2);
    f.send(2, 3);
    assert_eq!(f.sent(), [0, 2]);
    f.ev.emit(nocp(&[(2, 1)]));
    assert_eq!(f.sent(), [3]);
    f.ev.emit(nocp(&[(1, 1)]));
    assert_eq!(f.sent(), [1]);
}

#[tokio::test]
async fn shared_le_buffer() {
    let f = Fixture::new(BufferInfo::new(5, 2), NONE);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.ch.register_link(hdl(2), LinkType::Le);
    f.send(2, 0);
    f.send(1, 1);
    f.send(2, 2);
    assert_eq!(f.sent(), [0, 1]);
    f.ev.emit(nocp(&[(2, 1)]));
    assert_eq!(f.sent(), [2]);
}

#[tokio::test]
async fn le_only() {
    let f = Fixture::new(NONE, BufferInfo::new(5, 1));
    f.ch.register_link(hdl(1), LinkType::Le);
    f.ch.register_link(hdl(2), LinkType::BrEdr);
    // BR/EDR links have no buffer to send to
    assert_matches!(
        f.ch.send_packet(pkt(2, 0), 0, Priority::Low),
        Err(Error::NoBuffer(h)) if h == hdl(2)
    );
    let empty = AclPacket::new(hdl(2), BoundaryFlag::FirstFlushable, &[]);
    assert_matches!(
        f.ch.send_packet(empty, 0, Priority::Low),
        Err(Error::NoBuffer(_))
    );
    f.send(1, 1);
    f.send(1, 2);
    assert_eq!(f.sent(), [1]);
    assert_eq!(f.ch.queued_packets(), 1);
}

#[tokio::test]
async fn channel_overflow() {
    let cfg = AclConfig {
        max_queued_per_channel: 2,
        ..AclConfig::default()
    };
    let f = Fixture::with_config(BufferInfo::new(5, 1), NONE, cfg);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    for v in 0..5 {
        f.send(1, v);
    }
    assert_eq!(f.sent(), [0]);
    assert_eq!(f.ch.queued_packets(), 2);
    f.ev.emit(nocp(&[(1, 1)]));
    assert_eq!(f.sent(), [3]);
}

#[tokio::test]
async fn write_failure() {
    let (host, ctl) = host::pair();
    host.fail_writes(1, host::Error::Io(std::io::ErrorKind::Other));
    let cfg = AclConfig::default();
    let f = Fixture::with_channel(host, ctl, BufferInfo::new(5, 2), NONE, cfg);
    f.ch.register_link(hdl(1), LinkType::BrEdr);
    f.send(1, 0);
    f.send(1, 1);
    assert_eq!(f.sent(), [1]);
    assert_eq!(f.ch.pending_packets(hdl(1)), 1);
    f.send(1, 2);
    assert_eq!(f.sent(), [2]);
}

#[tokio::test]
async fn receive() {
    let f = Fixture::new(BREDR, NONE);
    let n = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&n);
    f.ch.set_data_rx_handler(move |p| {
        assert_eq!(p.handle(), hdl(1));
        assert_eq!(p.payload(), &[1, 2, 3]);
        c.fetch_add(1, Ordering::Relaxed);
    });
    let good = AclPacket::new(hdl(1), BoundaryFlag::FirstFlushable, &[1, 2, 3]);
    f.ctl.send(good.as_ref()).unwrap();
    // Length mismatch
    f.ctl.send([0x01_u8, 0x20, 0x05, 0x00, 1, 2, 3]).unwrap();
    f.ctl.send(good.as_ref()).unwrap();
    // Missing header ends the read pass
    f.ctl.send([0x01_u8, 0x20]).unwrap();
    f.ctl.send(good.as_ref()).unwrap();

    let mut buf = vec![0; ACL_BUF];
    f.ch.0.read_packets(&mut buf);
    assert_eq!(f.d.run_all(), 2);
    assert_eq!(n.load(Ordering::Relaxed), 2);
    f.ch.0.read_packets(&mut buf);
    assert_eq!(f.d.run_all(), 1);
    assert_eq!(n.load(Ordering::Relaxed), 3);
}
