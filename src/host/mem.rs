use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

use super::*;

/// Returns two connected in-memory channel endpoints. The first one is meant
/// for the host and the second one for a simulated controller.
#[must_use]
pub fn pair() -> (MemChannel, MemChannel) {
    let (a, b) = (Arc::new(Pipe::default()), Arc::new(Pipe::default()));
    (
        MemChannel {
            tx: Arc::clone(&a),
            rx: Arc::clone(&b),
            fault: Arc::default(),
        },
        MemChannel {
            tx: b,
            rx: a,
            fault: Arc::default(),
        },
    )
}

/// In-memory [`Channel`] endpoint.
pub struct MemChannel {
    tx: Arc<Pipe>,
    rx: Arc<Pipe>,
    fault: Arc<parking_lot::Mutex<Faults>>,
}

impl MemChannel {
    /// Sends a packet to the peer endpoint.
    #[inline]
    pub fn send(&self, pkt: impl AsRef<[u8]>) -> Result<()> {
        self.tx.push(pkt.as_ref())
    }

    /// Returns the next packet sent by the peer or `None` if there are no
    /// packets available.
    #[inline]
    #[must_use]
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.queue.lock().packets.pop_front()
    }

    /// Returns the number of packets sent by the peer that were not yet
    /// received.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.queue.lock().packets.len()
    }

    /// Causes the next `n` writes to fail with error `e`.
    #[inline]
    pub fn fail_writes(&self, n: usize, e: Error) {
        let mut f = self.fault.lock();
        f.write = (n > 0).then_some((n, e));
    }

    /// Causes the next `watch()` call to fail with error `e`.
    #[inline]
    pub fn fail_watch(&self, e: Error) {
        self.fault.lock().watch = Some(e);
    }

    /// Closes both directions of the channel.
    pub fn close(&self) {
        self.tx.queue.lock().closed = true;
        self.rx.queue.lock().closed = true;
        self.tx.notify.notify_one();
        self.rx.notify.notify_one();
    }
}

impl Channel for MemChannel {
    fn write(&self, pkt: &[u8]) -> Result<()> {
        {
            let mut f = self.fault.lock();
            if let Some((n, e)) = f.write {
                f.write = (n > 1).then_some((n - 1, e));
                return Err(e);
            }
        }
        self.tx.push(pkt)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut q = self.rx.queue.lock();
        let Some(pkt) = q.packets.front() else {
            return Err(if q.closed { Error::Closed } else { Error::WouldBlock });
        };
        if pkt.len() > buf.len() {
            let n = pkt.len();
            q.packets.pop_front();
            return Err(Error::TooLarge(n));
        }
        let n = pkt.len();
        buf[..n].copy_from_slice(pkt);
        q.packets.pop_front();
        Ok(n)
    }

    fn watch(&self) -> Result<Arc<Notify>> {
        if let Some(e) = self.fault.lock().watch.take() {
            return Err(e);
        }
        let mut q = self.rx.queue.lock();
        q.watched = true;
        if !q.packets.is_empty() {
            self.rx.notify.notify_one();
        }
        Ok(Arc::clone(&self.rx.notify))
    }

    fn unwatch(&self) {
        self.rx.queue.lock().watched = false;
    }
}

impl Debug for MemChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let q = self.rx.queue.lock();
        f.debug_struct("MemChannel")
            .field("pending", &q.packets.len())
            .field("watched", &q.watched)
            .field("closed", &q.closed)
            .finish()
    }
}

/// One direction of a channel pair.
#[derive(Debug, Default)]
struct Pipe {
    queue: parking_lot::Mutex<PipeQueue>,
    notify: Arc<Notify>,
}

impl Pipe {
    /// Appends a packet and notifies the reader.
    fn push(&self, pkt: &[u8]) -> Result<()> {
        let mut q = self.queue.lock();
        if q.closed {
            return Err(Error::Closed);
        }
        trace!("Channel write: {pkt:02X?}");
        q.packets.push_back(pkt.to_vec());
        drop(q);
        self.notify.notify_one();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PipeQueue {
    packets: VecDeque<Vec<u8>>,
    watched: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct Faults {
    write: Option<(usize, Error)>,
    watch: Option<Error>,
}
