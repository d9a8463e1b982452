//! Host transport layer ([Vol 4] Parts A-D).
//!
//! The engines in [`crate::hci`] do not perform any I/O of their own. They
//! write complete packets to a [`Channel`], are woken up when the channel
//! becomes readable, and deliver all completions through a [`Dispatcher`].

use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::{trace, warn};

pub use mem::*;

#[cfg(test)]
pub(crate) use tests::ManualDispatcher;

mod mem;

#[cfg(test)]
mod tests;

/// Local host errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("channel closed")]
    Closed,
    #[error("operation would block")]
    WouldBlock,
    #[error("channel is not being watched")]
    Unwatched,
    #[error("packet too large ({0} bytes)")]
    TooLarge(usize),
    #[error("i/o error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl Error {
    /// Returns whether the operation should be retried after the next
    /// readiness notification.
    #[inline]
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(*self, Self::WouldBlock)
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock => Self::WouldBlock,
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => Self::Closed,
            kind => Self::Io(kind),
        }
    }
}

/// Common host result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Full-duplex, packet-oriented channel to the controller. Each `read` and
/// `write` call transfers exactly one complete HCI packet without the UART
/// packet indicator ([Vol 4] Part A, Section 2).
pub trait Channel: Debug + Send + Sync {
    /// Writes one complete packet without blocking.
    fn write(&self, pkt: &[u8]) -> Result<()>;

    /// Reads the next packet into `buf`, returning its length. Returns
    /// [`Error::WouldBlock`] if no packets are available.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Starts readiness notification. The returned [`Notify`] is signaled with
    /// `notify_one()` whenever new packets become available to `read`.
    fn watch(&self) -> Result<Arc<Notify>>;

    /// Stops readiness notification.
    fn unwatch(&self);
}

/// Deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Execution context used to deliver completions. Engines never invoke user
/// callbacks from within the call stack that produced the completion.
pub trait Dispatcher: Debug + Send + Sync {
    /// Schedules `task` for execution. Tasks must run in the order in which
    /// they were posted.
    fn post(&self, task: Task);
}

impl Dispatcher for mpsc::UnboundedSender<Task> {
    #[inline]
    fn post(&self, task: Task) {
        if self.send(task).is_err() {
            warn!("Task dropped (dispatcher closed)");
        }
    }
}

/// Ordered task queue executed by a single Tokio task.
#[derive(Debug)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl TaskQueue {
    /// Spawns a task queue on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    #[must_use]
    pub fn spawn() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            trace!("Task queue started");
            while let Some(task) = rx.recv().await {
                task();
            }
            trace!("Task queue terminating");
        });
        Arc::new(Self { tx })
    }
}

impl Dispatcher for TaskQueue {
    #[inline]
    fn post(&self, task: Task) {
        self.tx.post(task);
    }
}
