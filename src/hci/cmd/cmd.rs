//! HCI command transaction engine ([Vol 4] Part E, Section 4.4).
//!
//! Commands are queued with a completion callback and sent to the controller
//! as `Num_HCI_Command_Packets` credits allow. A command is complete when the
//! controller reports `CommandStatus` or `CommandComplete` for its opcode or,
//! for asynchronous commands, when the designated completion event arrives.
//! Every transaction callback is invoked exactly once, either with the
//! controller event or with a synthetic [`Error::CommandAborted`] result when
//! the transaction is dropped without one.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::mem;
use std::num::NonZeroU64;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace, warn};

use crate::host::{self, Channel, Dispatcher};

use super::*;

mod hci_control;
mod info_params;
mod le;

#[cfg(test)]
mod tests;

/// Command completion callback.
pub type CommandCallback = Box<dyn FnOnce(TransactionId, Result<EventPacket>) + Send>;

/// Event handler callback.
pub type EventCallback = Box<dyn FnMut(EventPacket) -> CallbackResult + Send>;

/// Command timeout callback.
pub type TimeoutHandler = Arc<dyn Fn(Opcode) + Send + Sync>;

/// Event handler return value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CallbackResult {
    /// Keep the handler registered.
    #[default]
    Continue,
    /// Unregister the handler after this call.
    Remove,
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $next:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        #[repr(transparent)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Returns the raw identifier value.
            #[inline(always)]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0.get()
            }

            /// Allocates the next process-unique identifier. Zero is skipped
            /// when the counter wraps.
            pub(crate) fn next() -> Self {
                static $next: AtomicU64 = AtomicU64::new(1);
                loop {
                    if let Some(id) = NonZeroU64::new($next.fetch_add(1, Ordering::Relaxed)) {
                        return Self(id);
                    }
                }
            }
        }
    };
}

id_type!(
    /// Command transaction identifier.
    TransactionId,
    NEXT_TRANSACTION_ID
);

id_type!(
    /// Event handler identifier.
    HandlerId,
    NEXT_HANDLER_ID
);

/// Action taken when a dispatched command is not completed in time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[non_exhaustive]
pub enum TimeoutPolicy {
    /// Fail the expired transaction with [`Error::CommandTimeout`] and notify
    /// the timeout handler.
    #[default]
    Report,
    /// Fail the expired transaction, notify the timeout handler, and shut
    /// down the command channel.
    ShutDown,
}

/// Command channel configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Maximum time between sending a command and receiving its
    /// `CommandStatus` or `CommandComplete` event.
    pub timeout: Duration,
    /// Expired command handling.
    pub on_timeout: TimeoutPolicy,
}

impl Default for CommandConfig {
    #[inline]
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            on_timeout: TimeoutPolicy::Report,
        }
    }
}

/// Command and event subscription service consumed by other engines.
pub trait EventSource: Debug + Send + Sync {
    /// Registers a handler for events with the specified code.
    fn add_event_handler(&self, code: EventCode, f: EventCallback) -> Result<HandlerId>;

    /// Registers a handler for LE meta events with the specified subevent
    /// code.
    fn add_le_meta_event_handler(&self, code: SubeventCode, f: EventCallback)
        -> Result<HandlerId>;

    /// Unregisters an event handler.
    fn remove_event_handler(&self, id: HandlerId);

    /// Queues a command that completes with the specified event.
    fn send_command(
        &self,
        cmd: CommandPacket,
        complete: EventCode,
        f: CommandCallback,
    ) -> Result<TransactionId>;
}

/// Owner of the HCI command channel. Initialization and shutdown are only
/// available through this `!Send` handle, while [`Commands`] handles obtained
/// from it can be used concurrently from any context.
#[derive(Debug)]
pub struct CommandChannel {
    cmds: Commands,
    _not_send: PhantomData<*const ()>,
}

impl CommandChannel {
    /// Creates an uninitialized command channel that takes ownership of the
    /// controller transport. All callbacks are delivered through `d`.
    #[must_use]
    pub fn new(chan: impl Channel + 'static, d: Arc<dyn Dispatcher>, cfg: CommandConfig) -> Self {
        Self {
            cmds: Commands(Arc::new(Inner {
                chan: Box::new(chan),
                dispatcher: d,
                cfg,
                io: Mutex::default(),
                queue: Mutex::default(),
                events: Mutex::default(),
                on_timeout: Mutex::default(),
            })),
            _not_send: PhantomData,
        }
    }

    /// Starts receiving events from the controller. A failure to watch the
    /// transport is returned, but the channel remains initialized for sending
    /// commands.
    ///
    /// # Panics
    ///
    /// Panics if the channel is already initialized or if called outside of a
    /// Tokio runtime.
    pub fn initialize(&self) -> Result<()> {
        self.cmds.0.initialize()
    }

    /// Stops receiving events, fails all queued and pending transactions, and
    /// unregisters all event handlers.
    #[inline]
    pub fn shut_down(&self) {
        self.cmds.0.shut_down();
    }

    /// Sets the handler that is notified about command timeouts.
    pub fn set_timeout_handler(&self, f: impl Fn(Opcode) + Send + Sync + 'static) {
        *self.cmds.0.on_timeout.lock() = Some(Arc::new(f));
    }

    /// Returns a shareable command channel handle.
    #[inline]
    #[must_use]
    pub fn commands(&self) -> Commands {
        self.cmds.clone()
    }
}

impl Deref for CommandChannel {
    type Target = Commands;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.cmds
    }
}

impl Drop for CommandChannel {
    #[inline]
    fn drop(&mut self) {
        self.cmds.0.shut_down();
    }
}

/// Shareable command channel handle.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct Commands(Arc<Inner>);

impl Commands {
    /// Queues a command that is complete when `complete` event is received.
    /// For synchronous commands this is either `CommandComplete` or
    /// `CommandStatus`. For asynchronous commands, `CommandStatus` with a
    /// failure status also completes the transaction.
    ///
    /// The callback is not invoked if an error is returned.
    ///
    /// # Panics
    ///
    /// Panics if `complete` is `LeMetaEvent`. Use
    /// [`Self::send_le_async_command`] instead.
    #[inline]
    pub fn send_command(
        &self,
        cmd: CommandPacket,
        complete: EventCode,
        f: impl FnOnce(TransactionId, Result<EventPacket>) + Send + 'static,
    ) -> Result<TransactionId> {
        self.0.queue(cmd, EventType::Hci(complete), &[], Box::new(f))
    }

    /// Queues a command that will not be sent while any command with an
    /// opcode in `exclusions` is pending.
    ///
    /// # Panics
    ///
    /// Panics if `complete` is `LeMetaEvent`.
    #[inline]
    pub fn send_exclusive_command(
        &self,
        cmd: CommandPacket,
        complete: EventCode,
        exclusions: &[Opcode],
        f: impl FnOnce(TransactionId, Result<EventPacket>) + Send + 'static,
    ) -> Result<TransactionId> {
        self.0.queue(cmd, EventType::Hci(complete), exclusions, Box::new(f))
    }

    /// Queues an asynchronous LE command that is complete when an LE meta
    /// event with the `complete` subevent code is received.
    #[inline]
    pub fn send_le_async_command(
        &self,
        cmd: CommandPacket,
        complete: SubeventCode,
        f: impl FnOnce(TransactionId, Result<EventPacket>) + Send + 'static,
    ) -> Result<TransactionId> {
        self.0.queue(cmd, EventType::Le(complete), &[], Box::new(f))
    }

    /// Sends a command and returns its completion event. The caller must check
    /// the completion status to determine whether the command was successful.
    pub async fn exec(&self, cmd: CommandPacket, complete: EventCode) -> Result<EventPacket> {
        let opcode = cmd.opcode();
        let (tx, rx) = oneshot::channel();
        self.send_command(cmd, complete, move |_, r| {
            let _ignore_closed = tx.send(r);
        })?;
        rx.await.map_err(|_| Error::CommandAborted {
            opcode,
            status: Status::UnspecifiedError,
        })?
    }

    /// Executes a command with `CommandComplete` completion and returns the
    /// event if the command was successful.
    pub(super) async fn exec_ok(&self, cmd: CommandPacket) -> Result<EventPacket> {
        let opcode = cmd.opcode();
        let evt = self.exec(cmd, EventCode::CommandComplete).await?;
        evt.cmd_ok().map_err(|e| {
            error!("{opcode} error: {e}");
            e
        })?;
        Ok(evt)
    }

    /// Removes a command that was not yet sent to the controller. The
    /// callback is dropped without being invoked. Returns whether the command
    /// was found.
    pub fn remove_queued_command(&self, id: TransactionId) -> bool {
        self.0.remove_queued_command(id)
    }

    /// Registers a handler for events with the specified code. Multiple
    /// handlers may be registered for the same code.
    #[inline]
    pub fn add_event_handler(
        &self,
        code: EventCode,
        f: impl FnMut(EventPacket) -> CallbackResult + Send + 'static,
    ) -> Result<HandlerId> {
        self.0.add_event_handler(EventType::Hci(code), Box::new(f))
    }

    /// Registers a handler for LE meta events with the specified subevent
    /// code.
    #[inline]
    pub fn add_le_meta_event_handler(
        &self,
        code: SubeventCode,
        f: impl FnMut(EventPacket) -> CallbackResult + Send + 'static,
    ) -> Result<HandlerId> {
        self.0.add_event_handler(EventType::Le(code), Box::new(f))
    }

    /// Unregisters an event handler. Unknown identifiers and handlers owned by
    /// asynchronous commands are ignored.
    #[inline]
    pub fn remove_event_handler(&self, id: HandlerId) {
        self.0.remove_event_handler(id);
    }

    /// Returns the number of commands that the controller can currently
    /// accept.
    #[inline]
    #[must_use]
    pub fn allowed_command_packets(&self) -> u8 {
        self.0.events.lock().cmd_quota
    }

    /// Returns whether the channel is initialized.
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.0.io.lock().is_some()
    }
}

impl EventSource for Commands {
    #[inline]
    fn add_event_handler(&self, code: EventCode, f: EventCallback) -> Result<HandlerId> {
        self.0.add_event_handler(EventType::Hci(code), f)
    }

    #[inline]
    fn add_le_meta_event_handler(
        &self,
        code: SubeventCode,
        f: EventCallback,
    ) -> Result<HandlerId> {
        self.0.add_event_handler(EventType::Le(code), f)
    }

    #[inline]
    fn remove_event_handler(&self, id: HandlerId) {
        self.0.remove_event_handler(id);
    }

    #[inline]
    fn send_command(
        &self,
        cmd: CommandPacket,
        complete: EventCode,
        f: CommandCallback,
    ) -> Result<TransactionId> {
        self.0.queue(cmd, EventType::Hci(complete), &[], f)
    }
}

/// Shared command channel state. Locks are always acquired in the order
/// `queue`, `events`. The `io` lock is never held while acquiring another one.
struct Inner {
    chan: Box<dyn Channel>,
    dispatcher: Arc<dyn Dispatcher>,
    cfg: CommandConfig,
    io: Mutex<Option<Io>>,
    queue: Mutex<VecDeque<QueuedCommand>>,
    events: Mutex<EventState>,
    on_timeout: Mutex<Option<TimeoutHandler>>,
}

/// Runtime state of an initialized channel. Dropping it stops the read loop.
#[derive(Debug)]
struct Io {
    rt: tokio::runtime::Handle,
    _guard: DropGuard,
}

impl Inner {
    fn initialize(self: &Arc<Self>) -> Result<()> {
        let mut io = self.io.lock();
        assert!(io.is_none(), "command channel already initialized");
        let rt = tokio::runtime::Handle::current();
        let cancel = CancellationToken::new();
        let r = match self.chan.watch() {
            Ok(ready) => {
                rt.spawn(Self::read_loop(Arc::clone(self), ready, cancel.clone()));
                Ok(())
            }
            Err(e) => {
                error!("Failed to watch command channel: {e}");
                Err(Error::Host(e))
            }
        };
        *io = Some(Io {
            rt,
            _guard: cancel.drop_guard(),
        });
        debug!("Command channel initialized");
        r
    }

    fn shut_down(&self) {
        let (queue, pending, awaiting) = {
            let mut q = self.queue.lock();
            let Some(io) = self.io.lock().take() else {
                return;
            };
            drop(io);
            debug!("Command channel shutting down");
            self.chan.unwatch();
            let mut ev = self.events.lock();
            ev.handlers.clear();
            ev.cmd_quota = 1;
            (
                mem::take(&mut *q),
                mem::take(&mut ev.pending),
                mem::take(&mut ev.awaiting),
            )
        };
        // Dropping transactions posts their synthetic results
        drop(queue);
        drop(pending);
        drop(awaiting);
    }

    /// Returns the runtime of an initialized channel.
    #[inline]
    fn runtime(&self) -> Option<tokio::runtime::Handle> {
        self.io.lock().as_ref().map(|io| io.rt.clone())
    }

    /// Validates and queues a new command transaction.
    fn queue(
        self: &Arc<Self>,
        cmd: CommandPacket,
        complete: EventType,
        exclusions: &[Opcode],
        f: CommandCallback,
    ) -> Result<TransactionId> {
        assert_ne!(
            complete,
            EventType::Hci(EventCode::LeMetaEvent),
            "LeMetaEvent completion requires a subevent code"
        );
        let opcode = cmd.opcode();
        let id = TransactionId::next();
        {
            let mut q = self.queue.lock();
            if self.io.lock().is_none() {
                return Err(Error::NotInitialized);
            }
            if !complete.is_cmd() && self.events.lock().has_durable(complete) {
                warn!("Refused {opcode} command: {complete} event is already handled");
                return Err(Error::HandlerConflict(complete));
            }
            let mut excl = SmallVec::from_slice(exclusions);
            if !excl.contains(&opcode) {
                excl.push(opcode);
            }
            trace!("Queued {opcode} command ({id:?})");
            q.push_back(QueuedCommand {
                cmd,
                txn: Transaction {
                    id,
                    opcode,
                    complete,
                    exclusions: excl,
                    callback: Some(f),
                    handler: None,
                    timer: None,
                    dispatcher: Arc::clone(&self.dispatcher),
                },
            });
        }
        self.try_send_queued();
        Ok(id)
    }

    fn remove_queued_command(self: &Arc<Self>, id: TransactionId) -> bool {
        {
            let mut q = self.queue.lock();
            let Some(i) = q.iter().position(|c| c.txn.id == id) else {
                return false;
            };
            let Some(mut c) = q.remove(i) else {
                return false;
            };
            c.txn.callback = None;
            if let Some(h) = c.txn.handler.take() {
                self.events.lock().remove_handler(h);
            }
            trace!("Removed queued {} command ({id:?})", c.txn.opcode);
        }
        self.try_send_queued();
        true
    }

    fn add_event_handler(&self, typ: EventType, f: EventCallback) -> Result<HandlerId> {
        if matches!(
            typ,
            EventType::Hci(
                EventCode::CommandComplete | EventCode::CommandStatus | EventCode::LeMetaEvent
            )
        ) {
            return Err(Error::ReservedEventCode(typ));
        }
        let q = self.queue.lock();
        let mut ev = self.events.lock();
        let waiting = (q.iter()).any(|c| c.txn.complete == typ);
        if waiting || ev.has_transient(typ) {
            warn!("Refused {typ} handler: event is owned by an asynchronous command");
            return Err(Error::HandlerConflict(typ));
        }
        let id = HandlerId::next();
        ev.handlers.push(Handler {
            id,
            typ,
            kind: HandlerKind::Durable(Arc::new(Mutex::new(f))),
        });
        trace!("Added {typ} handler ({id:?})");
        Ok(id)
    }

    fn remove_event_handler(self: &Arc<Self>, id: HandlerId) {
        {
            let mut ev = self.events.lock();
            let Some(i) = (ev.handlers.iter()).position(|h| h.id == id && h.is_durable()) else {
                return;
            };
            let h = ev.handlers.remove(i);
            trace!("Removed {} handler ({id:?})", h.typ);
        }
        // Asynchronous commands may be waiting for the event code
        self.try_send_queued();
    }

    /// Sends queued commands while the controller has free command credits.
    fn try_send_queued(self: &Arc<Self>) {
        let Some(rt) = self.runtime() else {
            return;
        };
        let mut failed = Vec::new();
        {
            let mut q = self.queue.lock();
            let mut ev = self.events.lock();
            let mut i = 0;
            while ev.cmd_quota > 0 && i < q.len() {
                if !ev.can_send(&q[i].txn) {
                    i += 1;
                    continue;
                }
                let Some(mut c) = q.remove(i) else {
                    break;
                };
                if c.txn.is_async() && c.txn.handler.is_none() {
                    let id = HandlerId::next();
                    ev.handlers.push(Handler {
                        id,
                        typ: c.txn.complete,
                        kind: HandlerKind::Transient(c.txn.id),
                    });
                    c.txn.handler = Some(id);
                }
                let opcode = c.txn.opcode;
                let pkt = c.cmd.finish();
                trace!("Command: {pkt:02X?}");
                if let Err(e) = self.chan.write(pkt) {
                    error!("Failed to send {opcode} command: {e}");
                    if let Some(h) = c.txn.handler.take() {
                        ev.remove_handler(h);
                    }
                    failed.push(c.txn);
                    continue;
                }
                if opcode == Opcode::RESET {
                    ev.cmd_quota = 0; // [Vol 4] Part E, Section 7.3.2
                } else {
                    ev.cmd_quota -= 1;
                }
                c.txn.timer = Some(self.start_timer(&rt, c.txn.id, opcode));
                ev.pending.insert(opcode, c.txn);
            }
        }
        drop(failed);
    }

    fn start_timer(
        self: &Arc<Self>,
        rt: &tokio::runtime::Handle,
        id: TransactionId,
        opcode: Opcode,
    ) -> tokio::task::JoinHandle<()> {
        let inner = Arc::downgrade(self);
        let timeout = self.cfg.timeout;
        rt.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.command_timeout(id, opcode);
            }
        })
    }

    fn command_timeout(self: &Arc<Self>, id: TransactionId, opcode: Opcode) {
        let txn = {
            let mut ev = self.events.lock();
            if !ev.pending.get(&opcode).map_or(false, |t| t.id == id) {
                return;
            }
            let mut txn = ev.pending.remove(&opcode);
            if let Some(h) = txn.as_mut().and_then(|t| t.handler.take()) {
                ev.remove_handler(h);
            }
            txn
        };
        let Some(mut txn) = txn else {
            return;
        };
        error!("{opcode} command timed out");
        txn.timer = None; // Running on the timer task
        txn.complete(Err(Error::CommandTimeout { opcode }));
        if let Some(f) = self.on_timeout.lock().clone() {
            self.dispatcher.post(Box::new(move || f(opcode)));
        }
        match self.cfg.on_timeout {
            TimeoutPolicy::Report => self.try_send_queued(),
            TimeoutPolicy::ShutDown => self.shut_down(),
        }
    }

    async fn read_loop(inner: Arc<Self>, ready: Arc<Notify>, c: CancellationToken) {
        debug!("Command channel read loop started");
        let mut buf = vec![0; EVT_BUF];
        loop {
            tokio::select! {
                _ = ready.notified() => {}
                _ = c.cancelled() => break,
            }
            inner.read_events(&mut buf);
        }
        debug!("Command channel read loop terminating");
    }

    /// Receives and handles all available events.
    fn read_events(self: &Arc<Self>, buf: &mut [u8]) {
        loop {
            let n = match self.chan.read(buf) {
                Ok(n) => n,
                Err(host::Error::WouldBlock) => return,
                Err(host::Error::TooLarge(n)) => {
                    warn!("Dropped oversized event ({n} bytes)");
                    continue;
                }
                Err(e) => {
                    error!("Event read error: {e}");
                    return;
                }
            };
            match EventPacket::parse(buf[..n].to_vec()) {
                Ok(evt) => self.handle_event(evt),
                Err(e) => warn!("Dropped event: {e}"),
            }
        }
    }

    /// Routes a received event.
    fn handle_event(self: &Arc<Self>, evt: EventPacket) {
        trace!("Event: {:02X?}", evt.as_ref());
        if evt.typ().is_cmd() {
            self.update_transaction(evt);
        } else {
            self.notify_event_handlers(evt);
        }
    }

    /// Handles `CommandComplete` and `CommandStatus` events.
    fn update_transaction(self: &Arc<Self>, evt: EventPacket) {
        let opcode = evt.opcode();
        let done = {
            let mut ev = self.events.lock();
            ev.cmd_quota = evt.cmd_quota();
            if !opcode.is_some() {
                trace!("Command quota: {}", ev.cmd_quota);
                None
            } else if let Some(mut txn) = ev.pending.remove(&opcode) {
                txn.cancel_timer();
                let is_status = evt.typ() == EventType::Hci(EventCode::CommandStatus);
                match txn.handler {
                    // Unexpected CommandComplete for an asynchronous command or
                    // a failed CommandStatus. No completion event will follow.
                    Some(h) if !is_status || !evt.status().is_ok() => {
                        ev.remove_handler(h);
                        txn.handler = None;
                        Some(txn)
                    }
                    Some(h) => {
                        ev.awaiting.insert(h, txn);
                        None
                    }
                    None => Some(txn),
                }
            } else {
                warn!("Ignored {} event for {opcode}", evt.typ());
                None
            }
        };
        if let Some(txn) = done {
            txn.complete(Ok(evt));
        }
        self.try_send_queued();
    }

    /// Delivers a non-command event to all matching handlers.
    fn notify_event_handlers(self: &Arc<Self>, evt: EventPacket) {
        let typ = evt.typ();
        let (mut to, retired) = {
            let mut ev = self.events.lock();
            let to: SmallVec<[Recipient; 4]> = (ev.handlers.iter())
                .filter_map(|h| match h.kind {
                    HandlerKind::Durable(ref f) if h.typ == typ => {
                        Some(Recipient::Handler(h.id, Arc::clone(f)))
                    }
                    _ => None,
                })
                .collect();
            let txn = (ev.handlers.iter())
                .position(|h| h.typ == typ && !h.is_durable())
                .and_then(|i| {
                    let h = ev.handlers.remove(i);
                    ev.awaiting.remove(&h.id).or_else(|| ev.take_pending(h.id))
                });
            (to, txn)
        };
        if retired.is_some() {
            // The event code is free for the next asynchronous command
            self.try_send_queued();
        }
        if let Some(txn) = retired {
            to.insert(0, Recipient::Transaction(txn));
        }
        let Some(last) = to.pop() else {
            trace!("Ignored {typ} event");
            return;
        };
        for r in to {
            r.deliver(self, evt.clone());
        }
        last.deliver(self, evt);
    }
}

impl Debug for Inner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("chan", &self.chan)
            .field("cfg", &self.cfg)
            .field("queued", &self.queue.lock().len())
            .finish_non_exhaustive()
    }
}

/// Event delivery target.
enum Recipient {
    Transaction(Transaction),
    Handler(HandlerId, Arc<Mutex<EventCallback>>),
}

impl Recipient {
    fn deliver(self, inner: &Arc<Inner>, evt: EventPacket) {
        match self {
            Self::Transaction(txn) => txn.complete(Ok(evt)),
            Self::Handler(id, f) => {
                let d = Arc::clone(&inner.dispatcher);
                let inner = Arc::downgrade(inner);
                d.post(Box::new(move || {
                    let mut cb = f.lock();
                    let r = (*cb)(evt);
                    drop(cb);
                    if r == CallbackResult::Remove {
                        if let Some(inner) = inner.upgrade() {
                            inner.remove_event_handler(id);
                        }
                    }
                }));
            }
        }
    }
}

/// Event handler table and pending transactions.
#[derive(Debug)]
struct EventState {
    cmd_quota: u8,
    pending: HashMap<Opcode, Transaction>,
    awaiting: HashMap<HandlerId, Transaction>,
    handlers: Vec<Handler>,
}

impl Default for EventState {
    #[inline]
    fn default() -> Self {
        Self {
            cmd_quota: 1, // [Vol 4] Part E, Section 4.4
            pending: HashMap::new(),
            awaiting: HashMap::new(),
            handlers: Vec::new(),
        }
    }
}

impl EventState {
    /// Returns whether a queued transaction can be sent now.
    fn can_send(&self, t: &Transaction) -> bool {
        if t.exclusions.iter().any(|op| self.is_pending(*op)) {
            return false;
        }
        !t.is_async() || t.handler.is_some() || !self.handlers.iter().any(|h| h.typ == t.complete)
    }

    /// Returns whether an `opcode` transaction was sent and is not complete.
    /// Asynchronous commands remain pending until their completion event.
    fn is_pending(&self, opcode: Opcode) -> bool {
        self.pending.contains_key(&opcode) || self.awaiting.values().any(|t| t.opcode == opcode)
    }

    #[inline]
    fn has_durable(&self, typ: EventType) -> bool {
        (self.handlers.iter()).any(|h| h.typ == typ && h.is_durable())
    }

    #[inline]
    fn has_transient(&self, typ: EventType) -> bool {
        (self.handlers.iter()).any(|h| h.typ == typ && !h.is_durable())
    }

    #[inline]
    fn remove_handler(&mut self, id: HandlerId) {
        self.handlers.retain(|h| h.id != id);
    }

    /// Removes a pending asynchronous transaction whose completion event
    /// arrived before its `CommandStatus`.
    fn take_pending(&mut self, h: HandlerId) -> Option<Transaction> {
        let opcode = (self.pending.values()).find(|t| t.handler == Some(h))?.opcode;
        let mut txn = self.pending.remove(&opcode)?;
        txn.cancel_timer();
        Some(txn)
    }
}

/// Registered event handler.
struct Handler {
    id: HandlerId,
    typ: EventType,
    kind: HandlerKind,
}

impl Handler {
    #[inline]
    const fn is_durable(&self) -> bool {
        matches!(self.kind, HandlerKind::Durable(_))
    }
}

impl Debug for Handler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Handler");
        s.field("id", &self.id).field("typ", &self.typ);
        if let HandlerKind::Transient(t) = self.kind {
            s.field("transaction", &t);
        }
        s.finish()
    }
}

enum HandlerKind {
    /// Handler registered by the user.
    Durable(Arc<Mutex<EventCallback>>),
    /// Single-use handler owned by an asynchronous command transaction.
    Transient(TransactionId),
}

/// Command that was not yet sent to the controller.
#[derive(Debug)]
struct QueuedCommand {
    cmd: CommandPacket,
    txn: Transaction,
}

/// Command transaction. Dropping a transaction that still has a callback
/// delivers [`Error::CommandAborted`].
struct Transaction {
    id: TransactionId,
    opcode: Opcode,
    complete: EventType,
    exclusions: SmallVec<[Opcode; 4]>,
    callback: Option<CommandCallback>,
    handler: Option<HandlerId>,
    timer: Option<tokio::task::JoinHandle<()>>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Transaction {
    /// Returns whether the command completes with an event other than
    /// `CommandStatus` or `CommandComplete`.
    #[inline]
    const fn is_async(&self) -> bool {
        !self.complete.is_cmd()
    }

    /// Posts the transaction result.
    fn complete(mut self, r: Result<EventPacket>) {
        self.cancel_timer();
        if let Some(f) = self.callback.take() {
            trace!("Completed {} command ({:?})", self.opcode, self.id);
            let id = self.id;
            self.dispatcher.post(Box::new(move || f(id, r)));
        }
    }

    #[inline]
    fn cancel_timer(&mut self) {
        if let Some(t) = self.timer.take() {
            t.abort();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cancel_timer();
        if let Some(f) = self.callback.take() {
            let (id, opcode) = (self.id, self.opcode);
            debug!("Aborted {opcode} command ({id:?})");
            self.dispatcher.post(Box::new(move || {
                f(
                    id,
                    Err(Error::CommandAborted {
                        opcode,
                        status: Status::UnspecifiedError,
                    }),
                );
            }));
        }
    }
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("opcode", &self.opcode)
            .field("complete", &self.complete)
            .field("exclusions", &self.exclusions)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}
