//! Host Controller Interface ([Vol 4] Part E).
//!
//! Two engines share the controller transport. [`CommandChannel`] drives the
//! credit-based HCI command protocol and routes received events to registered
//! handlers. [`AclDataChannel`] flow-controls outbound ACL data packets using
//! the controller buffer credits reported by `HCI_Number_Of_Completed_Packets`
//! events, which it receives from the command engine through [`EventSource`].

pub use {acl::*, adv::*, cmd::*, consts::*, handle::*, packet::*};

use crate::host;

#[path = "acl/acl.rs"]
mod acl;
mod adv;
#[path = "cmd/cmd.rs"]
mod cmd;
mod consts;
mod handle;
mod packet;

/// Error type returned by the HCI layer.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Host(#[from] host::Error),
    #[error("HCI error: {status}")]
    Hci {
        #[from]
        status: Status,
    },
    #[error("invalid event: {0:02X?}")]
    InvalidEvent(Vec<u8>),
    #[error("unknown event [code={code:#04X}, subevent={subevent:#04X}]: {params:02X?}")]
    UnknownEvent {
        code: u8,
        subevent: u8,
        params: Vec<u8>,
    },
    #[error("invalid ACL data packet: {0:02X?}")]
    InvalidPacket(Vec<u8>),
    #[error("{opcode} command failed: {status}")]
    CommandFailed { opcode: Opcode, status: Status },
    #[error("{opcode} command aborted: {status}")]
    CommandAborted { opcode: Opcode, status: Status },
    #[error("{opcode} command timed out")]
    CommandTimeout { opcode: Opcode },
    #[error("channel is not initialized")]
    NotInitialized,
    #[error("{0} event code is reserved")]
    ReservedEventCode(EventType),
    #[error("{0} event is already handled")]
    HandlerConflict(EventType),
    #[error("{0} is not registered")]
    UnknownLink(ConnHandle),
    #[error("no controller data buffer for {0}")]
    NoBuffer(ConnHandle),
    #[error("ACL data payload too long ({len} > {mtu})")]
    PacketTooLong { len: usize, mtu: usize },
    #[error("empty ACL data packet batch")]
    EmptyBatch,
}

impl Error {
    /// Returns the HCI status code, if any.
    #[must_use]
    pub const fn status(&self) -> Option<Status> {
        use Error::*;
        match *self {
            Hci { status } | CommandFailed { status, .. } | CommandAborted { status, .. } => {
                Some(status)
            }
            Host(_)
            | InvalidEvent(_)
            | UnknownEvent { .. }
            | InvalidPacket(_)
            | CommandTimeout { .. }
            | NotInitialized
            | ReservedEventCode(_)
            | HandlerConflict(_)
            | UnknownLink(_)
            | NoBuffer(_)
            | PacketTooLong { .. }
            | EmptyBatch => None,
        }
    }

    /// Returns whether the error is the synthetic result delivered to a
    /// command that was dropped without a controller response.
    #[inline]
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(*self, Self::CommandAborted { .. })
    }
}

/// Common HCI result type.
pub type Result<T> = std::result::Result<T, Error>;
