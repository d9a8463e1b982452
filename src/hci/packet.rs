//! HCI packet formats ([Vol 4] Part E, Section 5.4).

use std::fmt::{Display, Formatter};

use structbuf::{Pack, Packer, StructBuf, Unpacker};

use super::*;

/// Command packet header size.
pub(crate) const CMD_HDR: usize = 3;
/// Event packet header size.
pub(crate) const EVT_HDR: usize = 2;
/// Maximum event packet size.
pub(crate) const EVT_BUF: usize = EVT_HDR + u8::MAX as usize;
/// ACL data packet header size.
pub const ACL_HDR: usize = 4;
/// Maximum ACL data packet size.
pub(crate) const ACL_BUF: usize = ACL_HDR + u16::MAX as usize;

/// HCI event or LE subevent code.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum EventType {
    Hci(EventCode),
    Le(SubeventCode),
}

impl EventType {
    /// Returns whether the event type is either `CommandStatus` or
    /// `CommandComplete`.
    #[inline]
    #[must_use]
    pub const fn is_cmd(self) -> bool {
        matches!(
            self,
            Self::Hci(EventCode::CommandComplete | EventCode::CommandStatus)
        )
    }
}

impl Default for EventType {
    /// Returns an invalid `EventType`.
    #[inline]
    fn default() -> Self {
        Self::Hci(EventCode::LeMetaEvent)
    }
}

impl From<EventCode> for EventType {
    #[inline]
    fn from(c: EventCode) -> Self {
        Self::Hci(c)
    }
}

impl From<SubeventCode> for EventType {
    #[inline]
    fn from(c: SubeventCode) -> Self {
        Self::Le(c)
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Hci(c) => write!(f, "{c:?}"),
            Self::Le(c) => write!(f, "Le{c:?}"),
        }
    }
}

/// Encoded HCI command packet ([Vol 4] Part E, Section 5.4.1).
#[derive(Clone, Debug)]
pub struct CommandPacket {
    opcode: Opcode,
    buf: StructBuf,
}

impl CommandPacket {
    /// Creates a command without parameters.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        let mut buf = StructBuf::new(CMD_HDR + usize::from(u8::MAX));
        buf.append().u16(opcode).u8(0); // Final length is set by finish()
        Self { opcode, buf }
    }

    /// Creates a command, calling `f` to provide parameters.
    #[inline]
    #[must_use]
    pub fn with_params(opcode: Opcode, f: impl FnOnce(&mut Packer)) -> Self {
        let mut cmd = Self::new(opcode);
        f(&mut cmd.append());
        cmd
    }

    /// Returns the command opcode.
    #[inline(always)]
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Returns the command parameters.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &[u8] {
        &self.buf.as_ref()[CMD_HDR..]
    }

    /// Updates the parameter length field and returns the complete packet.
    pub(crate) fn finish(&mut self) -> &[u8] {
        #[allow(clippy::cast_possible_truncation)]
        let n = (self.buf.as_ref().len() - CMD_HDR) as u8;
        self.buf.at(CMD_HDR - 1).u8(n);
        self.buf.as_ref()
    }
}

impl Pack for CommandPacket {
    #[inline]
    fn append(&mut self) -> Packer {
        self.buf.append()
    }

    #[inline]
    fn at(&mut self, i: usize) -> Packer {
        self.buf.at(CMD_HDR + i)
    }
}

/// Common event header. [`EventType`] determines the validity of other fields.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct EventHeader {
    typ: EventType,
    status: Status,
    cmd_quota: u8,
    opcode: Opcode,
}

impl EventHeader {
    /// Unpacks and validates the header of a received event, returning the
    /// header and any remaining parameters.
    fn unpack(raw: &[u8]) -> Result<(Self, &[u8])> {
        let mut p = Unpacker::new(raw);
        let (code, len) = (p.u8(), p.u8());
        if p.len() != usize::from(len) || !p.is_ok() {
            return Err(Error::InvalidEvent(Vec::from(raw)));
        }
        let typ = match EventCode::try_from(code) {
            Ok(EventCode::LeMetaEvent) => {
                let subevent = p.u8();
                match SubeventCode::try_from(subevent) {
                    Ok(subevent) => EventType::Le(subevent),
                    Err(_) if !p.is_ok() => return Err(Error::InvalidEvent(Vec::from(raw))),
                    Err(_) => {
                        return Err(Error::UnknownEvent {
                            code,
                            subevent,
                            params: Vec::from(p.as_ref()),
                        })
                    }
                }
            }
            Ok(code) => EventType::Hci(code),
            Err(_) => {
                return Err(Error::UnknownEvent {
                    code,
                    subevent: 0,
                    params: Vec::from(p.as_ref()),
                })
            }
        };
        let mut hdr = Self {
            typ,
            ..Self::default()
        };
        match typ {
            EventType::Hci(EventCode::CommandComplete) => {
                hdr.cmd_quota = p.u8();
                hdr.opcode = Opcode::from(p.u16());
                if !p.is_empty() {
                    hdr.status = Status::from(p.u8());
                }
            }
            EventType::Hci(EventCode::CommandStatus) => {
                hdr.status = Status::from(p.u8());
                hdr.cmd_quota = p.u8();
                hdr.opcode = Opcode::from(p.u16());
            }
            _ => {}
        }
        if p.is_ok() {
            Ok((hdr, p.into_inner()))
        } else {
            Err(Error::InvalidEvent(Vec::from(raw)))
        }
    }
}

/// Received HCI event packet ([Vol 4] Part E, Section 5.4.4). Cloning an event
/// copies the entire packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EventPacket {
    raw: Vec<u8>,
    hdr: EventHeader,
    params_off: usize,
}

impl EventPacket {
    /// Validates the event header and takes ownership of the packet.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let (hdr, params) = EventHeader::unpack(&raw)?;
        let params_off = raw.len() - params.len();
        Ok(Self {
            raw,
            hdr,
            params_off,
        })
    }

    /// Returns the event type.
    #[inline(always)]
    #[must_use]
    pub const fn typ(&self) -> EventType {
        self.hdr.typ
    }

    /// Returns the status of `CommandComplete` and `CommandStatus` events or
    /// [`Status::Success`] for all other events.
    #[inline(always)]
    #[must_use]
    pub const fn status(&self) -> Status {
        self.hdr.status
    }

    /// Returns the `Num_HCI_Command_Packets` parameter of `CommandComplete`
    /// and `CommandStatus` events.
    #[inline(always)]
    #[must_use]
    pub const fn cmd_quota(&self) -> u8 {
        self.hdr.cmd_quota
    }

    /// Returns the opcode from `CommandComplete` or `CommandStatus` events.
    /// [`Opcode::NONE`] is returned for either event that only updates the
    /// command quota and for non-command events.
    #[inline(always)]
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.hdr.opcode
    }

    /// Returns the event parameters following the common header. For
    /// `CommandComplete` these are the return parameters after the status,
    /// and for LE events these start after the subevent code.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &[u8] {
        &self.raw[self.params_off..]
    }

    /// Returns an unpacker over the event parameters.
    #[inline]
    #[must_use]
    pub fn unpack(&self) -> Unpacker {
        Unpacker::new(self.params())
    }

    /// Ensures that the event represent successful command status or
    /// completion.
    ///
    /// # Panics
    ///
    /// Panics for non-command events.
    pub fn cmd_ok(&self) -> Result<()> {
        assert!(self.typ().is_cmd(), "non-command {} event", self.typ());
        if self.status().is_ok() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                opcode: self.opcode(),
                status: self.status(),
            })
        }
    }
}

impl AsRef<[u8]> for EventPacket {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.raw
    }
}

impl TryFrom<Vec<u8>> for EventPacket {
    type Error = Error;

    #[inline]
    fn try_from(raw: Vec<u8>) -> Result<Self> {
        Self::parse(raw)
    }
}

/// ACL data packet boundary flag ([Vol 4] Part E, Section 5.4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BoundaryFlag {
    FirstNonFlushable = 0b00,
    ContinuingFragment = 0b01,
    FirstFlushable = 0b10,
    CompletePdu = 0b11,
}

impl BoundaryFlag {
    /// Returns whether the packet continues a PDU started by an earlier
    /// packet.
    #[inline]
    #[must_use]
    pub const fn is_continuation(self) -> bool {
        matches!(self, Self::ContinuingFragment)
    }

    #[inline]
    const fn from_bits(v: u16) -> Self {
        match v & 0b11 {
            0b00 => Self::FirstNonFlushable,
            0b01 => Self::ContinuingFragment,
            0b10 => Self::FirstFlushable,
            _ => Self::CompletePdu,
        }
    }
}

/// ACL data packet broadcast flag ([Vol 4] Part E, Section 5.4.2).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum BroadcastFlag {
    #[default]
    PointToPoint = 0b00,
    BrEdrBroadcast = 0b01,
    Reserved10 = 0b10,
    Reserved11 = 0b11,
}

impl BroadcastFlag {
    #[inline]
    const fn from_bits(v: u16) -> Self {
        match v & 0b11 {
            0b00 => Self::PointToPoint,
            0b01 => Self::BrEdrBroadcast,
            0b10 => Self::Reserved10,
            _ => Self::Reserved11,
        }
    }
}

/// ACL data packet header ([Vol 4] Part E, Section 5.4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AclHeader {
    pub handle: ConnHandle,
    pub boundary: BoundaryFlag,
    pub broadcast: BroadcastFlag,
    pub len: u16,
}

impl AclHeader {
    /// Unpacks the header of a received ACL data packet, returning the header
    /// and the remaining bytes. The payload length is not validated.
    pub fn unpack(raw: &[u8]) -> Result<(Self, &[u8])> {
        let mut p = Unpacker::new(raw);
        let (cn, len) = (p.u16(), p.u16());
        let handle = ConnHandle::new(cn & ConnHandle::MASK);
        match handle {
            Some(handle) if p.is_ok() => Ok((
                Self {
                    handle,
                    boundary: BoundaryFlag::from_bits(cn >> ConnHandle::BITS),
                    broadcast: BroadcastFlag::from_bits(cn >> (ConnHandle::BITS + 2)),
                    len,
                },
                p.into_inner(),
            )),
            _ => Err(Error::InvalidPacket(Vec::from(raw))),
        }
    }

    /// Packs the header.
    #[inline]
    pub fn pack(&self, p: &mut Packer) {
        let cn = u16::from(self.handle)
            | u16::from(self.boundary as u8) << ConnHandle::BITS
            | u16::from(self.broadcast as u8) << (ConnHandle::BITS + 2);
        p.u16(cn).u16(self.len);
    }
}

/// Complete ACL data packet, including the header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AclPacket {
    hdr: AclHeader,
    raw: Vec<u8>,
}

impl AclPacket {
    /// Creates an outbound point-to-point packet.
    ///
    /// # Panics
    ///
    /// Panics if the payload does not fit in a single ACL data packet.
    #[must_use]
    pub fn new(handle: ConnHandle, boundary: BoundaryFlag, payload: &[u8]) -> Self {
        let len = u16::try_from(payload.len()).expect("ACL data payload too long");
        let hdr = AclHeader {
            handle,
            boundary,
            broadcast: BroadcastFlag::PointToPoint,
            len,
        };
        let mut b = StructBuf::new(ACL_HDR);
        hdr.pack(&mut b.append());
        let mut raw = Vec::with_capacity(ACL_HDR + payload.len());
        raw.extend_from_slice(b.as_ref());
        raw.extend_from_slice(payload);
        Self { hdr, raw }
    }

    /// Validates a received packet and takes ownership of it. A declared
    /// payload length that does not match the number of received bytes is an
    /// error.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let (hdr, payload) = AclHeader::unpack(&raw)?;
        if payload.len() != usize::from(hdr.len) {
            return Err(Error::InvalidPacket(raw));
        }
        Ok(Self { hdr, raw })
    }

    /// Returns the packet header.
    #[inline(always)]
    #[must_use]
    pub const fn header(&self) -> &AclHeader {
        &self.hdr
    }

    /// Returns the connection handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> ConnHandle {
        self.hdr.handle
    }

    /// Returns the packet boundary flag.
    #[inline(always)]
    #[must_use]
    pub const fn boundary(&self) -> BoundaryFlag {
        self.hdr.boundary
    }

    /// Returns the packet payload.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.raw[ACL_HDR..]
    }
}

impl AsRef<[u8]> for AclPacket {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.raw
    }
}
