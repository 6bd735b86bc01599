//! Fixed-width binary datagram format.
//!
//! One gossip exchange fits in a single unfragmented UDP datagram, so the
//! whole format is capped at 508 bytes. A datagram is a fixed header (kind,
//! sender digest, the sender's belief about the receiver) followed by as many
//! rumor records as fit. The event run has no length prefix: decoding reads
//! records until the buffer runs out, and a record cut off mid-way simply
//! terminates the run. All multi-byte integers are big-endian.

use bytes::Bytes;

use crate::membership::member::{Health, Member, MemberAddress, Service};

/// 576-byte IPv4 minimum reassembly size minus IP and UDP headers.
pub const MAX_DATAGRAM_BYTES: usize = 508;

/// Protocol version stamped on byte 0 of every datagram.
pub const WIRE_VERSION: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Ack = 0x00,
    Ping = 0x01,
    /// Relay -> prober leg of an indirect probe; carries the probed target.
    ForwardedAck = 0x06,
    /// Target -> relay leg; carries the prober the ack is destined for.
    AckRequest = 0x04,
    /// Prober -> relay leg; carries the target to probe.
    PingRequest = 0x05,
    /// Relay -> target leg; carries the prober the probe originated from.
    ForwardedPing = 0x07,
}

impl MessageKind {
    fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(MessageKind::Ack),
            0x01 => Some(MessageKind::Ping),
            0x04 => Some(MessageKind::AckRequest),
            0x05 => Some(MessageKind::PingRequest),
            0x06 => Some(MessageKind::ForwardedAck),
            0x07 => Some(MessageKind::ForwardedPing),
            _ => None,
        }
    }

    /// The request/forward kinds embed a third party's address right after
    /// the kind byte.
    pub fn carries_address(self) -> bool {
        matches!(
            self,
            MessageKind::AckRequest
                | MessageKind::PingRequest
                | MessageKind::ForwardedAck
                | MessageKind::ForwardedPing
        )
    }
}

/// One piggybacked rumor: everything the sender believes about one member.
/// The service descriptor only travels with ALIVE records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    pub address: MemberAddress,
    pub health: Health,
    pub generation: u8,
    pub service: Option<Service>,
}

/// A fully decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Present iff `kind.carries_address()`.
    pub carried: Option<MemberAddress>,
    pub sender_generation: u8,
    pub sender_service: Service,
    /// What the sender believes about us; DEAD at generation 0 when the
    /// sender has no entry.
    pub receiver_health: Health,
    pub receiver_generation: u8,
    pub events: Vec<MemberEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnsupportedVersion(u8),
    UnknownKind(u8),
    /// Datagram ended before the fixed header was complete. Only the header
    /// is held to this standard; the event run may stop anywhere.
    Truncated,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnsupportedVersion(v) => write!(f, "unsupported wire version {v:#04x}"),
            DecodeError::UnknownKind(k) => write!(f, "unknown message kind {k:#04x}"),
            DecodeError::Truncated => f.write_str("datagram truncated inside the header"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Byte-at-a-time reader over a received datagram. Every read is a try-read
/// returning `None` at end-of-buffer, which is how the unprefixed event run
/// terminates.
struct DatagramReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DatagramReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_u16(&mut self) -> Option<u16> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn read_address(&mut self) -> Option<MemberAddress> {
        let a = self.read_u8()?;
        let b = self.read_u8()?;
        let c = self.read_u8()?;
        let d = self.read_u8()?;
        let port = self.read_u16()?;
        Some(MemberAddress::new([a, b, c, d].into(), port))
    }

    fn read_health(&mut self) -> Option<Health> {
        Health::from_wire(self.read_u8()?)
    }

    /// One rumor record, or `None` when the buffer ends anywhere inside it.
    fn read_event(&mut self) -> Option<MemberEvent> {
        let address = self.read_address()?;
        let health = self.read_health()?;
        let generation = self.read_u8()?;
        let service = if health == Health::Alive {
            let id = self.read_u8()?;
            let port = self.read_u16()?;
            Some(Service { id, port })
        } else {
            None
        };
        Some(MemberEvent {
            address,
            health,
            generation,
            service,
        })
    }
}

pub fn decode(payload: &[u8]) -> Result<Envelope, DecodeError> {
    let mut r = DatagramReader::new(payload);

    let version = r.read_u8().ok_or(DecodeError::Truncated)?;
    if version != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let kind_tag = r.read_u8().ok_or(DecodeError::Truncated)?;
    let kind = MessageKind::from_wire(kind_tag).ok_or(DecodeError::UnknownKind(kind_tag))?;

    let carried = if kind.carries_address() {
        Some(r.read_address().ok_or(DecodeError::Truncated)?)
    } else {
        None
    };

    let sender_generation = r.read_u8().ok_or(DecodeError::Truncated)?;
    let sender_service = Service {
        id: r.read_u8().ok_or(DecodeError::Truncated)?,
        port: r.read_u16().ok_or(DecodeError::Truncated)?,
    };
    let receiver_health = r.read_health().ok_or(DecodeError::Truncated)?;
    let receiver_generation = r.read_u8().ok_or(DecodeError::Truncated)?;

    let mut events = Vec::new();
    while let Some(event) = r.read_event() {
        events.push(event);
    }

    Ok(Envelope {
        kind,
        carried,
        sender_generation,
        sender_service,
        receiver_health,
        receiver_generation,
        events,
    })
}

/// Signals that a write would push the datagram past [`MAX_DATAGRAM_BYTES`].
/// Nothing is written when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// Capacity-checked writer for one outgoing datagram.
///
/// Writes are all-or-nothing per call, and [`checkpoint`]/[`rollback`] make a
/// multi-field record atomic: the rumor loop checkpoints before each record
/// and rolls back when any field overflows, so a datagram never ends with a
/// partial record.
///
/// [`checkpoint`]: DatagramWriter::checkpoint
/// [`rollback`]: DatagramWriter::rollback
pub struct DatagramWriter {
    buf: [u8; MAX_DATAGRAM_BYTES],
    len: usize,
}

impl DatagramWriter {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_DATAGRAM_BYTES],
            len: 0,
        }
    }

    pub fn checkpoint(&self) -> usize {
        self.len
    }

    pub fn rollback(&mut self, checkpoint: usize) {
        self.len = checkpoint;
    }

    pub fn remaining(&self) -> usize {
        MAX_DATAGRAM_BYTES - self.len
    }

    fn write_u8(&mut self, b: u8) -> Result<(), Overflow> {
        if self.len == MAX_DATAGRAM_BYTES {
            return Err(Overflow);
        }
        self.buf[self.len] = b;
        self.len += 1;
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> Result<(), Overflow> {
        if self.remaining() < 2 {
            return Err(Overflow);
        }
        let [hi, lo] = v.to_be_bytes();
        self.buf[self.len] = hi;
        self.buf[self.len + 1] = lo;
        self.len += 2;
        Ok(())
    }

    fn write_address(&mut self, addr: MemberAddress) -> Result<(), Overflow> {
        if self.remaining() < 6 {
            return Err(Overflow);
        }
        let octets = addr.ip.octets();
        self.buf[self.len..self.len + 4].copy_from_slice(&octets);
        self.len += 4;
        self.write_u16(addr.port)
    }

    /// Header: version, kind, carried address where the kind requires one,
    /// sender digest, and the sender's belief about the recipient. The header
    /// always fits in a fresh writer.
    pub fn write_header(
        &mut self,
        kind: MessageKind,
        carried: Option<MemberAddress>,
        sender_generation: u8,
        sender_service: Service,
        receiver_belief: Option<&Member>,
    ) -> Result<(), Overflow> {
        debug_assert_eq!(kind.carries_address(), carried.is_some());
        self.write_u8(WIRE_VERSION)?;
        self.write_u8(kind as u8)?;
        if let Some(addr) = carried {
            self.write_address(addr)?;
        }
        self.write_u8(sender_generation)?;
        self.write_u8(sender_service.id)?;
        self.write_u16(sender_service.port)?;
        match receiver_belief {
            Some(m) => {
                self.write_u8(m.health.wire_tag())?;
                self.write_u8(m.generation)?;
            }
            None => {
                self.write_u8(Health::Dead.wire_tag())?;
                self.write_u8(0)?;
            }
        }
        Ok(())
    }

    /// One rumor record, atomically: either the whole record lands or the
    /// writer is left exactly as it was.
    pub fn write_event(
        &mut self,
        address: MemberAddress,
        member: &Member,
    ) -> Result<(), Overflow> {
        let mark = self.checkpoint();
        let result = self.try_write_event(address, member);
        if result.is_err() {
            self.rollback(mark);
        }
        result
    }

    fn try_write_event(
        &mut self,
        address: MemberAddress,
        member: &Member,
    ) -> Result<(), Overflow> {
        self.write_address(address)?;
        self.write_u8(member.health.wire_tag())?;
        self.write_u8(member.generation)?;
        if member.health == Health::Alive {
            let service = member.service.unwrap_or(Service { id: 0, port: 0 });
            self.write_u8(service.id)?;
            self.write_u16(service.port)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Bytes {
        Bytes::copy_from_slice(&self.buf[..self.len])
    }
}

impl Default for DatagramWriter {
    fn default() -> Self {
        Self::new()
    }
}
