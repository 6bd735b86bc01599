use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// How far apart two generations can be before we assume the counter wrapped.
/// A single corrupt or ancient generation byte must not be able to jump the
/// whole cluster forward, so the window is asymmetric: `a` is only "later"
/// than `b` when it is ahead by fewer than this many steps.
const GENERATION_WINDOW: u8 = 191;

/// IPv4 gossip endpoint of a member. This is the registry key: two members
/// are the same member iff their address is the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl MemberAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The wire format only carries IPv4. V4-mapped V6 addresses (what a
    /// dual-stack socket reports for a v4 sender) are unwrapped; anything
    /// else is rejected.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr.ip() {
            IpAddr::V4(ip) => Some(Self::new(ip, addr.port())),
            IpAddr::V6(ip) => ip.to_ipv4_mapped().map(|ip| Self::new(ip, addr.port())),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp://{}:{}", self.ip, self.port)
    }
}

impl From<(Ipv4Addr, u16)> for MemberAddress {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        Self::new(ip, port)
    }
}

/// Member health, ordered by severity. When two observations carry the same
/// generation, the higher ordinal wins the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Health {
    Alive = 0x00,
    Suspicious = 0x01,
    Dead = 0x02,
    Left = 0x03,
}

impl Health {
    pub(crate) fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(Health::Alive),
            0x01 => Some(Health::Suspicious),
            0x02 => Some(Health::Dead),
            0x03 => Some(Health::Left),
            _ => None,
        }
    }

    pub(crate) fn wire_tag(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Health::Alive => "alive",
            Health::Suspicious => "suspicious",
            Health::Dead => "dead",
            Health::Left => "left",
        };
        f.write_str(name)
    }
}

/// Opaque service descriptor a member advertises while it is alive: a single
/// identifier byte plus the port the service listens on. The engine carries
/// it around untouched; interpreting the id byte is the consumer's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Service {
    pub id: u8,
    pub port: u16,
}

/// Everything we currently believe about one member.
///
/// `times_mentioned` counts how often this entry has been piggybacked onto an
/// outgoing datagram. It drives fair rumor rotation, is never put on the
/// wire, and is excluded from equality so that a pure gossip-fairness update
/// never looks like a state change to listeners.
#[derive(Debug, Clone)]
pub struct Member {
    pub health: Health,
    pub generation: u8,
    pub service: Option<Service>,
    pub(crate) times_mentioned: u64,
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.health == other.health
            && self.generation == other.generation
            && self.service == other.service
    }
}

impl Eq for Member {}

impl Member {
    pub fn new(health: Health, generation: u8, service: Option<Service>) -> Self {
        Self {
            health,
            generation,
            service,
            times_mentioned: 0,
        }
    }

    /// Entry inserted when we ping an address we have never heard of, so a
    /// pending-ack timeout has something to hang off. DEAD at generation 0
    /// loses to anything real the peer says about itself.
    pub(crate) fn placeholder() -> Self {
        Self::new(Health::Dead, 0, None)
    }

    pub(crate) fn with_health(&self, health: Health) -> Self {
        Self::new(health, self.generation, self.service)
    }

    /// Resolve two observations of the same member.
    ///
    /// Later generation wins outright; at the same generation the higher
    /// health severity wins; otherwise ours stands. Whichever side wins, a
    /// missing service descriptor is backfilled from the losing side, so a
    /// health-only rumor never erases service metadata we already know.
    pub fn merge(&self, theirs: &Member) -> Member {
        if is_later_generation(theirs.generation, self.generation)
            || theirs.health > self.health
        {
            Member::new(
                theirs.health,
                theirs.generation,
                theirs.service.or(self.service),
            )
        } else {
            Member::new(
                self.health,
                self.generation,
                self.service.or(theirs.service),
            )
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.health, self.generation)?;
        if let Some(service) = self.service {
            write!(f, "{{{}:{}}}", service.id, service.port)?;
        }
        Ok(())
    }
}

/// Is generation `a` fresher than generation `b`?
///
/// Generations are a circular 8-bit counter, so this cannot be a plain
/// comparison. `a` is later iff it is ahead of `b` by 1..=190 steps modulo
/// 256; a gap of 191 or more counts as `b` having wrapped past `a`.
pub fn is_later_generation(a: u8, b: u8) -> bool {
    let ahead = a.wrapping_sub(b);
    ahead > 0 && ahead < GENERATION_WINDOW
}

/// Generation to claim after hearing a rumor that we are suspicious or dead
/// at `rumored`. One past the rumor out-shouts it, unless we already claim
/// something fresher.
pub(crate) fn refuted_generation(claimed: u8, rumored: u8) -> u8 {
    let next = rumored.wrapping_add(1);
    if is_later_generation(claimed, next) {
        claimed
    } else {
        next
    }
}
