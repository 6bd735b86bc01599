//! SWIM-style cluster membership and failure detection.
//!
//! Each node keeps a local registry of peers, probes a few random ones every
//! protocol period over UDP, and piggybacks rumors about everyone else onto
//! every datagram. Peers that stop answering are probed indirectly through
//! relays, marked suspicious, then dead, and finally pruned; a peer hearing
//! rumors of its own demise refutes them by bumping its generation.
//!
//! The protocol itself lives in a synchronous state machine ([`Gossip`]);
//! [`Gossiper`] wraps it in a pair of tokio actors (engine + UDP transport)
//! and is the surface most callers want.

mod actor;
mod engine;
mod listener;
mod member;
mod registry;
mod transport;
mod wire;

pub use actor::{EngineActor, EngineEvent, Gossiper, GossiperTasks};
pub use engine::{Gossip, GossiperOptions, OutboundDatagram};
pub use listener::MemberListener;
pub use member::{is_later_generation, Health, Member, MemberAddress, Service};
pub use registry::MemberChange;

#[cfg(test)]
mod tests;
