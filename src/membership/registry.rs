use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::membership::member::{Member, MemberAddress};

/// A single observed transition in the registry. `old == None` is a first
/// sighting, `new == None` a removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberChange {
    pub address: MemberAddress,
    pub old: Option<Member>,
    pub new: Option<Member>,
}

/// The local view of the cluster, keyed by gossip address. The local node is
/// never an entry here; its state lives on the engine itself.
#[derive(Debug, Default)]
pub struct MemberRegistry {
    members: HashMap<MemberAddress, Member>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &MemberAddress) -> Option<&Member> {
        self.members.get(address)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Compare-then-store. `update` sees the current entry (if any) and
    /// returns the desired one; `None` removes it. Returns the change only
    /// when the stored value actually differs, so callers can notify
    /// listeners exactly once per real transition. A changed entry restarts
    /// its piggyback count, making fresh news travel first.
    pub fn apply<F>(&mut self, address: MemberAddress, update: F) -> Option<MemberChange>
    where
        F: FnOnce(Option<&Member>) -> Option<Member>,
    {
        let old = self.members.get(&address).cloned();
        let new = update(old.as_ref());

        match (&old, &new) {
            (Some(o), Some(n)) if o == n => None,
            (None, None) => None,
            _ => {
                match new.clone() {
                    Some(mut m) => {
                        m.times_mentioned = 0;
                        self.members.insert(address, m);
                    }
                    None => {
                        self.members.remove(&address);
                    }
                }
                Some(MemberChange { address, old, new })
            }
        }
    }

    /// Up to `count` distinct addresses drawn uniformly, excluding `exclude`.
    pub fn random_peers(
        &self,
        count: usize,
        exclude: Option<MemberAddress>,
        rng: &mut StdRng,
    ) -> Vec<MemberAddress> {
        let mut peers: Vec<MemberAddress> = self
            .members
            .keys()
            .copied()
            .filter(|a| Some(*a) != exclude)
            .collect();
        peers.shuffle(rng);
        peers.truncate(count);
        peers
    }

    /// All entries in ascending piggyback-count order, least-mentioned first,
    /// excluding the datagram's recipient (telling a node about itself is the
    /// header's job). Ties broken by address for determinism.
    pub fn gossip_order(&self, recipient: MemberAddress) -> Vec<(MemberAddress, Member)> {
        let mut entries: Vec<(MemberAddress, Member)> = self
            .members
            .iter()
            .filter(|(a, _)| **a != recipient)
            .map(|(a, m)| (*a, m.clone()))
            .collect();
        entries.sort_by_key(|(a, m)| (m.times_mentioned, *a));
        entries
    }

    /// Bump the piggyback counter after an entry made it onto the wire.
    /// Skipped if the entry changed between selection and send.
    pub fn note_mentioned(&mut self, address: &MemberAddress) {
        if let Some(m) = self.members.get_mut(address) {
            m.times_mentioned += 1;
        }
    }
}
