use std::collections::HashMap;

use crate::membership::member::{Member, MemberAddress};
use crate::membership::registry::MemberChange;

/// Observer for membership transitions.
///
/// Called synchronously inside the engine, once per actual state change.
/// `from` is the peer whose datagram triggered the change, `None` when the
/// engine decided on its own (timeout, seed ping). `new == None` means the
/// member was pruned; `old == None` means it was just discovered.
pub trait MemberListener: Send {
    fn member_changed(
        &self,
        from: Option<MemberAddress>,
        address: MemberAddress,
        new: Option<&Member>,
        old: Option<&Member>,
    );
}

impl<F> MemberListener for F
where
    F: Fn(Option<MemberAddress>, MemberAddress, Option<&Member>, Option<&Member>) + Send,
{
    fn member_changed(
        &self,
        from: Option<MemberAddress>,
        address: MemberAddress,
        new: Option<&Member>,
        old: Option<&Member>,
    ) {
        self(from, address, new, old)
    }
}

/// Listeners keyed by caller-chosen string; registering under an existing key
/// replaces the previous listener.
#[derive(Default)]
pub struct ListenerSet {
    listeners: HashMap<String, Box<dyn MemberListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, listener: Box<dyn MemberListener>) {
        self.listeners.insert(key, listener);
    }

    pub fn remove(&mut self, key: &str) {
        self.listeners.remove(key);
    }

    pub fn notify(&self, from: Option<MemberAddress>, change: &MemberChange) {
        for listener in self.listeners.values() {
            listener.member_changed(
                from,
                change.address,
                change.new.as_ref(),
                change.old.as_ref(),
            );
        }
    }
}
