//! Peer membership.
//!
//! Peers are known only by address. Membership is unconfirmed: an invite adds
//! the invitee locally whether or not it ever arrives, and an inbound invite
//! adds its sender. There is no acknowledgment message.

use std::collections::BTreeSet;

/// Deduplicated set of peer addresses that never contains the owner's own
/// address.
#[derive(Debug, Clone)]
pub struct PeerSet {
    own_addr: String,
    peers: BTreeSet<String>,
}

impl PeerSet {
    pub fn new(own_addr: impl Into<String>) -> Self {
        Self {
            own_addr: own_addr.into(),
            peers: BTreeSet::new(),
        }
    }

    /// Add `addr`. Returns `true` if it was not already a member.
    ///
    /// The owner's own address is never added.
    pub fn insert(&mut self, addr: &str) -> bool {
        if addr == self.own_addr {
            return false;
        }
        self.peers.insert(addr.to_string())
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.contains(addr)
    }

    pub fn is_own(&self, addr: &str) -> bool {
        addr == self.own_addr
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Sorted copy of the current members.
    pub fn snapshot(&self) -> Vec<String> {
        self.peers.iter().cloned().collect()
    }
}
