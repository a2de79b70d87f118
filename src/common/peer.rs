//! Peer entries exchanged in closer/provider peer lists.
use multiaddr::Multiaddr;

use crate::common::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What the responding node knows about its connection to a peer.
pub enum Connectedness {
    #[default]
    NotConnected,
    Connected,
    /// Recently connected, dialing is expected to succeed.
    CanConnect,
    /// Recently failed to connect.
    CannotConnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A peer and the transport addresses it can be reached at.
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub connectedness: Connectedness,
}

impl PeerInfo {
    /// Creates a new PeerInfo from an id and its addresses.
    pub fn new(id: PeerId, addrs: Vec<Multiaddr>) -> PeerInfo {
        PeerInfo {
            id,
            addrs,
            connectedness: Connectedness::NotConnected,
        }
    }

    pub fn with_connectedness(mut self, connectedness: Connectedness) -> Self {
        self.connectedness = connectedness;
        self
    }

    /// Only peers with at least one address are worth telling anyone about.
    pub fn has_addrs(&self) -> bool {
        !self.addrs.is_empty()
    }
}
