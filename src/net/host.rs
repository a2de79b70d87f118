//! The transport a DHT node runs on: peers, streams and the peerstore.

use std::fmt::{self, Debug, Display, Formatter};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use flume::Receiver;
use multiaddr::Multiaddr;

use crate::common::{Connectedness, PeerId, PeerInfo};
use crate::Result;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Protocol identifier negotiated when a stream is opened, e.g. `/ipfs/kad/1.0.0`.
pub struct ProtocolId(Arc<str>);

impl ProtocolId {
    pub fn new(id: impl Into<String>) -> Self {
        ProtocolId(id.into().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProtocolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for ProtocolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolId({})", self.0)
    }
}

/// A bidirectional, ordered byte channel to a remote peer.
pub trait Stream: Read + Write + Send + Debug {
    fn remote_peer(&self) -> &PeerId;

    /// The protocol negotiated for this stream.
    fn protocol(&self) -> &ProtocolId;

    /// Reads fail with [io::ErrorKind::TimedOut] when nothing arrives for `timeout`.
    /// `None` blocks forever.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Abort the stream in both directions, the remote sees an error.
    fn reset(&mut self);

    /// Gracefully close the stream, the remote reads EOF.
    fn close(&mut self);
}

pub type BoxStream = Box<dyn Stream>;

/// Called on a fresh thread for every inbound stream of a registered protocol.
pub type StreamHandler = Arc<dyn Fn(BoxStream) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Peer lifecycle events published by a [Host].
pub enum HostEvent {
    /// A new connection finished identification, its protocols are known.
    PeerIdentified(PeerId),
    /// A connected peer started or stopped speaking some protocols.
    ProtocolsUpdated(PeerId),
    /// The last connection to a peer was closed.
    PeerDisconnected(PeerId),
}

/// Transport capabilities the DHT node depends on.
pub trait Host: Send + Sync {
    fn id(&self) -> &PeerId;

    /// Addresses this host listens on and advertises.
    fn addrs(&self) -> Vec<Multiaddr>;

    /// Open a stream to `peer` speaking the first of `protocols` it supports,
    /// dialing it first if needed.
    fn new_stream(&self, peer: &PeerId, protocols: &[ProtocolId]) -> Result<BoxStream>;

    fn set_stream_handler(&self, protocol: &ProtocolId, handler: StreamHandler);

    fn remove_stream_handler(&self, protocol: &ProtocolId);

    /// Reset every open inbound stream negotiated on `protocol`.
    fn reset_streams(&self, protocol: &ProtocolId);

    fn connect(&self, peer: &PeerInfo) -> Result<()>;

    fn connected_peers(&self) -> Vec<PeerId>;

    fn connectedness(&self, peer: &PeerId) -> Connectedness;

    /// Remote addresses of the live connections to `peer`.
    fn remote_addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Unexpired addresses known for `peer`.
    fn peer_addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Remember `addrs` for at least `ttl`.
    fn add_peer_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration);

    /// Extend every known address of `peer` to expire no sooner than `ttl` from now.
    fn update_peer_addrs_ttl(&self, peer: &PeerId, ttl: Duration);

    /// First of `protocols` that `peer` is known to support.
    fn first_supported_protocol(&self, peer: &PeerId, protocols: &[ProtocolId])
        -> Option<ProtocolId>;

    fn record_latency(&self, _peer: &PeerId, _rtt: Duration) {}

    /// Subscribe to [HostEvent]s from now on.
    fn subscribe(&self) -> Receiver<HostEvent>;
}
