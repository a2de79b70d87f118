//! In-process transport connecting [MemoryHost]s through channels.
//!
//! Used for local testnets: no sockets, but real threads, real blocking
//! reads with deadlines, and the same stream semantics (close, reset) the
//! DHT relies on.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use flume::{Receiver, Selector, Sender};
use multiaddr::Multiaddr;
use tracing::{debug, trace};

use crate::common::{Connectedness, PeerId, PeerInfo};
use crate::net::{BoxStream, Host, HostEvent, ProtocolId, Stream, StreamHandler};
use crate::Result;

/// TTL of the addresses exchanged when two hosts connect.
const CONNECTED_ADDR_TTL: Duration = Duration::from_secs(60 * 60);

type Hosts = Arc<RwLock<HashMap<PeerId, Weak<HostInner>>>>;

#[derive(Debug, Clone, Default)]
/// A set of [MemoryHost]s that can dial each other by peer id.
pub struct MemoryNetwork {
    hosts: Hosts,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host with a random peer id, advertising `addrs`.
    pub fn add_host(&self, addrs: Vec<Multiaddr>) -> MemoryHost {
        self.add_host_with_id(PeerId::random(), addrs)
    }

    pub fn add_host_with_id(&self, id: PeerId, addrs: Vec<Multiaddr>) -> MemoryHost {
        let inner = Arc::new(HostInner {
            id: id.clone(),
            addrs,
            hosts: self.hosts.clone(),
            handlers: RwLock::default(),
            connections: RwLock::default(),
            peerstore: RwLock::default(),
            history: RwLock::default(),
            subscribers: Mutex::default(),
            inbound: Mutex::default(),
            streams_opened: AtomicUsize::new(0),
        });

        write(&self.hosts).insert(id, Arc::downgrade(&inner));

        MemoryHost { inner }
    }
}

#[derive(Clone)]
/// A [Host] living in a [MemoryNetwork].
pub struct MemoryHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    id: PeerId,
    addrs: Vec<Multiaddr>,
    hosts: Hosts,
    handlers: RwLock<HashMap<ProtocolId, StreamHandler>>,
    connections: RwLock<HashSet<PeerId>>,
    /// Peer => address => expiry.
    peerstore: RwLock<HashMap<PeerId, HashMap<Multiaddr, Instant>>>,
    /// Connectedness of peers we are no longer connected to.
    history: RwLock<HashMap<PeerId, Connectedness>>,
    subscribers: Mutex<Vec<Sender<HostEvent>>>,
    inbound: Mutex<Vec<(ProtocolId, Weak<StreamControl>)>>,
    streams_opened: AtomicUsize,
}

impl MemoryHost {
    // === Getters ===

    /// Number of outbound streams this host opened so far.
    pub fn streams_opened(&self) -> usize {
        self.inner.streams_opened.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.is_connected(peer)
    }

    // === Public Methods ===

    /// Close the connection to `peer`, open streams keep working until closed.
    pub fn disconnect(&self, peer: &PeerId) {
        let removed = write(&self.inner.connections).remove(peer);

        if let Some(remote) = self.inner.lookup(peer) {
            write(&remote.connections).remove(&self.inner.id);
            if removed {
                remote.forget(&self.inner.id);
            }
        }

        if removed {
            self.inner.forget(peer);
        }
    }
}

impl HostInner {
    fn lookup(&self, peer: &PeerId) -> Option<Arc<HostInner>> {
        read(&self.hosts).get(peer).and_then(Weak::upgrade)
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        read(&self.connections).contains(peer)
    }

    fn emit(&self, event: HostEvent) {
        trace!(context = "memory_host", id = ?self.id, ?event);

        lock(&self.subscribers).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Record a new connection to `remote` on both ends.
    fn link(&self, remote: &HostInner) {
        let new = write(&self.connections).insert(remote.id.clone());
        write(&remote.connections).insert(self.id.clone());

        if !new {
            return;
        }

        self.add_addrs(&remote.id, &remote.addrs, CONNECTED_ADDR_TTL);
        remote.add_addrs(&self.id, &self.addrs, CONNECTED_ADDR_TTL);

        write(&self.history).remove(&remote.id);
        write(&remote.history).remove(&self.id);

        self.emit(HostEvent::PeerIdentified(remote.id.clone()));
        remote.emit(HostEvent::PeerIdentified(self.id.clone()));
    }

    /// Bookkeeping after the connection to `peer` went away.
    fn forget(&self, peer: &PeerId) {
        write(&self.history).insert(peer.clone(), Connectedness::CanConnect);

        self.emit(HostEvent::PeerDisconnected(peer.clone()));
    }

    fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration) {
        let expiry = Instant::now() + ttl;
        let mut peerstore = write(&self.peerstore);
        let known = peerstore.entry(peer.clone()).or_default();

        for addr in addrs {
            let entry = known.entry(addr.clone()).or_insert(expiry);
            *entry = (*entry).max(expiry);
        }
    }

    /// Tell connected peers that our protocols changed.
    fn notify_protocols_updated(&self) {
        let connections: Vec<PeerId> = read(&self.connections).iter().cloned().collect();

        for peer in connections {
            if let Some(remote) = self.lookup(&peer) {
                remote.emit(HostEvent::ProtocolsUpdated(self.id.clone()));
            }
        }
    }
}

impl Host for MemoryHost {
    fn id(&self) -> &PeerId {
        &self.inner.id
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        self.inner.addrs.clone()
    }

    fn new_stream(&self, peer: &PeerId, protocols: &[ProtocolId]) -> Result<BoxStream> {
        if !self.inner.is_connected(peer) {
            let addrs = self.peer_addrs(peer);
            if addrs.is_empty() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "no addresses for peer").into());
            }

            self.connect(&PeerInfo::new(peer.clone(), addrs))?;
        }

        let remote = self
            .inner
            .lookup(peer)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionReset))?;

        let (protocol, handler) = {
            let handlers = read(&remote.handlers);

            protocols
                .iter()
                .find_map(|p| handlers.get(p).map(|h| (p.clone(), h.clone())))
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "protocols not supported")
                })?
        };

        let (outbound, inbound) =
            MemoryStream::pair(self.inner.id.clone(), peer.clone(), protocol.clone());

        self.inner.streams_opened.fetch_add(1, Ordering::SeqCst);

        {
            let mut streams = lock(&remote.inbound);
            streams.retain(|(_, control)| control.strong_count() > 0);
            streams.push((protocol, Arc::downgrade(&inbound.control)));
        }

        thread::Builder::new()
            .name("kadnode-memory-stream".to_string())
            .spawn(move || handler(Box::new(inbound)))?;

        Ok(Box::new(outbound))
    }

    fn set_stream_handler(&self, protocol: &ProtocolId, handler: StreamHandler) {
        write(&self.inner.handlers).insert(protocol.clone(), handler);

        self.inner.notify_protocols_updated();
    }

    fn remove_stream_handler(&self, protocol: &ProtocolId) {
        let removed = write(&self.inner.handlers).remove(protocol).is_some();

        if removed {
            self.inner.notify_protocols_updated();
        }
    }

    fn reset_streams(&self, protocol: &ProtocolId) {
        let mut streams = lock(&self.inner.inbound);

        streams.retain(|(p, control)| match control.upgrade() {
            Some(control) if p == protocol => {
                control.reset();
                false
            }
            Some(_) => true,
            None => false,
        });
    }

    fn connect(&self, peer: &PeerInfo) -> Result<()> {
        if peer.id == self.inner.id {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "can't dial self").into());
        }

        if peer.has_addrs() {
            self.inner.add_addrs(&peer.id, &peer.addrs, CONNECTED_ADDR_TTL);
        }

        if self.inner.is_connected(&peer.id) {
            return Ok(());
        }

        match self.inner.lookup(&peer.id) {
            Some(remote) => {
                self.inner.link(&remote);
                Ok(())
            }
            None => {
                debug!(context = "memory_host", peer = ?peer.id, "Dial failed");
                write(&self.inner.history).insert(peer.id.clone(), Connectedness::CannotConnect);

                Err(io::Error::from(io::ErrorKind::ConnectionRefused).into())
            }
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        read(&self.inner.connections).iter().cloned().collect()
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if self.inner.is_connected(peer) {
            return Connectedness::Connected;
        }

        read(&self.inner.history)
            .get(peer)
            .copied()
            .unwrap_or_default()
    }

    fn remote_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        if !self.inner.is_connected(peer) {
            return Vec::new();
        }

        self.inner
            .lookup(peer)
            .map(|remote| remote.addrs.clone())
            .unwrap_or_default()
    }

    fn peer_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        if peer == &self.inner.id {
            return self.addrs();
        }

        let now = Instant::now();

        read(&self.inner.peerstore)
            .get(peer)
            .map(|addrs| {
                addrs
                    .iter()
                    .filter(|(_, expiry)| **expiry > now)
                    .map(|(addr, _)| addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn add_peer_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration) {
        self.inner.add_addrs(peer, addrs, ttl)
    }

    fn update_peer_addrs_ttl(&self, peer: &PeerId, ttl: Duration) {
        let expiry = Instant::now() + ttl;

        if let Some(addrs) = write(&self.inner.peerstore).get_mut(peer) {
            for current in addrs.values_mut() {
                *current = (*current).max(expiry);
            }
        }
    }

    fn first_supported_protocol(
        &self,
        peer: &PeerId,
        protocols: &[ProtocolId],
    ) -> Option<ProtocolId> {
        let known = self.inner.is_connected(peer) || read(&self.inner.history).contains_key(peer);
        if !known {
            return None;
        }

        let remote = self.inner.lookup(peer)?;
        let handlers = read(&remote.handlers);

        protocols.iter().find(|p| handlers.contains_key(*p)).cloned()
    }

    fn subscribe(&self) -> Receiver<HostEvent> {
        let (sender, receiver) = flume::unbounded();

        lock(&self.inner.subscribers).push(sender);

        receiver
    }
}

impl Debug for MemoryHost {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHost")
            .field("id", &self.inner.id)
            .field("addrs", &self.inner.addrs)
            .finish()
    }
}

#[derive(Debug)]
enum Frame {
    Data(Bytes),
    Reset,
}

#[derive(Debug)]
/// Reset signal shared between a stream and its host.
struct StreamControl {
    signal: Mutex<Option<Sender<()>>>,
    reset: Receiver<()>,
}

impl StreamControl {
    fn new() -> Arc<Self> {
        let (signal, reset) = flume::bounded(0);

        Arc::new(StreamControl {
            signal: Mutex::new(Some(signal)),
            reset,
        })
    }

    fn reset(&self) {
        lock(&self.signal).take();
    }

    fn is_reset(&self) -> bool {
        self.reset.is_disconnected()
    }
}

#[derive(Debug)]
/// One end of an in-memory stream.
pub struct MemoryStream {
    remote: PeerId,
    protocol: ProtocolId,
    outgoing: Option<Sender<Frame>>,
    incoming: Receiver<Frame>,
    buffered: Bytes,
    read_timeout: Option<Duration>,
    control: Arc<StreamControl>,
}

enum Wake {
    Data(Bytes),
    Eof,
    Reset,
    TimedOut,
}

impl MemoryStream {
    /// Returns the dialer's end and the listener's end.
    fn pair(dialer: PeerId, listener: PeerId, protocol: ProtocolId) -> (Self, Self) {
        let (to_listener, from_dialer) = flume::unbounded();
        let (to_dialer, from_listener) = flume::unbounded();

        let outbound = MemoryStream {
            remote: listener,
            protocol: protocol.clone(),
            outgoing: Some(to_listener),
            incoming: from_listener,
            buffered: Bytes::new(),
            read_timeout: None,
            control: StreamControl::new(),
        };

        let inbound = MemoryStream {
            remote: dialer,
            protocol,
            outgoing: Some(to_dialer),
            incoming: from_dialer,
            buffered: Bytes::new(),
            read_timeout: None,
            control: StreamControl::new(),
        };

        (outbound, inbound)
    }

    fn abort(&mut self) {
        self.control.reset();
        self.buffered.clear();

        if let Some(outgoing) = self.outgoing.take() {
            let _ = outgoing.send(Frame::Reset);
        }
    }

    fn reset_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.control.is_reset() {
                self.abort();
                return Err(Self::reset_error());
            }

            if !self.buffered.is_empty() || buf.is_empty() {
                let n = buf.len().min(self.buffered.len());
                buf[..n].copy_from_slice(&self.buffered[..n]);
                self.buffered.advance(n);

                return Ok(n);
            }

            let selector = Selector::new()
                .recv(&self.incoming, |frame| match frame {
                    Ok(Frame::Data(bytes)) => Wake::Data(bytes),
                    Ok(Frame::Reset) => Wake::Reset,
                    Err(_) => Wake::Eof,
                })
                .recv(&self.control.reset, |_| Wake::Reset);

            let wake = match self.read_timeout {
                Some(timeout) => selector.wait_timeout(timeout).unwrap_or(Wake::TimedOut),
                None => selector.wait(),
            };

            match wake {
                Wake::Data(bytes) => self.buffered = bytes,
                Wake::Eof => return Ok(0),
                Wake::Reset => self.control.reset(),
                Wake::TimedOut => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                }
            }
        }
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.control.is_reset() {
            self.abort();
            return Err(Self::reset_error());
        }

        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"))?;

        outgoing
            .send(Frame::Data(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Stream for MemoryStream {
    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn protocol(&self) -> &ProtocolId {
        &self.protocol
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn reset(&mut self) {
        self.abort()
    }

    fn close(&mut self) {
        self.outgoing.take();
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
