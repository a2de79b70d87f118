//! Dht node.

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, Selector, Sender};
use rand::seq::SliceRandom;
use tracing::{debug, info, trace, warn};

use crate::common::{KBucketTable, PeerId, PeerInfo, Record, RoutingTable};
use crate::config::{Config, Mode};
use crate::filters::{QueryFilter, RouteCache, RouteTable, RoutingTableFilter};
use crate::net::{BoxStream, Host, HostEvent, MessageSender, MessageSenderImpl, ProtocolId, StreamHandler};
use crate::routing::{AddPeerRequest, AdmissionLoop, NoRefresh, RefreshManager, RoutingEvent};
use crate::rpc::{
    handle_new_stream, GetProvidersResponse, GetValueResponse, ProtocolMessenger, RpcHandlers,
    StreamService,
};
use crate::store::{
    Datastore, MemoryDatastore, MemoryProviderStore, NamespacedValidator, ProviderStore, Validator,
};
use crate::sync::{CancelHandle, CancelToken};
use crate::Result;

#[derive(Clone)]
/// A kad-DHT node on top of a [Host].
///
/// Cloning is cheap, all clones share the same node. The node stops its
/// background threads when [Dht::close] is called or the last clone is dropped.
pub struct Dht(Arc<DhtInner>);

/// Configures and starts a [Dht].
pub struct DhtBuilder {
    host: Arc<dyn Host>,
    config: Config,
    routing_table: Option<Arc<dyn RoutingTable>>,
    datastore: Option<Arc<dyn Datastore>>,
    providers: Option<Arc<dyn ProviderStore>>,
    validator: Option<Arc<dyn Validator>>,
    refresh: Option<Arc<dyn RefreshManager>>,
    routes: Option<Arc<dyn RouteTable>>,
}

impl DhtBuilder {
    /// Replace every setting with `config`.
    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;

        self
    }

    pub fn mode(&mut self, mode: Mode) -> &mut Self {
        self.config.mode = mode;

        self
    }

    /// Only answer requests, see [Mode::Server].
    pub fn server_mode(&mut self) -> &mut Self {
        self.mode(Mode::Server)
    }

    /// Never answer requests, see [Mode::Client].
    pub fn client_mode(&mut self) -> &mut Self {
        self.mode(Mode::Client)
    }

    /// Set the protocol prefix, see [Config::protocol_id].
    pub fn protocol_prefix(&mut self, prefix: &str) -> &mut Self {
        self.config.protocol_prefix = prefix.to_string();

        self
    }

    pub fn bucket_size(&mut self, bucket_size: usize) -> &mut Self {
        self.config.bucket_size = bucket_size;

        self
    }

    /// Set bootstrap peers, used when the routing table is empty.
    pub fn bootstrap(&mut self, peers: &[PeerInfo]) -> &mut Self {
        self.config.bootstrap_peers = peers.to_vec();

        self
    }

    pub fn routing_table_filter(&mut self, filter: RoutingTableFilter) -> &mut Self {
        self.config.routing_table_filter = filter;

        self
    }

    pub fn query_filter(&mut self, filter: QueryFilter) -> &mut Self {
        self.config.query_filter = filter;

        self
    }

    pub fn enable_values(&mut self, enable: bool) -> &mut Self {
        self.config.enable_values = enable;

        self
    }

    pub fn enable_providers(&mut self, enable: bool) -> &mut Self {
        self.config.enable_providers = enable;

        self
    }

    pub fn auto_refresh(&mut self, auto_refresh: bool) -> &mut Self {
        self.config.auto_refresh = auto_refresh;

        self
    }

    pub fn disable_fix_low_peers(&mut self) -> &mut Self {
        self.config.disable_fix_low_peers = true;

        self
    }

    // === Collaborators ===

    /// Defaults to a [KBucketTable].
    pub fn routing_table(&mut self, routing_table: Arc<dyn RoutingTable>) -> &mut Self {
        self.routing_table = Some(routing_table);

        self
    }

    /// Defaults to a [MemoryDatastore].
    pub fn datastore(&mut self, datastore: Arc<dyn Datastore>) -> &mut Self {
        self.datastore = Some(datastore);

        self
    }

    /// Defaults to a [MemoryProviderStore].
    pub fn provider_store(&mut self, providers: Arc<dyn ProviderStore>) -> &mut Self {
        self.providers = Some(providers);

        self
    }

    /// Defaults to an empty [NamespacedValidator], rejecting every record.
    pub fn validator(&mut self, validator: Arc<dyn Validator>) -> &mut Self {
        self.validator = Some(validator);

        self
    }

    /// Defaults to [NoRefresh].
    pub fn refresh_manager(&mut self, refresh: Arc<dyn RefreshManager>) -> &mut Self {
        self.refresh = Some(refresh);

        self
    }

    /// Use `routes` instead of the system routing table.
    pub fn route_table(&mut self, routes: Arc<dyn RouteTable>) -> &mut Self {
        self.routes = Some(routes);

        self
    }

    /// Start the node.
    pub fn build(&self) -> Result<Dht> {
        Dht::start(self)
    }
}

struct DhtInner {
    host: Arc<dyn Host>,
    config: Config,
    protocols: Vec<ProtocolId>,
    mode: RwLock<Mode>,

    routing_table: Arc<dyn RoutingTable>,
    providers: Arc<dyn ProviderStore>,
    refresh: Arc<dyn RefreshManager>,
    handlers: RpcHandlers,
    message_sender: Arc<MessageSenderImpl>,
    messenger: ProtocolMessenger,
    route_cache: RouteCache,

    events: Sender<RoutingEvent>,
    /// Keeps the signal channel open for routing tables without a removal hook.
    _fix_low_peers: Sender<()>,
    cancel: CancelHandle,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Dht {
    /// Create a [DhtBuilder] for a node on `host`.
    pub fn builder(host: Arc<dyn Host>) -> DhtBuilder {
        DhtBuilder {
            host,
            config: Config::default(),
            routing_table: None,
            datastore: None,
            providers: None,
            validator: None,
            refresh: None,
            routes: None,
        }
    }

    /// Start a node on `host` with [Config::default].
    pub fn new(host: Arc<dyn Host>) -> Result<Self> {
        Dht::builder(host).build()
    }

    fn start(builder: &DhtBuilder) -> Result<Self> {
        let config = builder.config.clone();
        let host = builder.host.clone();

        let cancel = CancelHandle::new();
        let token = cancel.token();
        let protocols = vec![config.protocol_id()];

        let routing_table = builder
            .routing_table
            .clone()
            .unwrap_or_else(|| Arc::new(KBucketTable::new(host.id(), config.bucket_size)));
        let datastore = builder
            .datastore
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryDatastore::new()));
        let providers = builder
            .providers
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryProviderStore::new(host.clone())));
        let validator = builder
            .validator
            .clone()
            .unwrap_or_else(|| Arc::new(NamespacedValidator::new()));
        let refresh = builder
            .refresh
            .clone()
            .unwrap_or_else(|| Arc::new(NoRefresh));

        let route_cache = match builder.routes.clone() {
            Some(routes) => RouteCache::with_loader(config.route_cache_ttl, move || routes.clone()),
            None => RouteCache::new(config.route_cache_ttl),
        };

        let message_sender = Arc::new(MessageSenderImpl::new(
            host.clone(),
            protocols.clone(),
            &config,
            token.clone(),
        ));

        let (events, events_receiver) = flume::bounded(0);
        let (fix_low_peers, fix_low_peers_receiver) = flume::bounded(1);

        {
            let message_sender = message_sender.clone();
            let fix_low_peers = fix_low_peers.clone();

            routing_table.set_peer_removed_hook(Box::new(move |peer| {
                message_sender.on_disconnect(peer);

                // Non blocking, a pending signal is as good as a new one.
                let _ = fix_low_peers.try_send(());
            }));
        }

        let handlers = RpcHandlers::new(
            host.clone(),
            routing_table.clone(),
            datastore,
            providers.clone(),
            validator,
            &config,
        );

        let inner = Arc::new(DhtInner {
            host: host.clone(),
            protocols,
            mode: RwLock::new(Mode::Client),

            routing_table: routing_table.clone(),
            providers,
            refresh: refresh.clone(),
            handlers,
            messenger: ProtocolMessenger::new(message_sender.clone()),
            message_sender,
            route_cache,

            events,
            _fix_low_peers: fix_low_peers,
            cancel,
            threads: Mutex::new(Vec::new()),

            config: config.clone(),
        });

        let admission = AdmissionLoop::new(routing_table, refresh, &config);
        {
            let token = token.clone();
            inner.spawn("kadnode-admission", move || {
                admission.run(events_receiver, &token)
            })?;
        }

        {
            let weak = Arc::downgrade(&inner);
            let host_events = host.subscribe();
            let token = token.clone();
            inner.spawn("kadnode-host-events", move || {
                run_host_events(weak, host_events, token)
            })?;
        }

        if !config.disable_fix_low_peers {
            let weak = Arc::downgrade(&inner);
            let token = token.clone();
            let interval = config.fix_low_peers_interval;
            inner.spawn("kadnode-fix-low-peers", move || {
                run_fix_low_peers(weak, fix_low_peers_receiver, token, interval)
            })?;
        }

        {
            let weak = Arc::downgrade(&inner);
            let interval = config.peerstore_refresh_interval;
            inner.spawn("kadnode-peerstore", move || {
                run_peerstore_refresh(weak, token, interval)
            })?;
        }

        let dht = Dht(inner);
        dht.set_mode(config.mode);

        info!(id = ?host.id(), protocol = %dht.protocol_id(), mode = ?config.mode, "Dht node started");

        Ok(dht)
    }

    // === Getters ===

    /// Id of the underlying [Host].
    pub fn id(&self) -> &PeerId {
        self.0.host.id()
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.0.host
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn mode(&self) -> Mode {
        *self.0.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn protocol_id(&self) -> &ProtocolId {
        &self.0.protocols[0]
    }

    pub fn routing_table(&self) -> &Arc<dyn RoutingTable> {
        &self.0.routing_table
    }

    /// Number of peers with a live outbound message sender.
    pub fn message_senders(&self) -> usize {
        self.0.message_sender.len()
    }

    // === Public Methods ===

    /// Switch between answering requests and only issuing them.
    ///
    /// Leaving server mode resets every inbound DHT stream.
    pub fn set_mode(&self, mode: Mode) {
        let mut current = self.0.mode.write().unwrap_or_else(PoisonError::into_inner);

        if *current == mode {
            return;
        }

        match mode {
            Mode::Server => {
                for protocol in &self.0.protocols {
                    let weak = Arc::downgrade(&self.0);
                    let idle_timeout = self.0.config.stream_idle_timeout;
                    let max_message_size = self.0.config.max_message_size;

                    let handler: StreamHandler = Arc::new(move |stream: BoxStream| {
                        handle_new_stream(weak.clone(), stream, idle_timeout, max_message_size)
                    });

                    self.0.host.set_stream_handler(protocol, handler);
                }
            }
            Mode::Client => {
                for protocol in &self.0.protocols {
                    self.0.host.remove_stream_handler(protocol);
                    self.0.host.reset_streams(protocol);
                }
            }
        }

        *current = mode;

        info!(?mode, "Switched dht mode");
    }

    /// Stop answering requests and join the background threads.
    pub fn close(&self) {
        self.0.cancel.cancel();

        if self.mode() == Mode::Server {
            for protocol in &self.0.protocols {
                self.0.host.remove_stream_handler(protocol);
                self.0.host.reset_streams(protocol);
            }
        }

        let threads = std::mem::take(
            &mut *self
                .0
                .threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for thread in threads {
            if thread.join().is_err() {
                warn!("Dht background thread panicked");
            }
        }

        info!(id = ?self.id(), "Dht node closed");
    }

    /// Offer `peer` to the routing table.
    ///
    /// `query_peer` marks a peer that just answered one of our queries or sent us one.
    pub fn peer_found(&self, peer: &PeerId, query_peer: bool) {
        self.0.peer_found(peer, query_peer)
    }

    /// A connection to `peer` finished identification.
    pub fn peer_identified(&self, peer: &PeerId) {
        self.0.peer_identified(peer)
    }

    /// The protocols `peer` speaks changed.
    pub fn peer_protocols_updated(&self, peer: &PeerId) {
        self.0.peer_protocols_updated(peer)
    }

    /// The last connection to `peer` was closed.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.0.peer_disconnected(peer)
    }

    /// Tell the admission loop a routing table refresh finished.
    pub fn refresh_completed(&self) {
        self.0.send_event(RoutingEvent::RefreshCompleted);
    }

    /// Refill a routing table that is running low on peers.
    pub fn fix_low_peers(&self) {
        self.0.fix_low_peers()
    }

    /// Record this node as a provider of `key`.
    pub fn provide_locally(&self, key: &[u8]) -> Result<()> {
        let local = PeerInfo::new(self.id().clone(), self.0.host.addrs());

        self.0.providers.add_provider(key, local)
    }

    /// Keep the peers worth querying, according to [Config::query_filter].
    pub fn filter_query_peers(&self, peers: Vec<PeerInfo>) -> Vec<PeerInfo> {
        let filter = self.0.config.query_filter;

        peers.into_iter().filter(|peer| filter.allows(peer)).collect()
    }

    // === Outbound requests ===

    pub fn ping(&self, peer: &PeerId) -> Result<()> {
        self.0.messenger.ping(peer)?;
        self.0.peer_found(peer, true);

        Ok(())
    }

    /// Ask `peer` for the peers it knows closest to `id`, keeping those worth querying.
    pub fn get_closest_peers(&self, peer: &PeerId, id: &PeerId) -> Result<Vec<PeerInfo>> {
        let closer_peers = self.0.messenger.get_closest_peers(peer, id)?;
        self.0.peer_found(peer, true);

        Ok(self.filter_query_peers(closer_peers))
    }

    pub fn get_value(&self, peer: &PeerId, key: &[u8]) -> Result<GetValueResponse> {
        let mut response = self.0.messenger.get_value(peer, key)?;
        self.0.peer_found(peer, true);

        response.closer_peers = self.filter_query_peers(response.closer_peers);

        Ok(response)
    }

    /// Store `value` under `key` on `peer`.
    pub fn put_value(&self, peer: &PeerId, key: &[u8], value: impl Into<Bytes>) -> Result<()> {
        let record = Record::new(Bytes::copy_from_slice(key), value);

        self.0.messenger.put_value(peer, record)?;
        self.0.peer_found(peer, true);

        Ok(())
    }

    pub fn get_providers(&self, peer: &PeerId, key: &[u8]) -> Result<GetProvidersResponse> {
        let mut response = self.0.messenger.get_providers(peer, key)?;
        self.0.peer_found(peer, true);

        response.closer_peers = self.filter_query_peers(response.closer_peers);

        Ok(response)
    }

    /// Announce this node to `peer` as a provider of `key`.
    pub fn put_provider(&self, peer: &PeerId, key: &[u8]) -> Result<()> {
        self.0.messenger.put_provider(peer, key, self.0.host.as_ref())
    }
}

impl Debug for Dht {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dht")
            .field("id", self.id())
            .field("mode", &self.mode())
            .field("routing_table_size", &self.0.routing_table.size())
            .finish()
    }
}

impl DhtInner {
    fn spawn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(f)?;

        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);

        Ok(())
    }

    fn token(&self) -> CancelToken {
        self.cancel.token()
    }

    /// Block until the admission loop takes `event`, or the node closes.
    fn send_event(&self, event: RoutingEvent) {
        let token = self.token();

        let sent = Selector::new()
            .send(&self.events, event, |result| result.is_ok())
            .recv(token.receiver(), |_| false)
            .wait();

        if !sent {
            trace!(context = "admission", "Dropped routing event, node is closing");
        }
    }

    /// Whether `peer` may enter the routing table.
    fn valid_rt_peer(&self, peer: &PeerId) -> bool {
        if self
            .host
            .first_supported_protocol(peer, &self.protocols)
            .is_none()
        {
            return false;
        }

        self.config
            .routing_table_filter
            .allows(self.host.as_ref(), &self.route_cache, peer)
    }

    fn peer_identified(&self, peer: &PeerId) {
        trace!(context = "host_events", ?peer, "Peer identified");

        self.peer_found(peer, false);
    }

    fn peer_protocols_updated(&self, peer: &PeerId) {
        if self.valid_rt_peer(peer) {
            self.peer_found(peer, false);
        } else {
            debug!(?peer, "Peer stopped speaking the dht protocol");

            self.send_event(RoutingEvent::RemovePeer(peer.clone()));
        }
    }

    fn peer_disconnected(&self, peer: &PeerId) {
        trace!(context = "host_events", ?peer, "Peer disconnected");

        self.message_sender.on_disconnect(peer);
    }

    fn fix_low_peers(&self) {
        if self.routing_table.size() > self.config.min_rt_refresh_threshold {
            return;
        }

        // Connected peers might be missing from the routing table.
        for peer in self.host.connected_peers() {
            self.peer_found(&peer, false);
        }

        if self.routing_table.is_empty() && !self.config.bootstrap_peers.is_empty() {
            let mut bootstrap_peers = self.config.bootstrap_peers.clone();
            bootstrap_peers.shuffle(&mut rand::thread_rng());

            let mut connected = 0;

            for peer in bootstrap_peers {
                if self.token().is_cancelled() {
                    return;
                }

                match self.host.connect(&peer) {
                    Ok(()) => connected += 1,
                    Err(error) => warn!(peer = ?peer.id, ?error, "Failed to connect to bootstrap peer"),
                }

                if connected == self.config.max_bootstrappers {
                    break;
                }
            }

            debug!(connected, "Connected to bootstrap peers");
        }

        // Identification may not have completed yet, nothing to refresh from.
        if self.routing_table.is_empty() {
            return;
        }

        if self.config.auto_refresh {
            self.refresh.refresh_no_wait();
        }
    }

    /// Keep the addresses of routing table peers around.
    fn refresh_peerstore(&self) {
        let ttl = self.config.recently_connected_addr_ttl;

        for peer in self.routing_table.list_peers() {
            self.host.update_peer_addrs_ttl(&peer, ttl);
        }
    }
}

impl StreamService for DhtInner {
    fn is_server(&self) -> bool {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner) == Mode::Server
    }

    fn handlers(&self) -> &RpcHandlers {
        &self.handlers
    }

    fn peer_found(&self, peer: &PeerId, query_peer: bool) {
        if peer == self.host.id() || !self.valid_rt_peer(peer) {
            return;
        }

        self.send_event(RoutingEvent::AddPeer(AddPeerRequest {
            peer: peer.clone(),
            query_peer,
        }));
    }
}

// === Background threads ===

fn run_host_events(weak: Weak<DhtInner>, events: Receiver<HostEvent>, cancel: CancelToken) {
    loop {
        let event = Selector::new()
            .recv(&events, |result| result.ok())
            .recv(cancel.receiver(), |_| None)
            .wait();

        let Some(event) = event else {
            break;
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };

        match event {
            HostEvent::PeerIdentified(peer) => inner.peer_identified(&peer),
            HostEvent::ProtocolsUpdated(peer) => inner.peer_protocols_updated(&peer),
            HostEvent::PeerDisconnected(peer) => inner.peer_disconnected(&peer),
        }
    }

    debug!("Host events subscriber stopped");
}

fn run_fix_low_peers(
    weak: Weak<DhtInner>,
    signal: Receiver<()>,
    cancel: CancelToken,
    interval: Duration,
) {
    // First run right away.
    let mut next_tick = Instant::now();

    loop {
        let woken = Selector::new()
            .recv(&signal, |result| result.is_ok())
            .recv(cancel.receiver(), |_| false)
            .wait_deadline(next_tick);

        match woken {
            Ok(true) => {}
            Ok(false) => break,
            Err(_) => next_tick = Instant::now() + interval,
        }

        let Some(inner) = weak.upgrade() else {
            break;
        };

        inner.fix_low_peers();
    }

    debug!("Fix low peers loop stopped");
}

fn run_peerstore_refresh(weak: Weak<DhtInner>, cancel: CancelToken, interval: Duration) {
    while cancel.sleep(interval) {
        let Some(inner) = weak.upgrade() else {
            break;
        };

        inner.refresh_peerstore();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use multiaddr::Multiaddr;

    use super::*;
    use crate::net::{MemoryHost, MemoryNetwork};

    fn addr(i: u8) -> Multiaddr {
        format!("/ip4/10.0.4.{i}/tcp/4001").parse().unwrap()
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let start = Instant::now();

        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(5), "condition never met");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn node(network: &MemoryNetwork, i: u8) -> (MemoryHost, DhtBuilder) {
        let host = network.add_host(vec![addr(i)]);
        let builder = Dht::builder(Arc::new(host.clone()));

        (host, builder)
    }

    #[derive(Default)]
    struct CountingRefresh(AtomicUsize);

    impl RefreshManager for CountingRefresh {
        fn refresh_no_wait(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn builder_defaults() {
        let network = MemoryNetwork::new();
        let (_, builder) = node(&network, 1);

        let dht = builder.build().unwrap();

        assert_eq!(dht.mode(), Mode::Server);
        assert_eq!(dht.protocol_id().as_str(), "/ipfs/kad/1.0.0");
        assert!(dht.routing_table().is_empty());

        dht.close();
    }

    #[test]
    fn connected_servers_enter_routing_table() {
        let network = MemoryNetwork::new();
        let (a_host, a) = node(&network, 1);
        let (b_host, b) = node(&network, 2);

        let a = a.build().unwrap();
        let b = b.build().unwrap();

        a_host
            .connect(&PeerInfo::new(b_host.id().clone(), vec![]))
            .unwrap();

        wait_until(|| a.routing_table().size() == 1 && b.routing_table().size() == 1);

        assert_eq!(a.routing_table().list_peers(), vec![b.id().clone()]);

        a.close();
        b.close();
    }

    #[test]
    fn clients_stay_out_of_routing_table() {
        let network = MemoryNetwork::new();
        let (client_host, mut client) = node(&network, 1);
        let (server_host, server) = node(&network, 2);

        let client = client.client_mode().build().unwrap();
        let server = server.build().unwrap();

        client_host
            .connect(&PeerInfo::new(server_host.id().clone(), vec![]))
            .unwrap();

        wait_until(|| client.routing_table().size() == 1);

        client.ping(server.id()).unwrap();

        assert!(server.routing_table().is_empty());

        client.close();
        server.close();
    }

    #[test]
    fn switching_to_client_removes_from_routing_tables() {
        let network = MemoryNetwork::new();
        let (a_host, a) = node(&network, 1);
        let (b_host, b) = node(&network, 2);

        let a = a.build().unwrap();
        let b = b.build().unwrap();

        a_host
            .connect(&PeerInfo::new(b_host.id().clone(), vec![]))
            .unwrap();
        wait_until(|| a.routing_table().size() == 1);

        b.set_mode(Mode::Client);
        assert_eq!(b.mode(), Mode::Client);

        wait_until(|| a.routing_table().is_empty());
        assert!(a.ping(b.id()).is_err());

        b.set_mode(Mode::Server);
        wait_until(|| a.routing_table().size() == 1);
        a.ping(b.id()).unwrap();

        a.close();
        b.close();
    }

    #[test]
    fn fix_low_peers_connects_to_bootstrap_peers() {
        let network = MemoryNetwork::new();
        let (bootstrap_host, bootstrap) = node(&network, 1);
        let (_, mut joiner) = node(&network, 2);

        let bootstrap = bootstrap.build().unwrap();

        let refresh = Arc::new(CountingRefresh::default());
        let joiner = joiner
            .bootstrap(&[
                PeerInfo::new(PeerId::random(), vec![addr(9)]),
                PeerInfo::new(bootstrap_host.id().clone(), vec![addr(1)]),
            ])
            .refresh_manager(refresh.clone())
            .build()
            .unwrap();

        wait_until(|| joiner.routing_table().size() == 1);
        assert_eq!(joiner.routing_table().list_peers(), vec![bootstrap.id().clone()]);

        joiner.fix_low_peers();
        assert!(refresh.0.load(Ordering::SeqCst) >= 1);

        joiner.close();
        bootstrap.close();
    }

    #[test]
    fn provide_locally() {
        let network = MemoryNetwork::new();
        let (a_host, a) = node(&network, 1);
        let (_, b) = node(&network, 2);

        let a = a.build().unwrap();
        let b = b.build().unwrap();

        b.provide_locally(b"content").unwrap();

        a_host
            .connect(&PeerInfo::new(b.id().clone(), vec![]))
            .unwrap();

        let response = a.get_providers(b.id(), b"content").unwrap();

        assert_eq!(response.providers.len(), 1);
        assert_eq!(&response.providers[0].id, b.id());
        assert_eq!(response.providers[0].addrs, vec![addr(2)]);

        a.close();
        b.close();
    }

    #[test]
    fn peerstore_keeps_routing_table_addrs() {
        let network = MemoryNetwork::new();
        let (host, mut builder) = node(&network, 1);

        let in_table = PeerId::random();
        let elsewhere = PeerId::random();

        let routing_table = Arc::new(KBucketTable::new(host.id(), 20));
        routing_table.try_add_peer(&in_table, true, false).unwrap();

        let short_ttl = Duration::from_millis(200);
        host.add_peer_addrs(&in_table, &[addr(7)], short_ttl);
        host.add_peer_addrs(&elsewhere, &[addr(8)], short_ttl);

        let dht = builder
            .config(Config {
                peerstore_refresh_interval: Duration::from_millis(20),
                recently_connected_addr_ttl: Duration::from_secs(5),
                ..Default::default()
            })
            .disable_fix_low_peers()
            .routing_table(routing_table)
            .build()
            .unwrap();

        wait_until(|| host.peer_addrs(&elsewhere).is_empty());

        assert_eq!(host.peer_addrs(&in_table), vec![addr(7)]);

        dht.close();
    }

    #[test]
    fn filter_query_peers() {
        let network = MemoryNetwork::new();
        let (_, mut builder) = node(&network, 1);

        let dht = builder.query_filter(QueryFilter::Public).build().unwrap();

        let public = PeerInfo::new(PeerId::random(), vec!["/ip4/1.1.1.1/tcp/1".parse().unwrap()]);
        let private = PeerInfo::new(PeerId::random(), vec![addr(3)]);

        assert_eq!(dht.filter_query_peers(vec![public.clone(), private]), vec![public]);

        dht.close();
    }

    #[test]
    fn close_joins_threads() {
        let network = MemoryNetwork::new();
        let (_, builder) = node(&network, 1);

        let dht = builder.build().unwrap();
        let clone = dht.clone();

        dht.close();
        // Idempotent.
        clone.close();

        assert!(dht.0.threads.lock().unwrap().is_empty());
    }
}
