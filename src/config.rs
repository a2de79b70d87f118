//! Dht configurations.

use std::time::Duration;

use crate::common::{PeerInfo, MAX_BUCKET_SIZE_K};
use crate::filters::{QueryFilter, RoutingTableFilter};
use crate::net::ProtocolId;

/// Default protocol prefix, yielding `/ipfs/kad/1.0.0`.
pub const DEFAULT_PROTOCOL_PREFIX: &str = "/ipfs";
/// Records older than this are treated as absent.
pub const DEFAULT_MAX_RECORD_AGE: Duration = Duration::from_secs(36 * 60 * 60);
/// Largest frame accepted on a stream.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STREAM_REUSE_TRIES: usize = 3;
/// Provider keys are multihashes, anything longer is rejected.
pub const DEFAULT_MAX_PROVIDER_KEY_SIZE: usize = 80;
pub const DEFAULT_BOOTSTRAP_REFRESH_THRESHOLD: usize = 2;
pub const DEFAULT_FREEZE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MIN_RT_REFRESH_THRESHOLD: usize = 10;
pub const DEFAULT_MAX_BOOTSTRAPPERS: usize = 2;
pub const DEFAULT_FIX_LOW_PEERS_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_RECENTLY_CONNECTED_ADDR_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_PEERSTORE_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_ROUTE_CACHE_TTL: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Whether this node answers DHT requests.
pub enum Mode {
    /// Only issue queries, never register inbound stream handlers.
    Client,
    #[default]
    /// Serve inbound requests.
    Server,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
/// Dht Configurations
pub struct Config {
    /// Defaults to [Mode::Server]
    pub mode: Mode,
    /// Prefix of the protocol id this node speaks, see [Config::protocol_id].
    ///
    /// Defaults to [DEFAULT_PROTOCOL_PREFIX]
    pub protocol_prefix: String,
    /// K, the number of peers per bucket and per closer peers response.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub bucket_size: usize,
    /// Defaults to [DEFAULT_MAX_RECORD_AGE]
    pub max_record_age: Duration,
    /// Defaults to [DEFAULT_MAX_MESSAGE_SIZE]
    pub max_message_size: usize,
    /// Inbound streams without a request for this long are reset.
    ///
    /// Defaults to [DEFAULT_STREAM_IDLE_TIMEOUT]
    pub stream_idle_timeout: Duration,
    /// How long to wait for a response to an outbound request.
    ///
    /// Defaults to [DEFAULT_READ_TIMEOUT]
    pub read_timeout: Duration,
    /// Successful exchanges on one outbound stream before it is replaced.
    ///
    /// Defaults to [DEFAULT_STREAM_REUSE_TRIES]
    pub stream_reuse_tries: usize,
    /// Defaults to [DEFAULT_MAX_PROVIDER_KEY_SIZE]
    pub max_provider_key_size: usize,
    /// Completed refreshes before arming the routing table freeze.
    ///
    /// Defaults to [DEFAULT_BOOTSTRAP_REFRESH_THRESHOLD]
    pub bootstrap_refresh_threshold: usize,
    /// Delay between arming the freeze and marking all peers irreplaceable.
    ///
    /// Defaults to [DEFAULT_FREEZE_TIMEOUT]
    pub freeze_timeout: Duration,
    /// Routing table size at or below which low-peer recovery kicks in.
    ///
    /// Defaults to [DEFAULT_MIN_RT_REFRESH_THRESHOLD]
    pub min_rt_refresh_threshold: usize,
    /// Bootstrap peers to connect to when the routing table is empty.
    ///
    /// Defaults to [DEFAULT_MAX_BOOTSTRAPPERS]
    pub max_bootstrappers: usize,
    /// Defaults to [DEFAULT_FIX_LOW_PEERS_INTERVAL]
    pub fix_low_peers_interval: Duration,
    /// Defaults to [DEFAULT_PEERSTORE_REFRESH_INTERVAL]
    pub peerstore_refresh_interval: Duration,
    /// TTL given to the addresses of routing table peers.
    ///
    /// Defaults to [DEFAULT_RECENTLY_CONNECTED_ADDR_TTL]
    pub recently_connected_addr_ttl: Duration,
    /// How long a snapshot of the OS routing table is trusted.
    ///
    /// Defaults to [DEFAULT_ROUTE_CACHE_TTL]
    pub route_cache_ttl: Duration,
    /// Serve GET_VALUE and PUT_VALUE.
    ///
    /// Defaults to true
    pub enable_values: bool,
    /// Serve GET_PROVIDERS and ADD_PROVIDER.
    ///
    /// Defaults to true
    pub enable_providers: bool,
    /// Defaults to empty
    #[cfg_attr(feature = "serde", serde(skip))]
    pub bootstrap_peers: Vec<PeerInfo>,
    /// Defaults to [RoutingTableFilter::None]
    pub routing_table_filter: RoutingTableFilter,
    /// Defaults to [QueryFilter::Private]
    pub query_filter: QueryFilter,
    /// Trigger routing table refreshes on our own.
    ///
    /// Defaults to true
    pub auto_refresh: bool,
    /// Defaults to false
    pub disable_fix_low_peers: bool,
}

impl Config {
    /// The kad-DHT protocol id, `{protocol_prefix}/kad/1.0.0`.
    pub fn protocol_id(&self) -> ProtocolId {
        ProtocolId::new(format!("{}/kad/1.0.0", self.protocol_prefix))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Server,
            protocol_prefix: DEFAULT_PROTOCOL_PREFIX.to_string(),
            bucket_size: MAX_BUCKET_SIZE_K,
            max_record_age: DEFAULT_MAX_RECORD_AGE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            stream_reuse_tries: DEFAULT_STREAM_REUSE_TRIES,
            max_provider_key_size: DEFAULT_MAX_PROVIDER_KEY_SIZE,
            bootstrap_refresh_threshold: DEFAULT_BOOTSTRAP_REFRESH_THRESHOLD,
            freeze_timeout: DEFAULT_FREEZE_TIMEOUT,
            min_rt_refresh_threshold: DEFAULT_MIN_RT_REFRESH_THRESHOLD,
            max_bootstrappers: DEFAULT_MAX_BOOTSTRAPPERS,
            fix_low_peers_interval: DEFAULT_FIX_LOW_PEERS_INTERVAL,
            peerstore_refresh_interval: DEFAULT_PEERSTORE_REFRESH_INTERVAL,
            recently_connected_addr_ttl: DEFAULT_RECENTLY_CONNECTED_ADDR_TTL,
            route_cache_ttl: DEFAULT_ROUTE_CACHE_TTL,
            enable_values: true,
            enable_providers: true,
            bootstrap_peers: Vec::new(),
            routing_table_filter: RoutingTableFilter::None,
            query_filter: QueryFilter::Private,
            auto_refresh: true,
            disable_fix_low_peers: false,
        }
    }
}
