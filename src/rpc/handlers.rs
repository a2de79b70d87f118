//! Request handlers

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, info, trace, warn};

use crate::common::{Key, Message, MessageType, PeerId, PeerInfo, Record, RoutingTable};
use crate::config::Config;
use crate::net::Host;
use crate::store::{record_key, Datastore, ProviderStore, Validator};
use crate::{Error, RejectReason, Result};

/// Number of striped locks serializing PUT_VALUE per key.
const PUT_LOCK_STRIPES: usize = 256;

/// Handles one request, `Ok(None)` means no response is sent.
pub type Handler = fn(&RpcHandlers, &PeerId, &Message) -> Result<Option<Message>>;

/// Answers inbound kad-DHT requests from local state.
pub struct RpcHandlers {
    host: Arc<dyn Host>,
    local: PeerId,
    routing_table: Arc<dyn RoutingTable>,
    datastore: Arc<dyn Datastore>,
    providers: Arc<dyn ProviderStore>,
    validator: Arc<dyn Validator>,

    bucket_size: usize,
    max_record_age: Duration,
    max_provider_key_size: usize,
    enable_values: bool,
    enable_providers: bool,

    put_locks: Box<[Mutex<()>]>,
}

impl RpcHandlers {
    pub fn new(
        host: Arc<dyn Host>,
        routing_table: Arc<dyn RoutingTable>,
        datastore: Arc<dyn Datastore>,
        providers: Arc<dyn ProviderStore>,
        validator: Arc<dyn Validator>,
        config: &Config,
    ) -> Self {
        let local = host.id().clone();

        RpcHandlers {
            host,
            local,
            routing_table,
            datastore,
            providers,
            validator,

            bucket_size: config.bucket_size,
            max_record_age: config.max_record_age,
            max_provider_key_size: config.max_provider_key_size,
            enable_values: config.enable_values,
            enable_providers: config.enable_providers,

            put_locks: (0..PUT_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// The handler for `message_type`, `None` if this node doesn't serve it.
    pub fn handler_for(&self, message_type: MessageType) -> Option<Handler> {
        match message_type {
            MessageType::Ping => Some(Self::handle_ping),
            MessageType::FindNode => Some(Self::handle_find_node),
            MessageType::GetValue if self.enable_values => Some(Self::handle_get_value),
            MessageType::PutValue if self.enable_values => Some(Self::handle_put_value),
            MessageType::GetProviders if self.enable_providers => {
                Some(Self::handle_get_providers)
            }
            MessageType::AddProvider if self.enable_providers => Some(Self::handle_add_provider),
            _ => None,
        }
    }

    pub fn handle(&self, from: &PeerId, message: &Message) -> Result<Option<Message>> {
        let handler = self
            .handler_for(message.message_type)
            .ok_or(Error::UnsupportedMessageType(message.message_type))?;

        handler(self, from, message)
    }

    // === Handlers ===

    fn handle_ping(&self, from: &PeerId, message: &Message) -> Result<Option<Message>> {
        trace!(context = "rpc", ?from, "Responding to ping");

        Ok(Some(message.clone()))
    }

    fn handle_find_node(&self, from: &PeerId, message: &Message) -> Result<Option<Message>> {
        if message.key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let mut response = Message::new(MessageType::FindNode, Bytes::new(), message.cluster_level);

        let closest = match PeerId::from_bytes(&message.key) {
            // Looking for us, answer with ourselves.
            Ok(target) if target == self.local => vec![target],
            target => {
                let mut closest = self.better_peers_to_query(message, from, self.bucket_size);

                // Never tell a peer about itself.
                if let Ok(target) = target {
                    if &target != from && !closest.contains(&target) {
                        closest.push(target);
                    }
                }

                closest
            }
        };

        response.closer_peers = self.peer_infos(closest);

        Ok(Some(response))
    }

    fn handle_get_value(&self, from: &PeerId, message: &Message) -> Result<Option<Message>> {
        if message.key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let mut response =
            Message::new(MessageType::GetValue, message.key.clone(), message.cluster_level);

        response.record = self.check_local_datastore(&message.key)?;

        let closer = self.better_peers_to_query(message, from, self.bucket_size);
        response.closer_peers = self.peer_infos(closer);

        Ok(Some(response))
    }

    fn handle_put_value(&self, from: &PeerId, message: &Message) -> Result<Option<Message>> {
        if message.key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let Some(record) = &message.record else {
            return Err(Error::MissingRecord);
        };

        if record.key != message.key {
            debug!(?from, key = %hex::encode(&message.key), request_type = "put_value", "Put key doesn't match record key");
            return Err(Error::RecordKeyMismatch);
        }

        if let Err(reason) = self.validator.validate(&record.key, &record.value) {
            info!(?from, key = %hex::encode(&record.key), ?reason, "Bad record in PUT");
            return Err(RejectReason::InvalidRecord(reason.to_string()).into());
        }

        let ds_key = record_key(&record.key);

        let stripe = usize::from(record.key.last().copied().unwrap_or_default());
        let _guard = self.put_locks[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // The incoming record has to beat the one we have.
        if let Some(existing) = self.get_record_from_datastore(&ds_key)? {
            let values = [record.value.clone(), existing.value];

            match self.validator.select(&record.key, &values) {
                Ok(0) => {}
                Ok(_) => {
                    info!(?from, key = %hex::encode(&record.key), "Record in PUT older than the existing record (ignoring)");
                    return Err(RejectReason::OldRecord.into());
                }
                Err(reason) => {
                    warn!(?from, key = %hex::encode(&record.key), ?reason, "Record passed validation but failed select");
                    return Err(RejectReason::SelectFailed(reason.to_string()).into());
                }
            }
        }

        // Only our own clock is trusted.
        let stored = Record {
            time_received: Some(Utc::now()),
            ..record.clone()
        };

        self.datastore.put(&ds_key, stored.to_bytes().into())?;

        Ok(Some(message.clone()))
    }

    fn handle_get_providers(&self, from: &PeerId, message: &Message) -> Result<Option<Message>> {
        self.check_provider_key(&message.key)?;

        let mut response =
            Message::new(MessageType::GetProviders, message.key.clone(), message.cluster_level);

        response.provider_peers = self
            .providers
            .get_providers(&message.key)?
            .into_iter()
            .map(|provider| {
                let connectedness = self.host.connectedness(&provider.id);
                provider.with_connectedness(connectedness)
            })
            .collect();

        let closer = self.better_peers_to_query(message, from, self.bucket_size);
        response.closer_peers = self.peer_infos(closer);

        Ok(Some(response))
    }

    fn handle_add_provider(&self, from: &PeerId, message: &Message) -> Result<Option<Message>> {
        self.check_provider_key(&message.key)?;

        debug!(?from, key = %hex::encode(&message.key), "Adding provider");

        for provider in &message.provider_peers {
            if &provider.id != from {
                // Providers can only announce themselves.
                debug!(?from, peer = ?provider.id, "Received provider from wrong peer");
                continue;
            }

            if !provider.has_addrs() {
                debug!(?from, "No valid addresses for provider");
                continue;
            }

            let provider = PeerInfo::new(provider.id.clone(), provider.addrs.clone());

            if let Err(error) = self.providers.add_provider(&message.key, provider) {
                error!(?from, ?error, "Failed to store provider record");
            }
        }

        Ok(None)
    }

    // === Private Methods ===

    fn check_provider_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        if key.len() > self.max_provider_key_size {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max: self.max_provider_key_size,
            });
        }

        Ok(())
    }

    /// Up to `count` peers from the routing table that are closer to the key of
    /// `message` than the requester is, never including the requester.
    fn better_peers_to_query(&self, message: &Message, from: &PeerId, count: usize) -> Vec<PeerId> {
        let target = Key::for_bytes(&message.key);
        let closer = self.routing_table.nearest_peers(&target, count);

        let from_distance = from.to_key().distance(&target);
        // The requester is looking up its own id, nobody can be closer.
        let self_lookup = from.to_key() == target;

        let mut filtered = Vec::with_capacity(closer.len());

        for peer in closer {
            if peer == self.local {
                error!(?from, "Attempted to return self as a closer peer");
                debug_assert!(false, "routing table returned the local peer");
                return Vec::new();
            }

            if &peer == from {
                continue;
            }

            if !self_lookup && peer.to_key().distance(&target) >= from_distance {
                continue;
            }

            filtered.push(peer);
        }

        filtered
    }

    /// Addresses and connectedness of `peers`, leaving out those without addresses.
    fn peer_infos(&self, peers: Vec<PeerId>) -> Vec<PeerInfo> {
        peers
            .into_iter()
            .filter_map(|id| {
                let addrs = if id == self.local {
                    self.host.addrs()
                } else {
                    self.host.peer_addrs(&id)
                };

                if addrs.is_empty() {
                    trace!(context = "rpc", peer = ?id, "No addresses on peer being sent");
                    return None;
                }

                let connectedness = self.host.connectedness(&id);

                Some(PeerInfo::new(id, addrs).with_connectedness(connectedness))
            })
            .collect()
    }

    /// The record stored for `key`, unless it is too old or otherwise bad,
    /// in which case it is deleted.
    fn check_local_datastore(&self, key: &[u8]) -> Result<Option<Record>> {
        let ds_key = record_key(key);

        let Some(bytes) = self.datastore.get(&ds_key)? else {
            return Ok(None);
        };

        let record = Record::from_bytes(&bytes).map_err(|error| {
            debug!(key = %hex::encode(key), ?error, "Failed to decode record from datastore");
            error
        })?;

        let bad = match record.time_received {
            None => {
                info!(key = %hex::encode(key), "No receive time set on record, or it was invalid");
                true
            }
            Some(time_received) => {
                let age = (Utc::now() - time_received).to_std().unwrap_or_default();

                if age > self.max_record_age {
                    debug!(key = %hex::encode(key), ?age, "Old record found, tossing");
                    true
                } else if let Err(reason) = self.validator.validate(&record.key, &record.value) {
                    debug!(key = %hex::encode(key), ?reason, "Local record no longer valid, tossing");
                    true
                } else {
                    false
                }
            }
        };

        if bad {
            if let Err(error) = self.datastore.delete(&ds_key) {
                error!(key = %hex::encode(key), ?error, "Failed to delete bad record from datastore");
            }

            return Ok(None);
        }

        Ok(Some(record))
    }

    /// The stored record under `ds_key`, `None` if it is missing, undecodable or
    /// no longer valid. Those get overwritten.
    fn get_record_from_datastore(&self, ds_key: &str) -> Result<Option<Record>> {
        let bytes = match self.datastore.get(ds_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(error) => {
                error!(key = ds_key, ?error, "Error retrieving record from datastore");
                return Err(error);
            }
        };

        let record = match Record::from_bytes(&bytes) {
            Ok(record) => record,
            Err(error) => {
                error!(key = ds_key, ?error, "Failed to decode record from datastore");
                return Ok(None);
            }
        };

        if let Err(reason) = self.validator.validate(&record.key, &record.value) {
            debug!(key = ds_key, ?reason, "Local record verify failed");
            return Ok(None);
        }

        Ok(Some(record))
    }
}

impl Debug for RpcHandlers {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHandlers")
            .field("local", &self.local)
            .field("enable_values", &self.enable_values)
            .field("enable_providers", &self.enable_providers)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use multiaddr::Multiaddr;

    use super::*;
    use crate::common::KBucketTable;
    use crate::net::{MemoryHost, MemoryNetwork};
    use crate::store::{
        MemoryDatastore, MemoryProviderStore, NamespacedValidator, ValidationError,
    };

    /// Accepts non empty values, the greatest value wins.
    struct Greatest;

    impl Validator for Greatest {
        fn validate(&self, _key: &[u8], value: &[u8]) -> std::result::Result<(), ValidationError> {
            if value.is_empty() {
                return Err(ValidationError::Invalid("empty value".to_string()));
            }
            Ok(())
        }

        fn select(
            &self,
            _key: &[u8],
            values: &[Bytes],
        ) -> std::result::Result<usize, ValidationError> {
            let mut best = 0;
            for (i, value) in values.iter().enumerate() {
                if value > &values[best] {
                    best = i;
                }
            }
            Ok(best)
        }
    }

    struct Setup {
        host: MemoryHost,
        routing_table: Arc<KBucketTable>,
        datastore: Arc<MemoryDatastore>,
        handlers: RpcHandlers,
    }

    fn addr(i: usize) -> Multiaddr {
        format!("/ip4/10.0.{}.{}/tcp/4001", i / 250, i % 250)
            .parse()
            .unwrap()
    }

    fn build(
        config: &Config,
        datastore: Arc<dyn Datastore>,
    ) -> (MemoryHost, Arc<KBucketTable>, RpcHandlers) {
        let network = MemoryNetwork::new();
        let host = network.add_host(vec![addr(0)]);
        let host_dyn: Arc<dyn Host> = Arc::new(host.clone());

        let routing_table = Arc::new(KBucketTable::new(host.id(), config.bucket_size));

        let handlers = RpcHandlers::new(
            host_dyn.clone(),
            routing_table.clone(),
            datastore,
            Arc::new(MemoryProviderStore::new(host_dyn)),
            Arc::new(NamespacedValidator::new().with("v", Greatest)),
            config,
        );

        (host, routing_table, handlers)
    }

    fn setup(config: &Config) -> Setup {
        let datastore = Arc::new(MemoryDatastore::new());
        let (host, routing_table, handlers) = build(config, datastore.clone());

        Setup {
            host,
            routing_table,
            datastore,
            handlers,
        }
    }

    /// Add `count` random peers with addresses to the routing table.
    fn populate(setup: &Setup, count: usize) -> Vec<PeerId> {
        (0..count)
            .map(|i| {
                let peer = PeerId::random();
                setup
                    .host
                    .add_peer_addrs(&peer, &[addr(i + 1)], Duration::from_secs(60));
                let _ = setup.routing_table.try_add_peer(&peer, false, true);
                peer
            })
            .collect()
    }

    fn put(key: &[u8], value: &[u8]) -> Message {
        Message::new(MessageType::PutValue, Bytes::copy_from_slice(key), 0)
            .with_record(Record::new(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)))
    }

    fn get(key: &[u8]) -> Message {
        Message::new(MessageType::GetValue, Bytes::copy_from_slice(key), 0)
    }

    fn stored_value(setup: &Setup, key: &[u8]) -> Option<Bytes> {
        setup
            .datastore
            .get(&record_key(key))
            .unwrap()
            .map(|bytes| Record::from_bytes(&bytes).unwrap().value)
    }

    #[test]
    fn ping() {
        let setup = setup(&Config::default());
        let ping = Message::new(MessageType::Ping, Bytes::new(), 3);

        let response = setup.handlers.handle(&PeerId::random(), &ping).unwrap();

        assert_eq!(response, Some(ping));
    }

    #[test]
    fn disabled_handlers() {
        let setup = setup(&Config {
            enable_values: false,
            enable_providers: false,
            ..Default::default()
        });

        assert!(setup.handlers.handler_for(MessageType::Ping).is_some());
        assert!(setup.handlers.handler_for(MessageType::FindNode).is_some());
        assert!(setup.handlers.handler_for(MessageType::AddProvider).is_none());

        assert!(matches!(
            setup.handlers.handle(&PeerId::random(), &get(b"/v/key")),
            Err(Error::UnsupportedMessageType(MessageType::GetValue))
        ));
    }

    #[test]
    fn put_then_get() {
        let setup = setup(&Config::default());
        let from = PeerId::random();

        let request = put(b"/v/key", b"value");
        let response = setup.handlers.handle(&from, &request).unwrap();
        assert_eq!(response, Some(request));

        let response = setup.handlers.handle(&from, &get(b"/v/key")).unwrap().unwrap();
        let record = response.record.unwrap();

        assert_eq!(response.key, Bytes::from_static(b"/v/key"));
        assert_eq!(record.key, Bytes::from_static(b"/v/key"));
        assert_eq!(record.value, Bytes::from_static(b"value"));

        let age = Utc::now() - record.time_received.unwrap();
        assert!(age.num_seconds() < 60);
    }

    #[test]
    fn get_missing_value() {
        let setup = setup(&Config::default());
        populate(&setup, 10);

        let response = setup
            .handlers
            .handle(&PeerId::random(), &get(b"/v/missing"))
            .unwrap()
            .unwrap();

        assert_eq!(response.record, None);
    }

    #[test]
    fn sender_time_is_ignored() {
        let setup = setup(&Config::default());

        let mut request = put(b"/v/key", b"value");
        if let Some(record) = request.record.as_mut() {
            record.time_received = Some(Utc::now() - chrono::Duration::days(30));
        }

        setup.handlers.handle(&PeerId::random(), &request).unwrap();

        let response = setup
            .handlers
            .handle(&PeerId::random(), &get(b"/v/key"))
            .unwrap()
            .unwrap();

        assert_eq!(response.record.unwrap().value, Bytes::from_static(b"value"));
    }

    #[test]
    fn put_key_mismatch() {
        let setup = setup(&Config::default());

        let mut request = put(b"/v/key", b"value");
        request.key = Bytes::from_static(b"/v/other");

        assert!(matches!(
            setup.handlers.handle(&PeerId::random(), &request),
            Err(Error::RecordKeyMismatch)
        ));
        assert!(setup.datastore.is_empty());
    }

    #[test]
    fn put_requires_key_and_record() {
        let setup = setup(&Config::default());
        let from = PeerId::random();

        assert!(matches!(
            setup.handlers.handle(&from, &put(b"", b"value")),
            Err(Error::EmptyKey)
        ));
        assert!(matches!(
            setup
                .handlers
                .handle(&from, &Message::new(MessageType::PutValue, &b"/v/key"[..], 0)),
            Err(Error::MissingRecord)
        ));
        assert!(matches!(
            setup.handlers.handle(&from, &get(b"")),
            Err(Error::EmptyKey)
        ));
    }

    #[test]
    fn put_invalid_record() {
        let setup = setup(&Config::default());
        let from = PeerId::random();

        assert!(matches!(
            setup.handlers.handle(&from, &put(b"/v/key", b"")),
            Err(Error::Rejected(RejectReason::InvalidRecord(_)))
        ));
        assert!(matches!(
            setup.handlers.handle(&from, &put(b"/unknown/key", b"value")),
            Err(Error::Rejected(RejectReason::InvalidRecord(_)))
        ));
        assert!(setup.datastore.is_empty());
    }

    #[test]
    fn put_old_record() {
        let setup = setup(&Config::default());
        let from = PeerId::random();

        setup.handlers.handle(&from, &put(b"/v/key", b"b")).unwrap();

        assert!(matches!(
            setup.handlers.handle(&from, &put(b"/v/key", b"a")),
            Err(Error::Rejected(RejectReason::OldRecord))
        ));
        assert_eq!(stored_value(&setup, b"/v/key"), Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn puts_follow_select() {
        let setup = setup(&Config::default());
        let from = PeerId::random();

        let values: [&[u8]; 6] = [b"3", b"1", b"7", b"5", b"7", b"9"];
        let mut expected: Option<&[u8]> = None;

        for value in values {
            let result = setup.handlers.handle(&from, &put(b"/v/key", value));

            // The incoming record wins ties.
            match expected {
                Some(current) if current > value => assert!(result.is_err()),
                _ => {
                    assert!(result.is_ok());
                    expected = Some(value);
                }
            }
        }

        assert_eq!(stored_value(&setup, b"/v/key"), Some(Bytes::from_static(b"9")));
    }

    #[test]
    fn stale_records_are_purged() {
        let setup = setup(&Config {
            max_record_age: Duration::from_secs(60 * 60),
            ..Default::default()
        });

        let stale = Record {
            time_received: Some(Utc::now() - chrono::Duration::hours(2)),
            ..Record::new(&b"/v/stale"[..], &b"value"[..])
        };
        setup
            .datastore
            .put(&record_key(b"/v/stale"), stale.to_bytes().into())
            .unwrap();

        let response = setup
            .handlers
            .handle(&PeerId::random(), &get(b"/v/stale"))
            .unwrap()
            .unwrap();

        assert_eq!(response.record, None);
        assert!(setup.datastore.is_empty());
    }

    #[test]
    fn records_without_time_are_purged() {
        let setup = setup(&Config::default());

        let record = Record::new(&b"/v/key"[..], &b"value"[..]);
        setup
            .datastore
            .put(&record_key(b"/v/key"), record.to_bytes().into())
            .unwrap();

        let response = setup
            .handlers
            .handle(&PeerId::random(), &get(b"/v/key"))
            .unwrap()
            .unwrap();

        assert_eq!(response.record, None);
        assert!(setup.datastore.is_empty());
    }

    #[test]
    fn find_node() {
        let setup = setup(&Config::default());
        let peers = populate(&setup, 50);

        let from = peers[0].clone();
        let target = PeerId::random();
        let target_key = target.to_key();
        let from_distance = from.to_key().distance(&target_key);

        let request = Message::new(MessageType::FindNode, target.to_vec(), 0);
        let response = setup.handlers.handle(&from, &request).unwrap().unwrap();

        assert!(response.closer_peers.len() <= setup.routing_table.bucket_size());

        for peer in &response.closer_peers {
            assert_ne!(&peer.id, &from);
            assert_ne!(&peer.id, setup.host.id());
            assert!(peer.has_addrs());
            assert!(peer.id.to_key().distance(&target_key) < from_distance);
        }
    }

    #[test]
    fn find_node_self() {
        let setup = setup(&Config::default());
        populate(&setup, 10);

        let request = Message::new(MessageType::FindNode, setup.host.id().to_vec(), 0);
        let response = setup
            .handlers
            .handle(&PeerId::random(), &request)
            .unwrap()
            .unwrap();

        assert_eq!(response.closer_peers.len(), 1);
        assert_eq!(&response.closer_peers[0].id, setup.host.id());
        assert_eq!(response.closer_peers[0].addrs, vec![addr(0)]);
    }

    #[test]
    fn find_node_known_target() {
        let setup = setup(&Config::default());

        // Known to the peerstore, but not in the routing table.
        let target = PeerId::random();
        setup
            .host
            .add_peer_addrs(&target, &[addr(7)], Duration::from_secs(60));

        let request = Message::new(MessageType::FindNode, target.to_vec(), 0);

        let response = setup
            .handlers
            .handle(&PeerId::random(), &request)
            .unwrap()
            .unwrap();
        assert_eq!(response.closer_peers.len(), 1);
        assert_eq!(response.closer_peers[0].id, target);

        // Never tell a peer about itself.
        let response = setup.handlers.handle(&target, &request).unwrap().unwrap();
        assert!(response.closer_peers.is_empty());

        // Unknown targets have no addresses to share.
        let unknown = Message::new(MessageType::FindNode, PeerId::random().to_vec(), 0);
        let response = setup
            .handlers
            .handle(&PeerId::random(), &unknown)
            .unwrap()
            .unwrap();
        assert!(response.closer_peers.is_empty());
    }

    #[test]
    fn get_providers_key_bounds() {
        let setup = setup(&Config::default());
        let from = PeerId::random();

        let empty = Message::new(MessageType::GetProviders, Bytes::new(), 0);
        assert!(matches!(
            setup.handlers.handle(&from, &empty),
            Err(Error::EmptyKey)
        ));

        let large = Message::new(MessageType::GetProviders, vec![1; 81], 0);
        assert!(matches!(
            setup.handlers.handle(&from, &large),
            Err(Error::KeyTooLarge { size: 81, max: 80 })
        ));

        let fits = Message::new(MessageType::GetProviders, vec![1; 80], 0);
        assert!(setup.handlers.handle(&from, &fits).unwrap().is_some());
    }

    #[test]
    fn add_provider_only_for_sender() {
        let setup = setup(&Config::default());

        let from = PeerId::random();
        let spoofed = PeerId::random();
        let key = b"provided".to_vec();

        let mut request = Message::new(MessageType::AddProvider, key.clone(), 0);
        request.provider_peers = vec![
            PeerInfo::new(spoofed.clone(), vec![addr(3)]),
            PeerInfo::new(from.clone(), vec![addr(2)]),
        ];

        assert_eq!(setup.handlers.handle(&from, &request).unwrap(), None);

        let response = setup
            .handlers
            .handle(
                &PeerId::random(),
                &Message::new(MessageType::GetProviders, key, 0),
            )
            .unwrap()
            .unwrap();

        assert_eq!(response.provider_peers.len(), 1);
        assert_eq!(response.provider_peers[0].id, from);
        assert_eq!(response.provider_peers[0].addrs, vec![addr(2)]);
        assert!(setup.host.peer_addrs(&spoofed).is_empty());
    }

    #[test]
    fn add_provider_without_addresses() {
        let setup = setup(&Config::default());

        let from = PeerId::random();
        let mut request = Message::new(MessageType::AddProvider, &b"provided"[..], 0);
        request.provider_peers = vec![PeerInfo::new(from.clone(), vec![])];

        assert_eq!(setup.handlers.handle(&from, &request).unwrap(), None);

        let response = setup
            .handlers
            .handle(
                &from,
                &Message::new(MessageType::GetProviders, &b"provided"[..], 0),
            )
            .unwrap()
            .unwrap();

        assert!(response.provider_peers.is_empty());
    }

    /// Tracks how many puts for one stripe are in progress at once.
    #[derive(Default)]
    struct ConcurrencyDatastore {
        inner: MemoryDatastore,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Datastore for ConcurrencyDatastore {
        fn get(&self, key: &str) -> Result<Option<Bytes>> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            thread::sleep(Duration::from_millis(5));

            self.inner.get(key)
        }

        fn put(&self, key: &str, value: Bytes) -> Result<()> {
            thread::sleep(Duration::from_millis(5));

            let result = self.inner.put(key, value);
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn puts_on_one_stripe_are_serialized() {
        let datastore = Arc::new(ConcurrencyDatastore::default());
        let (_host, _, handlers) = build(&Config::default(), datastore.clone());
        let handlers = Arc::new(handlers);

        // All keys end with the same byte.
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let handlers = handlers.clone();
                thread::spawn(move || {
                    let key = format!("/v/key-{i}-x");
                    handlers
                        .handle(&PeerId::random(), &put(key.as_bytes(), b"value"))
                        .unwrap();
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(datastore.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(datastore.inner.len(), 8);
    }
}
