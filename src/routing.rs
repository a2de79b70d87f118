//! The single writer of the routing table.
//!
//! Peer observations arrive from many threads, they are funneled through a
//! channel into [AdmissionLoop], which applies them one by one and runs the
//! bootstrap state machine.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use flume::{Receiver, RecvError, Selector};
use tracing::{debug, info, trace};

use crate::common::{PeerId, RoutingTable};
use crate::config::Config;
use crate::sync::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A peer was observed, optionally through a successful query.
pub struct AddPeerRequest {
    pub peer: PeerId,
    pub query_peer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    AddPeer(AddPeerRequest),
    RemovePeer(PeerId),
    /// A routing table refresh finished.
    RefreshCompleted,
}

/// Triggers routing table refreshes.
pub trait RefreshManager: Send + Sync {
    /// Start a refresh without waiting for it.
    fn refresh_no_wait(&self);
}

#[derive(Debug, Default, Clone, Copy)]
/// A [RefreshManager] that never refreshes.
pub struct NoRefresh;

impl RefreshManager for NoRefresh {
    fn refresh_no_wait(&self) {}
}

/// Applies [RoutingEvent]s to the routing table.
pub struct AdmissionLoop {
    routing_table: Arc<dyn RoutingTable>,
    refresh: Arc<dyn RefreshManager>,

    bootstrap_refresh_threshold: usize,
    freeze_timeout: Duration,

    bootstrapping: bool,
    refresh_count: usize,
    /// When the table gets frozen, if armed.
    freeze_at: Option<Instant>,
}

enum Step {
    Event(Result<RoutingEvent, RecvError>),
    Cancelled,
    Freeze,
}

impl AdmissionLoop {
    pub fn new(
        routing_table: Arc<dyn RoutingTable>,
        refresh: Arc<dyn RefreshManager>,
        config: &Config,
    ) -> Self {
        AdmissionLoop {
            routing_table,
            refresh,

            bootstrap_refresh_threshold: config.bootstrap_refresh_threshold,
            freeze_timeout: config.freeze_timeout,

            bootstrapping: false,
            refresh_count: 0,
            freeze_at: None,
        }
    }

    // === Getters ===

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    pub fn is_freeze_armed(&self) -> bool {
        self.freeze_at.is_some()
    }

    // === Public Methods ===

    /// Apply events until `events` is disconnected or `cancel` fires.
    pub fn run(mut self, events: Receiver<RoutingEvent>, cancel: &CancelToken) {
        loop {
            let selector = Selector::new()
                .recv(&events, Step::Event)
                .recv(cancel.receiver(), |_| Step::Cancelled);

            let step = match self.freeze_at {
                Some(deadline) => selector.wait_deadline(deadline).unwrap_or(Step::Freeze),
                None => selector.wait(),
            };

            match step {
                Step::Event(Ok(event)) => self.handle(event),
                Step::Event(Err(_)) | Step::Cancelled => break,
                Step::Freeze => self.freeze(),
            }
        }

        debug!("Routing table admission loop stopped");
    }

    pub fn handle(&mut self, event: RoutingEvent) {
        match event {
            RoutingEvent::AddPeer(request) => self.add_peer(request),
            RoutingEvent::RemovePeer(peer) => {
                trace!(context = "admission", ?peer, "Removing peer");
                self.routing_table.remove_peer(&peer);
            }
            RoutingEvent::RefreshCompleted => self.refresh_completed(),
        }
    }

    /// Stop newcomers from evicting the current peers.
    pub fn freeze(&mut self) {
        info!(size = self.routing_table.size(), "Freezing routing table");

        self.freeze_at = None;
        self.routing_table.mark_all_peers_irreplaceable();
    }

    // === Private Methods ===

    fn add_peer(&mut self, AddPeerRequest { peer, query_peer }: AddPeerRequest) {
        if self.routing_table.is_empty() {
            self.bootstrapping = true;
            self.refresh_count = 0;
            self.freeze_at = None;
        }

        // Peers admitted while bootstrapping may be replaced later.
        match self
            .routing_table
            .try_add_peer(&peer, query_peer, self.bootstrapping)
        {
            Ok(true) => {
                trace!(context = "admission", ?peer, query_peer, "Peer added to routing table");
            }
            Ok(false) => {
                // Already known, but just answered a query, so it doesn't need a liveness check soon.
                if query_peer {
                    self.routing_table
                        .update_last_successful_outbound_query_at(&peer, SystemTime::now());
                }
            }
            Err(error) => {
                trace!(context = "admission", ?peer, ?error, "Peer not added to routing table");
            }
        }
    }

    fn refresh_completed(&mut self) {
        self.refresh_count += 1;

        if self.refresh_count == self.bootstrap_refresh_threshold {
            self.freeze_at = Some(Instant::now() + self.freeze_timeout);
        }

        if self.bootstrapping {
            debug!("Bootstrap done, refreshing routing table");

            self.bootstrapping = false;
            self.refresh.refresh_no_wait();
        }
    }
}

impl Debug for AdmissionLoop {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLoop")
            .field("bootstrapping", &self.bootstrapping)
            .field("refresh_count", &self.refresh_count)
            .field("freeze_at", &self.freeze_at)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    use super::*;
    use crate::common::{Key, RoutingTableError};
    use crate::sync::CancelHandle;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        TryAdd {
            peer: PeerId,
            query_peer: bool,
            replaceable: bool,
        },
        Remove(PeerId),
        UpdateLastQuery(PeerId),
        Freeze,
    }

    #[derive(Default)]
    struct RecordingTable {
        peers: Mutex<HashSet<PeerId>>,
        calls: Mutex<Vec<Call>>,
        full: bool,
    }

    impl RecordingTable {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RoutingTable for RecordingTable {
        fn nearest_peers(&self, _target: &Key, _count: usize) -> Vec<PeerId> {
            Vec::new()
        }

        fn try_add_peer(
            &self,
            peer: &PeerId,
            query_peer: bool,
            is_replaceable: bool,
        ) -> Result<bool, RoutingTableError> {
            self.calls.lock().unwrap().push(Call::TryAdd {
                peer: peer.clone(),
                query_peer,
                replaceable: is_replaceable,
            });

            if self.full {
                return Err(RoutingTableError::NoCapacity);
            }

            Ok(self.peers.lock().unwrap().insert(peer.clone()))
        }

        fn remove_peer(&self, peer: &PeerId) {
            self.calls.lock().unwrap().push(Call::Remove(peer.clone()));
            self.peers.lock().unwrap().remove(peer);
        }

        fn update_last_successful_outbound_query_at(&self, peer: &PeerId, _at: SystemTime) -> bool {
            self.calls
                .lock()
                .unwrap()
                .push(Call::UpdateLastQuery(peer.clone()));
            self.peers.lock().unwrap().contains(peer)
        }

        fn mark_all_peers_irreplaceable(&self) {
            self.calls.lock().unwrap().push(Call::Freeze);
        }

        fn size(&self) -> usize {
            self.peers.lock().unwrap().len()
        }

        fn list_peers(&self) -> Vec<PeerId> {
            self.peers.lock().unwrap().iter().cloned().collect()
        }
    }

    #[derive(Default)]
    struct CountingRefresh(AtomicUsize);

    impl RefreshManager for CountingRefresh {
        fn refresh_no_wait(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(config: &Config) -> (Arc<RecordingTable>, Arc<CountingRefresh>, AdmissionLoop) {
        let table = Arc::new(RecordingTable::default());
        let refresh = Arc::new(CountingRefresh::default());

        let admission = AdmissionLoop::new(table.clone(), refresh.clone(), config);

        (table, refresh, admission)
    }

    fn add(peer: &PeerId, query_peer: bool) -> RoutingEvent {
        RoutingEvent::AddPeer(AddPeerRequest {
            peer: peer.clone(),
            query_peer,
        })
    }

    #[test]
    fn bootstrap_state() {
        let (table, refresh, mut admission) = setup(&Config::default());
        let a = PeerId::random();
        let b = PeerId::random();

        admission.handle(add(&a, false));
        assert!(admission.is_bootstrapping());

        admission.handle(RoutingEvent::RefreshCompleted);
        assert!(!admission.is_bootstrapping());
        assert_eq!(refresh.0.load(Ordering::SeqCst), 1);

        admission.handle(add(&b, true));

        assert_eq!(
            table.calls(),
            vec![
                Call::TryAdd {
                    peer: a,
                    query_peer: false,
                    replaceable: true
                },
                Call::TryAdd {
                    peer: b,
                    query_peer: true,
                    replaceable: false
                },
            ]
        );

        // Only leaving the bootstrap state triggers a refresh.
        admission.handle(RoutingEvent::RefreshCompleted);
        assert_eq!(refresh.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bump_known_query_peers() {
        let (table, _, mut admission) = setup(&Config::default());
        let a = PeerId::random();

        admission.handle(add(&a, false));
        admission.handle(add(&a, false));
        admission.handle(add(&a, true));

        let updates: Vec<Call> = table
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::UpdateLastQuery(_)))
            .collect();

        assert_eq!(updates, vec![Call::UpdateLastQuery(a)]);
    }

    #[test]
    fn rejected_peers() {
        let table = Arc::new(RecordingTable {
            full: true,
            ..Default::default()
        });
        let mut admission = AdmissionLoop::new(table.clone(), Arc::new(NoRefresh), &Config::default());

        admission.handle(add(&PeerId::random(), true));

        assert_eq!(table.size(), 0);
        assert!(!table
            .calls()
            .iter()
            .any(|call| matches!(call, Call::UpdateLastQuery(_))));
    }

    #[test]
    fn arm_freeze_after_threshold() {
        let (_, _, mut admission) = setup(&Config::default());

        admission.handle(add(&PeerId::random(), false));

        admission.handle(RoutingEvent::RefreshCompleted);
        assert!(!admission.is_freeze_armed());

        admission.handle(RoutingEvent::RefreshCompleted);
        assert!(admission.is_freeze_armed());
    }

    #[test]
    fn empty_table_restarts_bootstrap() {
        let (_, _, mut admission) = setup(&Config::default());
        let a = PeerId::random();

        admission.handle(add(&a, false));
        admission.handle(RoutingEvent::RefreshCompleted);
        admission.handle(RoutingEvent::RefreshCompleted);
        assert!(admission.is_freeze_armed());
        assert!(!admission.is_bootstrapping());

        admission.handle(RoutingEvent::RemovePeer(a));
        admission.handle(add(&PeerId::random(), false));

        assert!(admission.is_bootstrapping());
        assert!(!admission.is_freeze_armed());
    }

    #[test]
    fn freeze_fires_in_loop() {
        let config = Config {
            freeze_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (table, _, admission) = setup(&config);

        let (sender, receiver) = flume::unbounded();
        let cancel = CancelHandle::new();
        let token = cancel.token();

        let handle = thread::spawn(move || admission.run(receiver, &token));

        sender.send(add(&PeerId::random(), false)).unwrap();
        sender.send(RoutingEvent::RefreshCompleted).unwrap();
        sender.send(RoutingEvent::RefreshCompleted).unwrap();

        let start = Instant::now();
        while !table.calls().contains(&Call::Freeze) {
            assert!(start.elapsed() < Duration::from_secs(5), "table never frozen");
            thread::sleep(Duration::from_millis(5));
        }

        cancel.cancel();
        handle.join().unwrap();

        assert_eq!(table.calls().iter().filter(|c| **c == Call::Freeze).count(), 1);
    }

    #[test]
    fn stop_when_events_disconnect() {
        let (table, _, admission) = setup(&Config::default());
        let (sender, receiver) = flume::unbounded();

        let handle = thread::spawn(move || admission.run(receiver, &CancelToken::never()));

        let peer = PeerId::random();
        sender.send(add(&peer, false)).unwrap();
        drop(sender);

        handle.join().unwrap();

        assert_eq!(table.list_peers(), vec![peer]);
    }
}
