//! One logical request/response channel per remote peer.
//!
//! Every peer gets a [PeerMessageSender] holding at most one open stream.
//! Its lock serializes requests, so there is never more than one request in
//! flight per peer, and a broken stream is replaced and the request retried once.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::common::{Message, PeerId};
use crate::config::Config;
use crate::net::{read_message, write_message, BoxStream, Host, ProtocolId};
use crate::sync::{CancelToken, CtxMutex};
use crate::{Error, Result};

/// Sends DHT messages to peers.
pub trait MessageSender: Send + Sync {
    /// Send `message` and wait for the response.
    fn send_request(&self, peer: &PeerId, message: &Message) -> Result<Message>;

    /// Send `message` without expecting a response.
    fn send_message(&self, peer: &PeerId, message: &Message) -> Result<()>;

    /// Forget about `peer`, closing its stream in the background.
    fn on_disconnect(&self, peer: &PeerId);
}

/// [MessageSender] over streams opened through a [Host].
pub struct MessageSenderImpl {
    host: Arc<dyn Host>,
    protocols: Vec<ProtocolId>,
    senders: DashMap<PeerId, Arc<PeerMessageSender>>,
    read_timeout: Duration,
    max_message_size: usize,
    stream_reuse_tries: usize,
    cancel: CancelToken,
}

struct PeerMessageSender {
    peer: PeerId,
    state: CtxMutex<SenderState>,
}

#[derive(Default)]
struct SenderState {
    stream: Option<BoxStream>,
    /// Set after a fatal error, the sender must not be used anymore.
    invalid: bool,
    /// Successful exchanges on the current stream.
    exchanges: usize,
}

impl MessageSenderImpl {
    pub fn new(
        host: Arc<dyn Host>,
        protocols: Vec<ProtocolId>,
        config: &Config,
        cancel: CancelToken,
    ) -> Self {
        MessageSenderImpl {
            host,
            protocols,
            senders: DashMap::new(),
            read_timeout: config.read_timeout,
            max_message_size: config.max_message_size,
            stream_reuse_tries: config.stream_reuse_tries.max(1),
            cancel,
        }
    }

    /// Number of peers with a live sender.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    fn sender_for_peer(&self, peer: &PeerId) -> Result<Arc<PeerMessageSender>> {
        let sender = self
            .senders
            .entry(peer.clone())
            .or_insert_with(|| {
                Arc::new(PeerMessageSender {
                    peer: peer.clone(),
                    state: CtxMutex::new(SenderState::default()),
                })
            })
            .value()
            .clone();

        if let Err(error) = sender.prep_or_invalidate(self) {
            // Only remove our own sender, a concurrent caller may have replaced it.
            if self
                .senders
                .remove_if(peer, |_, current| Arc::ptr_eq(current, &sender))
                .is_none()
            {
                if let Some(current) = self.senders.get(peer) {
                    return Ok(current.value().clone());
                }
            }

            return Err(error);
        }

        Ok(sender)
    }
}

impl MessageSender for MessageSenderImpl {
    fn send_request(&self, peer: &PeerId, message: &Message) -> Result<Message> {
        let sender = self.sender_for_peer(peer)?;

        let start = Instant::now();
        let response = sender.send_request(self, message)?;
        self.host.record_latency(peer, start.elapsed());

        Ok(response)
    }

    fn send_message(&self, peer: &PeerId, message: &Message) -> Result<()> {
        let sender = self.sender_for_peer(peer)?;

        sender.send_message(self, message)
    }

    fn on_disconnect(&self, peer: &PeerId) {
        let Some((_, sender)) = self.senders.remove(peer) else {
            return;
        };

        let cancel = self.cancel.clone();

        // Waiting for the lock may take as long as an in-flight request.
        let spawned = thread::Builder::new()
            .name("kadnode-sender-teardown".to_string())
            .spawn(move || {
                if let Ok(mut state) = sender.state.lock(&cancel) {
                    state.invalidate();
                }
            });

        if let Err(error) = spawned {
            debug!(?peer, ?error, "Failed to spawn sender teardown");
        }
    }
}

impl PeerMessageSender {
    fn prep_or_invalidate(&self, ctx: &MessageSenderImpl) -> Result<()> {
        let mut state = self.state.lock(&ctx.cancel)?;

        if let Err(error) = state.prep(ctx, &self.peer) {
            state.invalidate();
            return Err(error);
        }

        Ok(())
    }

    fn send_message(&self, ctx: &MessageSenderImpl, message: &Message) -> Result<()> {
        let mut state = self.state.lock(&ctx.cancel)?;
        let mut retried = false;

        loop {
            let stream = state.prep(ctx, &self.peer)?;

            if let Err(error) = write_message(stream, message) {
                state.reset_stream();

                if retried {
                    debug!(peer = ?self.peer, ?error, "Error writing message");
                    return Err(error);
                }

                debug!(peer = ?self.peer, ?error, retrying = true, "Error writing message");
                retried = true;
                continue;
            }

            state.finish_exchange(ctx.stream_reuse_tries);
            return Ok(());
        }
    }

    fn send_request(&self, ctx: &MessageSenderImpl, message: &Message) -> Result<Message> {
        let mut state = self.state.lock(&ctx.cancel)?;
        let mut retried = false;

        loop {
            let stream = state.prep(ctx, &self.peer)?;

            let result = write_message(stream, message).and_then(|_| {
                stream.set_read_timeout(Some(ctx.read_timeout))?;

                read_message(stream, ctx.max_message_size).map_err(|error| {
                    if error.is_timeout() {
                        Error::ReadTimeout
                    } else {
                        error
                    }
                })
            });

            match result {
                Ok(response) => {
                    trace!(context = "message_sender", peer = ?self.peer, ?response);

                    state.finish_exchange(ctx.stream_reuse_tries);
                    return Ok(response);
                }
                Err(error) => {
                    state.reset_stream();

                    if retried {
                        debug!(peer = ?self.peer, ?error, "Error sending request");
                        return Err(error);
                    }

                    debug!(peer = ?self.peer, ?error, retrying = true, "Error sending request");
                    retried = true;
                }
            }
        }
    }
}

impl SenderState {
    /// Make sure there is an open stream, opening one if needed.
    fn prep(&mut self, ctx: &MessageSenderImpl, peer: &PeerId) -> Result<&mut BoxStream> {
        if self.invalid {
            return Err(Error::SenderInvalidated);
        }

        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                // Only speak our primary protocols.
                let stream = ctx.host.new_stream(peer, &ctx.protocols)?;
                self.exchanges = 0;
                stream
            }
        };

        Ok(self.stream.insert(stream))
    }

    fn reset_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.reset();
        }
        self.exchanges = 0;
    }

    /// Count a successful exchange, closing the stream once its budget is spent.
    fn finish_exchange(&mut self, reuse_tries: usize) {
        self.exchanges += 1;

        if self.exchanges >= reuse_tries {
            if let Some(mut stream) = self.stream.take() {
                stream.close();
            }
            self.exchanges = 0;
        }
    }

    fn invalidate(&mut self) {
        self.invalid = true;
        self.reset_stream();
    }
}
