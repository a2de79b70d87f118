//! Single-hop kad-DHT requests to one peer.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::common::{Message, MessageType, PeerId, PeerInfo, Record};
use crate::net::{Host, MessageSender};
use crate::{Error, Result};

/// Result of a GET_VALUE request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetValueResponse {
    pub record: Option<Record>,
    pub closer_peers: Vec<PeerInfo>,
}

/// Result of a GET_PROVIDERS request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetProvidersResponse {
    pub providers: Vec<PeerInfo>,
    pub closer_peers: Vec<PeerInfo>,
}

#[derive(Clone)]
/// Sends kad-DHT requests and checks that the responses answer them.
pub struct ProtocolMessenger {
    sender: Arc<dyn MessageSender>,
}

impl ProtocolMessenger {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self { sender }
    }

    pub fn ping(&self, peer: &PeerId) -> Result<()> {
        let request = Message::new(MessageType::Ping, Bytes::new(), 0);

        let response = self.sender.send_request(peer, &request)?;

        if response.message_type != MessageType::Ping {
            return Err(Error::UnexpectedResponse("ping got a different message type"));
        }

        Ok(())
    }

    /// Peers `peer` knows that are close to `id`.
    pub fn get_closest_peers(&self, peer: &PeerId, id: &PeerId) -> Result<Vec<PeerInfo>> {
        let request = Message::new(MessageType::FindNode, id.to_vec(), 0);

        let response = self.sender.send_request(peer, &request)?;

        Ok(response.closer_peers)
    }

    pub fn get_value(&self, peer: &PeerId, key: &[u8]) -> Result<GetValueResponse> {
        let request = Message::new(MessageType::GetValue, Bytes::copy_from_slice(key), 0);

        let response = self.sender.send_request(peer, &request)?;

        if let Some(record) = &response.record {
            // The record itself is not validated here.
            if record.key != key {
                debug!(?peer, "Received incorrect record");
                return Err(Error::UnexpectedResponse("incorrect record"));
            }
        }

        Ok(GetValueResponse {
            record: response.record,
            closer_peers: response.closer_peers,
        })
    }

    /// Store `record` on `peer`.
    pub fn put_value(&self, peer: &PeerId, record: Record) -> Result<()> {
        let request =
            Message::new(MessageType::PutValue, record.key.clone(), 0).with_record(record);

        let response = self.sender.send_request(peer, &request)?;

        let echoed = response.record.as_ref().map(|r| &r.value);
        if echoed != request.record.as_ref().map(|r| &r.value) {
            debug!(?peer, "Value not put correctly");
            return Err(Error::UnexpectedResponse("value not put correctly"));
        }

        Ok(())
    }

    pub fn get_providers(&self, peer: &PeerId, key: &[u8]) -> Result<GetProvidersResponse> {
        let request = Message::new(MessageType::GetProviders, Bytes::copy_from_slice(key), 0);

        let response = self.sender.send_request(peer, &request)?;

        Ok(GetProvidersResponse {
            providers: response.provider_peers,
            closer_peers: response.closer_peers,
        })
    }

    /// Announce `host` as a provider of `key` to `peer`, without waiting for an answer.
    pub fn put_provider(&self, peer: &PeerId, key: &[u8], host: &dyn Host) -> Result<()> {
        let addrs = host.addrs();
        if addrs.is_empty() {
            return Err(Error::NoAddresses);
        }

        let mut request = Message::new(MessageType::AddProvider, Bytes::copy_from_slice(key), 0);
        request.provider_peers = vec![PeerInfo::new(host.id().clone(), addrs)];

        self.sender.send_message(peer, &request)
    }
}

impl std::fmt::Debug for ProtocolMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolMessenger").finish_non_exhaustive()
    }
}
