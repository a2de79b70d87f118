//! Serialize and deserialize kad-DHT messages.

mod internal;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use multiaddr::Multiaddr;
use prost::Message as _;
use tracing::trace;

use crate::common::{Connectedness, PeerId, PeerInfo};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    PutValue,
    GetValue,
    AddProvider,
    GetProviders,
    FindNode,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A key/value record stored in the DHT.
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
    /// Stamped by the node that stored the record, never trusted from the sender.
    pub time_received: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A kad-DHT request or response.
pub struct Message {
    pub message_type: MessageType,
    pub cluster_level: u16,
    pub key: Bytes,
    pub record: Option<Record>,
    pub closer_peers: Vec<PeerInfo>,
    pub provider_peers: Vec<PeerInfo>,
}

impl Record {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            time_received: None,
        }
    }

    /// Encode this record the way it is persisted in the datastore.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_wire().encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Record> {
        let record = internal::DhtRecord::decode(bytes)?;

        Ok(Record::from_wire(record))
    }

    fn to_wire(&self) -> internal::DhtRecord {
        internal::DhtRecord {
            key: self.key.clone(),
            value: self.value.clone(),
            time_received: self
                .time_received
                .map(|time| time.to_rfc3339_opts(SecondsFormat::Nanos, true))
                .unwrap_or_default(),
        }
    }

    fn from_wire(record: internal::DhtRecord) -> Record {
        Record {
            key: record.key,
            value: record.value,
            // An unparsable timestamp reads as no timestamp at all.
            time_received: DateTime::parse_from_rfc3339(&record.time_received)
                .ok()
                .map(|time| time.with_timezone(&Utc)),
        }
    }
}

impl Message {
    /// Create a message with no record and no peers.
    pub fn new(message_type: MessageType, key: impl Into<Bytes>, cluster_level: u16) -> Self {
        Self {
            message_type,
            cluster_level,
            key: key.into(),
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
        }
    }

    pub fn with_record(mut self, record: Record) -> Self {
        self.record = Some(record);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_wire().encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let message = internal::DhtMessage::decode(bytes)?;

        Message::from_wire(message)
    }

    /// Append the varint length prefix and the encoded message to `buf`.
    pub(crate) fn encode_length_delimited(&self, buf: &mut BytesMut) {
        let wire = self.to_wire();
        buf.reserve(prost::length_delimiter_len(wire.encoded_len()) + wire.encoded_len());
        // Only fails on insufficient capacity, which was reserved above.
        let _ = wire.encode_length_delimited(buf);
    }

    fn to_wire(&self) -> internal::DhtMessage {
        internal::DhtMessage {
            r#type: internal::DhtMessageType::from(self.message_type) as i32,
            cluster_level_raw: i32::from(self.cluster_level) + 1,
            key: self.key.clone(),
            record: self.record.as_ref().map(Record::to_wire),
            closer_peers: peers_to_wire(&self.closer_peers),
            provider_peers: peers_to_wire(&self.provider_peers),
        }
    }

    fn from_wire(message: internal::DhtMessage) -> Result<Message> {
        let message_type = internal::DhtMessageType::try_from(message.r#type)
            .map_err(|_| Error::UnknownMessageType(message.r#type))?;

        Ok(Message {
            message_type: message_type.into(),
            cluster_level: u16::try_from(message.cluster_level_raw.saturating_sub(1).max(0))
                .unwrap_or(u16::MAX),
            key: message.key,
            record: message.record.map(Record::from_wire),
            closer_peers: peers_from_wire(message.closer_peers),
            provider_peers: peers_from_wire(message.provider_peers),
        })
    }
}

impl From<MessageType> for internal::DhtMessageType {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::PutValue => internal::DhtMessageType::PutValue,
            MessageType::GetValue => internal::DhtMessageType::GetValue,
            MessageType::AddProvider => internal::DhtMessageType::AddProvider,
            MessageType::GetProviders => internal::DhtMessageType::GetProviders,
            MessageType::FindNode => internal::DhtMessageType::FindNode,
            MessageType::Ping => internal::DhtMessageType::Ping,
        }
    }
}

impl From<internal::DhtMessageType> for MessageType {
    fn from(value: internal::DhtMessageType) -> Self {
        match value {
            internal::DhtMessageType::PutValue => MessageType::PutValue,
            internal::DhtMessageType::GetValue => MessageType::GetValue,
            internal::DhtMessageType::AddProvider => MessageType::AddProvider,
            internal::DhtMessageType::GetProviders => MessageType::GetProviders,
            internal::DhtMessageType::FindNode => MessageType::FindNode,
            internal::DhtMessageType::Ping => MessageType::Ping,
        }
    }
}

fn peers_to_wire(peers: &[PeerInfo]) -> Vec<internal::DhtPeer> {
    peers
        .iter()
        .map(|peer| internal::DhtPeer {
            id: peer.id.to_vec(),
            addrs: peer.addrs.iter().map(|addr| addr.to_vec()).collect(),
            connection: match peer.connectedness {
                Connectedness::NotConnected => internal::DhtConnectionType::NotConnected,
                Connectedness::Connected => internal::DhtConnectionType::Connected,
                Connectedness::CanConnect => internal::DhtConnectionType::CanConnect,
                Connectedness::CannotConnect => internal::DhtConnectionType::CannotConnect,
            } as i32,
        })
        .collect()
}

/// Peers with an invalid id are dropped, invalid addresses are skipped.
fn peers_from_wire(peers: Vec<internal::DhtPeer>) -> Vec<PeerInfo> {
    peers
        .into_iter()
        .filter_map(|peer| {
            let id = match PeerId::from_bytes(&peer.id) {
                Ok(id) => id,
                Err(error) => {
                    trace!(context = "message_decoding", ?error, "Skipping invalid peer");
                    return None;
                }
            };

            let addrs = peer
                .addrs
                .into_iter()
                .filter_map(|bytes| match Multiaddr::try_from(bytes) {
                    Ok(addr) => Some(addr),
                    Err(error) => {
                        trace!(context = "message_decoding", ?id, ?error, "Skipping invalid address");
                        None
                    }
                })
                .collect();

            let connectedness = match internal::DhtConnectionType::try_from(peer.connection) {
                Ok(internal::DhtConnectionType::Connected) => Connectedness::Connected,
                Ok(internal::DhtConnectionType::CanConnect) => Connectedness::CanConnect,
                Ok(internal::DhtConnectionType::CannotConnect) => Connectedness::CannotConnect,
                _ => Connectedness::NotConnected,
            };

            Some(PeerInfo {
                id,
                addrs,
                connectedness,
            })
        })
        .collect()
}
