//! Protobuf wire schema of the kad-DHT protocol.

use bytes::Bytes;

#[derive(Clone, PartialEq, prost::Message)]
pub struct DhtRecord {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
    /// RFC 3339 timestamp stamped by the storing node.
    #[prost(string, tag = "5")]
    pub time_received: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DhtPeer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    #[prost(enumeration = "DhtConnectionType", tag = "3")]
    pub connection: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DhtMessage {
    #[prost(enumeration = "DhtMessageType", tag = "1")]
    pub r#type: i32,
    /// Cluster level plus one, so that level 0 is distinguishable from unset.
    #[prost(int32, tag = "10")]
    pub cluster_level_raw: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub key: Bytes,
    #[prost(message, optional, tag = "3")]
    pub record: Option<DhtRecord>,
    #[prost(message, repeated, tag = "8")]
    pub closer_peers: Vec<DhtPeer>,
    #[prost(message, repeated, tag = "9")]
    pub provider_peers: Vec<DhtPeer>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DhtMessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DhtConnectionType {
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}
