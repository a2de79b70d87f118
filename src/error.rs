//! Main Crate Error

use std::io;

use crate::common::MessageType;

/// Alias for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    // === Protocol errors ===
    /// An inbound or outbound frame announced more bytes than allowed.
    #[error("Message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// The frame body is not a valid protobuf message.
    #[error("Failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i32),

    /// This node does not serve this message type (for example values are disabled).
    #[error("Unsupported message type: {0:?}")]
    UnsupportedMessageType(MessageType),

    #[error("Invalid peer id of {0} bytes")]
    InvalidPeerId(usize),

    #[error("Invalid base58 peer id: {0}")]
    InvalidPeerIdString(#[from] bs58::decode::Error),

    #[error("Request key is empty")]
    EmptyKey,

    #[error("Request key of {size} bytes exceeds the maximum of {max} bytes")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Put key doesn't match record key")]
    RecordKeyMismatch,

    #[error("Request carries no record")]
    MissingRecord,

    /// A response didn't answer the request it was sent for.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(&'static str),

    /// This node has no addresses to advertise.
    #[error("No known addresses for self, cannot put provider")]
    NoAddresses,

    // === Transient I/O errors ===
    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] io::Error),

    /// The remote peer did not answer within the read timeout.
    #[error("Timed out reading response")]
    ReadTimeout,

    #[error("Message sender has been invalidated")]
    SenderInvalidated,

    /// Waiting was cancelled because the node is shutting down.
    #[error("Operation cancelled")]
    Cancelled,

    /// A deadline passed before a lock could be acquired.
    #[error("Timed out waiting for lock")]
    Timeout,

    // === Validation rejections ===
    #[error("Record rejected: {0}")]
    Rejected(#[from] RejectReason),

    // === Collaborators ===
    #[error("Datastore error: {0}")]
    Datastore(String),

    #[error("Routing table rejected peer: {0}")]
    RoutingTable(#[from] crate::common::RoutingTableError),

    /// The node was closed.
    #[error("Dht node was shut down")]
    Shutdown,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Why a record was rejected, reported without being treated as a system failure.
pub enum RejectReason {
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("old record")]
    OldRecord,
    #[error("select failed: {0}")]
    SelectFailed(String),
}

impl Error {
    /// Returns `true` for errors that leave a stream in an unknown state,
    /// so the stream has to be reset.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ReadTimeout | Error::MessageTooLarge { .. }
        )
    }

    /// Returns `true` if the remote side closed the stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(error) if error.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// Returns `true` if a blocking read gave up because of its deadline.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::ReadTimeout => true,
            Error::Io(error) => matches!(
                error.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
