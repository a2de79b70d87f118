//! Streams, hosts, framing and the per-peer message senders built on them.

mod codec;
mod host;
mod memory;
mod message_sender;

pub use codec::*;
pub use host::*;
pub use memory::*;
pub use message_sender::*;
