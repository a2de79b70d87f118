#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
pub mod common;
pub mod config;
mod dht;
mod error;
pub mod filters;
pub mod net;
pub mod routing;
pub mod rpc;
pub mod store;
pub mod sync;

pub use crate::common::{Key, Message, MessageType, PeerId, PeerInfo, Record};
pub use bytes::Bytes;
pub use config::{Config, Mode};
pub use dht::{Dht, DhtBuilder};
pub use error::{Error, RejectReason, Result};
