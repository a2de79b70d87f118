//! Miscellaneous common structs used throughout the library.

mod id;
pub mod messages;
mod peer;
mod routing_table;

pub use id::*;
pub use messages::*;
pub use peer::*;
pub use routing_table::*;
