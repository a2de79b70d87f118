//! Local state a node serves from: records, provider records and their validation.

mod datastore;
mod providers;
mod validator;

pub use datastore::*;
pub use providers::*;
pub use validator::*;
