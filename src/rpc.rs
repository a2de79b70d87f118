//! Serving kad-DHT requests, and sending them.

mod handlers;
mod messenger;
mod stream;

pub use handlers::*;
pub use messenger::*;
pub use stream::*;
