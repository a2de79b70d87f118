//! Serving one inbound stream.

use std::sync::Weak;
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::PeerId;
use crate::net::{read_message, write_message, BoxStream};
use crate::rpc::RpcHandlers;

/// What the inbound stream loop needs from the node serving it.
pub trait StreamService: Send + Sync {
    /// Requests are only answered in server mode.
    fn is_server(&self) -> bool;

    fn handlers(&self) -> &RpcHandlers;

    /// `peer` sent us a request.
    fn peer_found(&self, peer: &PeerId, query_peer: bool);
}

/// Answer requests on `stream` one at a time until the remote closes it.
///
/// The stream is reset when it stays idle for `idle_timeout`, on I/O errors,
/// on frames larger than `max_message_size`, and when `service` is gone or
/// no longer in server mode.
pub fn handle_new_stream<S>(
    service: Weak<S>,
    mut stream: BoxStream,
    idle_timeout: Duration,
    max_message_size: usize,
) where
    S: StreamService + ?Sized,
{
    if handle_new_messages(&service, &mut stream, idle_timeout, max_message_size) {
        stream.close();
    } else {
        stream.reset();
    }
}

/// Returns `true` if the stream ended cleanly.
fn handle_new_messages<S>(
    service: &Weak<S>,
    stream: &mut BoxStream,
    idle_timeout: Duration,
    max_message_size: usize,
) -> bool
where
    S: StreamService + ?Sized,
{
    let peer = stream.remote_peer().clone();

    if let Err(error) = stream.set_read_timeout(Some(idle_timeout)) {
        debug!(?peer, ?error, "Failed to set stream idle timeout");
        return false;
    }

    loop {
        let request = match read_message(stream, max_message_size) {
            Ok(request) => request,
            Err(error) if error.is_eof() => return true,
            Err(error) if error.is_timeout() => {
                trace!(context = "stream", ?peer, "Stream idle, resetting");
                return false;
            }
            Err(error) if error.is_io() => {
                debug!(?peer, ?error, "Error reading message");
                return false;
            }
            Err(error) => {
                debug!(?peer, ?error, "Skipping undecodable message");
                continue;
            }
        };

        let Some(service) = service.upgrade() else {
            return false;
        };

        if !service.is_server() {
            debug!(?peer, "Ignoring incoming dht message while not in server mode");
            return false;
        }

        let handlers = service.handlers();

        let Some(handler) = handlers.handler_for(request.message_type) else {
            debug!(?peer, message_type = ?request.message_type, "Can't handle received message");
            continue;
        };

        // A peer has queried us, let's add it to the routing table.
        service.peer_found(&peer, true);

        trace!(context = "stream", ?peer, message_type = ?request.message_type, "Handling message");

        let response = match handler(handlers, &peer, &request) {
            Ok(Some(response)) => response,
            Ok(None) => continue,
            Err(error) => {
                debug!(?peer, ?error, message_type = ?request.message_type, "Error handling message");
                continue;
            }
        };

        if let Err(error) = write_message(stream, &response) {
            debug!(?peer, ?error, "Error writing response");
            return false;
        }
    }
}
