//! Application hooks of the L2CAP client and server
//!
//! The client builds each request with a [`RequestBuilder`] and passes each
//! answer to a [`ResponseHandler`]. The server passes each request to a
//! [`RequestHandler`] and answers with what its [`ResponseBuilder`] returns.
//! Closures implement the traits directly; [`Defaults`] implements all four
//! with the stock echo behavior.

use crate::gap::BdAddr;
use log::info;

/// Request ending a session
pub const STOP: &[u8] = b"STOP";

/// Server answer to [`STOP`]
pub const STOP_ACK: &[u8] = b"STOP_ACK";

/// Request sent by [`Defaults`]
pub const DEFAULT_REQUEST: &[u8] = b"Request echo.";

/// Response sent by [`Defaults`]
pub const DEFAULT_RESPONSE: &[u8] = b"Response echo.";

/// Connection a server worker is serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Worker slot, from 0 to `max_clients - 1`
    pub slot: usize,
    pub address: BdAddr,
}

/// Strips the NUL padding C peers leave after a string
pub fn trim_nul(message: &[u8]) -> &[u8] {
    let end = message
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |i| i + 1);
    &message[..end]
}

/// True for the [`STOP`] request, NUL padding allowed
pub fn is_stop(message: &[u8]) -> bool {
    trim_nul(message) == STOP
}

/// Builds the payload of each client request
pub trait RequestBuilder: Send {
    /// `kind` is the application-defined request type given to `send`
    fn build_request(&mut self, kind: u8) -> Vec<u8> {
        let _ = kind;
        DEFAULT_REQUEST.to_vec()
    }
}

/// Consumes each response received by the client
pub trait ResponseHandler: Send {
    fn handle_response(&mut self, response: &[u8]) {
        info!("Buffer trace : {}", String::from_utf8_lossy(trim_nul(response)));
    }
}

/// Consumes each request received by the server.
///
/// Shared by every worker of a server.
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, peer: &PeerInfo, request: &[u8]) {
        info!(
            "Buffer trace from {} : {}",
            peer.address,
            String::from_utf8_lossy(trim_nul(request))
        );
    }
}

/// Builds the server answer to a request. An empty answer is not sent.
pub trait ResponseBuilder: Send + Sync {
    fn build_response(&self, peer: &PeerInfo, request: &[u8]) -> Vec<u8> {
        let _ = (peer, request);
        DEFAULT_RESPONSE.to_vec()
    }
}

/// Stock hooks: a fixed request, a fixed response, and logging of whatever
/// is received
#[derive(Debug, Clone, Copy, Default)]
pub struct Defaults;

impl RequestBuilder for Defaults {}
impl ResponseHandler for Defaults {}
impl RequestHandler for Defaults {}
impl ResponseBuilder for Defaults {}

impl<F> RequestBuilder for F
where
    F: FnMut(u8) -> Vec<u8> + Send,
{
    fn build_request(&mut self, kind: u8) -> Vec<u8> {
        self(kind)
    }
}

impl<F> ResponseHandler for F
where
    F: FnMut(&[u8]) + Send,
{
    fn handle_response(&mut self, response: &[u8]) {
        self(response)
    }
}

impl<F> RequestHandler for F
where
    F: Fn(&PeerInfo, &[u8]) + Send + Sync,
{
    fn handle_request(&self, peer: &PeerInfo, request: &[u8]) {
        self(peer, request)
    }
}

impl<F> ResponseBuilder for F
where
    F: Fn(&PeerInfo, &[u8]) -> Vec<u8> + Send + Sync,
{
    fn build_response(&self, peer: &PeerInfo, request: &[u8]) -> Vec<u8> {
        self(peer, request)
    }
}
