//! L2CAP client
//!
//! A client owns one socket and one receive buffer whose length is fixed
//! at creation. Each `send` writes one request and waits, bounded by a
//! timeout, for one response.

use crate::error::{Error, Result};
use crate::gap::BdAddr;
use crate::l2cap::handler::{RequestBuilder, ResponseHandler};
use crate::l2cap::socket::L2capSocket;
use log::{debug, error, info, warn};
use std::fmt;
use std::time::Duration;

pub struct L2capClient {
    socket: Option<L2capSocket>,
    server: BdAddr,
    psm: u16,
    buffer: Vec<u8>,
    received: usize,
    connected: bool,
    response_handler: Box<dyn ResponseHandler>,
    request_builder: Box<dyn RequestBuilder>,
}

impl L2capClient {
    /// Opens (without connecting) a client socket towards `server` on `psm`
    ///
    /// # Arguments
    ///
    /// * `server` - Address of the remote server
    /// * `psm` - Port the server listens on
    /// * `buffer_capacity` - Size of the receive buffer, must not be zero
    /// * `response_handler` - Called with every response
    /// * `request_builder` - Produces every request
    pub fn create(
        server: &BdAddr,
        psm: u16,
        buffer_capacity: usize,
        response_handler: impl ResponseHandler + 'static,
        request_builder: impl RequestBuilder + 'static,
    ) -> Result<Self> {
        if buffer_capacity == 0 {
            warn!("l2cap_client_create: null buffer, creation aborted");
            return Err(Error::InvalidParameter("buffer capacity must not be zero".into()));
        }

        let socket = L2capSocket::open(Some(server), psm).map_err(|err| {
            error!("l2cap_client_create: cannot open socket: {}", err);
            err
        })?;
        Ok(Self::with_socket(
            socket,
            *server,
            psm,
            buffer_capacity,
            false,
            response_handler,
            request_builder,
        ))
    }

    /// Wraps a socket that is already connected
    pub(crate) fn from_connected(
        socket: L2capSocket,
        buffer_capacity: usize,
        response_handler: impl ResponseHandler + 'static,
        request_builder: impl RequestBuilder + 'static,
    ) -> Result<Self> {
        if buffer_capacity == 0 {
            return Err(Error::InvalidParameter("buffer capacity must not be zero".into()));
        }
        let server = *socket.address();
        let psm = socket.psm();
        Ok(Self::with_socket(
            socket,
            server,
            psm,
            buffer_capacity,
            true,
            response_handler,
            request_builder,
        ))
    }

    fn with_socket(
        socket: L2capSocket,
        server: BdAddr,
        psm: u16,
        buffer_capacity: usize,
        connected: bool,
        response_handler: impl ResponseHandler + 'static,
        request_builder: impl RequestBuilder + 'static,
    ) -> Self {
        Self {
            socket: Some(socket),
            server,
            psm,
            buffer: vec![0; buffer_capacity],
            received: 0,
            connected,
            response_handler: Box::new(response_handler),
            request_builder: Box::new(request_builder),
        }
    }

    /// Connects to the server. Blocks until the link is up or refused.
    pub fn connect(&mut self) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::AlreadyClosed)?;
        match socket.connect() {
            Ok(()) => {
                self.connected = true;
                info!("Connected to {} psm 0x{:04X}", self.server, self.psm);
                Ok(())
            }
            Err(err) => {
                self.connected = false;
                error!("Unable to connect to {}: {}", self.server, err);
                Err(err)
            }
        }
    }

    /// Sends one request of type `kind` and waits up to `timeout` for the
    /// response (`None` waits forever). Returns the response length.
    ///
    /// A timeout leaves the connection as it was. A peer that closed the
    /// link marks the client disconnected; a link reported as gone by the
    /// system also closes the socket.
    pub fn send(&mut self, timeout: Option<Duration>, kind: u8) -> Result<usize> {
        if !self.connected {
            error!("l2cap_client_send: invalid connection");
            return Err(Error::NotConnected);
        }
        let Some(socket) = self.socket.as_ref() else {
            error!("l2cap_client_send: closed socket");
            return Err(Error::NotConnected);
        };

        self.buffer.fill(0);
        self.received = 0;

        let request = self.request_builder.build_request(kind);
        let outcome = exchange(socket, &request, &mut self.buffer, timeout);

        match outcome {
            Ok(0) => {
                warn!("l2cap_client: connection reset by peer");
                self.connected = false;
                Err(Error::PeerReset)
            }
            Ok(n) => {
                self.received = n;
                self.response_handler.handle_response(&self.buffer[..n]);
                Ok(n)
            }
            Err(Error::Timeout) => {
                warn!("l2cap_client_send: no response within {:?}", timeout);
                Err(Error::Timeout)
            }
            Err(Error::PeerReset) => {
                error!("l2cap_client_send: link to {} is gone", self.server);
                self.connected = false;
                self.socket = None;
                Err(Error::PeerReset)
            }
            Err(err) => {
                error!("l2cap_client_send: {}", err);
                Err(err)
            }
        }
    }

    /// Releases the socket without notifying the peer
    pub fn close(&mut self) -> Result<()> {
        self.connected = false;
        match self.socket.take() {
            Some(socket) => {
                debug!("Closing client {}", socket);
                Ok(())
            }
            None => {
                warn!("close_l2cap_socket: already closed socket");
                Ok(())
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Last response received, empty after a failed `send`
    pub fn response(&self) -> &[u8] {
        &self.buffer[..self.received]
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn server(&self) -> &BdAddr {
        &self.server
    }
}

/// Writes `request`, then waits for and reads one response into `buffer`
fn exchange(
    socket: &L2capSocket,
    request: &[u8],
    buffer: &mut [u8],
    timeout: Option<Duration>,
) -> Result<usize> {
    if let Err(err) = socket.send(request) {
        if err.is_peer_reset() {
            return Err(err);
        }
        error!("Unable to write request: {}", err);
    }

    if !socket.wait_readable(timeout)? {
        return Err(Error::Timeout);
    }
    socket.read(buffer)
}

impl fmt::Debug for L2capClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capClient")
            .field("server", &self.server.to_string())
            .field("psm", &self.psm)
            .field("buffer_capacity", &self.buffer.len())
            .field("connected", &self.connected)
            .finish()
    }
}
