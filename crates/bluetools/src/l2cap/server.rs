//! L2CAP server
//!
//! The server listens on one socket and serves up to `max_clients`
//! connections, one worker thread each. Each worker owns one of the
//! receive buffers allocated at creation and loops: wait for a request,
//! hand it to the request handler, send what the response builder returns.
//! [`STOP`](crate::l2cap::STOP) ends a session and is answered with
//! [`STOP_ACK`].
//!
//! `launch` returns once every worker has finished.

use crate::error::{Error, Result};
use crate::gap::BdAddr;
use crate::l2cap::handler::{is_stop, PeerInfo, RequestHandler, ResponseBuilder, STOP_ACK};
use crate::l2cap::socket::L2capSocket;
use crate::sys;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Outcome of one served connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub peer: PeerInfo,
    /// Requests read, the final `STOP` included
    pub requests: usize,
    /// True when the client ended the session with `STOP`
    pub stopped: bool,
}

#[derive(Debug)]
struct ShutdownState {
    stopped: AtomicBool,
    listener: Mutex<Option<RawFd>>,
    connections: Mutex<Vec<RawFd>>,
}

/// Stops a running server from another thread.
///
/// Shutting down stops accepting new clients and cuts every live
/// connection; the workers then end on their next read.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownState>,
}

impl ShutdownHandle {
    fn new(listener: RawFd) -> Self {
        Self {
            inner: Arc::new(ShutdownState {
                stopped: AtomicBool::new(false),
                listener: Mutex::new(Some(listener)),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!("Server already shut down");
            return;
        }
        info!("Shutting the server down");

        if let Some(fd) = *self.inner.listener.lock() {
            if let Err(err) = sys::shutdown_fd(fd) {
                debug!("Listener shutdown: {}", err);
            }
        }
        for &fd in self.inner.connections.lock().iter() {
            if let Err(err) = sys::shutdown_fd(fd) {
                debug!("Connection {} shutdown: {}", fd, err);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn track(&self, fd: RawFd) {
        let mut connections = self.inner.connections.lock();
        connections.push(fd);
        // Accepted while shutting down
        if self.is_shutdown() {
            let _ = sys::shutdown_fd(fd);
        }
    }

    fn untrack(&self, fd: RawFd) {
        self.inner.connections.lock().retain(|&tracked| tracked != fd);
    }

    fn release_listener(&self) {
        self.inner.listener.lock().take();
    }
}

/// Per-server settings shared by every worker
#[derive(Clone, Copy)]
struct Worker<'a> {
    request_handler: &'a dyn RequestHandler,
    response_builder: &'a dyn ResponseBuilder,
    shutdown: &'a ShutdownHandle,
    timeout: Option<Duration>,
    max_requests: Option<usize>,
}

impl Worker<'_> {
    fn serve(self, connection: L2capSocket, peer: PeerInfo, buffer: &mut [u8]) -> SessionReport {
        let mut report = SessionReport {
            peer,
            requests: 0,
            stopped: false,
        };

        while self.max_requests.map_or(true, |max| report.requests < max) {
            buffer.fill(0);

            match connection.wait_readable(self.timeout) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("server_routine: no request within {:?}", self.timeout);
                    break;
                }
                Err(err) => {
                    error!("server_routine: error while polling socket: {}", err);
                    break;
                }
            }

            let n = match connection.read(buffer) {
                Ok(0) => {
                    warn!("l2cap_server: nothing to read on the socket");
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    error!("server_routine: error while reading socket: {}", err);
                    break;
                }
            };
            report.requests += 1;
            let request = &buffer[..n];

            if is_stop(request) {
                debug!("{} asked to stop", peer.address);
                if let Err(err) = connection.send(STOP_ACK) {
                    warn!("l2cap_server: unable to send STOP_ACK: {}", err);
                }
                report.stopped = true;
                break;
            }

            self.request_handler.handle_request(&peer, request);
            let response = self.response_builder.build_response(&peer, request);
            if response.is_empty() {
                continue;
            }
            if let Err(err) = connection.send(&response) {
                error!("Unable to write response: {}", err);
                if err.is_peer_reset() {
                    break;
                }
            }
        }

        info!(
            "l2cap_server: connection {} ended after {} request(s)",
            connection.as_raw_fd(),
            report.requests
        );
        self.shutdown.untrack(connection.as_raw_fd());
        drop(connection);
        report
    }
}

pub struct L2capServer {
    listener: L2capSocket,
    max_clients: usize,
    buffers: Vec<Vec<u8>>,
    request_handler: Box<dyn RequestHandler>,
    response_builder: Box<dyn ResponseBuilder>,
    shutdown: ShutdownHandle,
}

impl L2capServer {
    /// Opens and binds the listening socket on `adapter` (any adapter when
    /// `None`) and `psm`, and allocates one buffer per client
    pub fn create(
        adapter: Option<&BdAddr>,
        psm: u16,
        max_clients: usize,
        buffer_capacity: usize,
        request_handler: impl RequestHandler + 'static,
        response_builder: impl ResponseBuilder + 'static,
    ) -> Result<Self> {
        if buffer_capacity == 0 {
            warn!("l2cap_server_create: null buffer, creation aborted");
            return Err(Error::InvalidParameter("buffer capacity must not be zero".into()));
        }

        let listener = L2capSocket::open_bound(adapter, psm).map_err(|err| {
            error!("Unable to create listening socket on server: {}", err);
            err
        })?;
        Self::from_listener(
            listener,
            max_clients,
            buffer_capacity,
            request_handler,
            response_builder,
        )
    }

    /// Serves connections accepted on an already bound socket
    pub fn from_listener(
        listener: L2capSocket,
        max_clients: usize,
        buffer_capacity: usize,
        request_handler: impl RequestHandler + 'static,
        response_builder: impl ResponseBuilder + 'static,
    ) -> Result<Self> {
        if buffer_capacity == 0 {
            return Err(Error::InvalidParameter("buffer capacity must not be zero".into()));
        }

        let shutdown = ShutdownHandle::new(listener.as_raw_fd());
        Ok(Self {
            listener,
            max_clients,
            buffers: vec![vec![0; buffer_capacity]; max_clients],
            request_handler: Box::new(request_handler),
            response_builder: Box::new(response_builder),
            shutdown,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Accepts up to `max_clients` connections and serves them until each
    /// one ends.
    ///
    /// Every wait, for a client or for a request, is bounded by `timeout`
    /// (`None` waits forever). Each connection serves at most
    /// `max_requests` requests (`None` for no limit). Fails with
    /// [`Error::Timeout`] when no client shows up at all.
    pub fn launch(
        &mut self,
        timeout: Option<Duration>,
        max_requests: Option<usize>,
    ) -> Result<Vec<SessionReport>> {
        if self.max_clients == 0 {
            error!("l2cap_server_launch: no socket available to run the server");
            return Err(Error::InvalidParameter("max_clients must not be zero".into()));
        }
        if self.shutdown.is_shutdown() {
            return Err(Error::AlreadyClosed);
        }

        self.listener.listen(self.max_clients)?;
        info!("Waiting for connection on {}...", self.listener);

        let listener = &self.listener;
        let max_clients = self.max_clients;
        let worker = Worker {
            request_handler: self.request_handler.as_ref(),
            response_builder: self.response_builder.as_ref(),
            shutdown: &self.shutdown,
            timeout,
            max_requests,
        };
        let mut slots = self.buffers.iter_mut().enumerate();

        let (reports, failure) = thread::scope(|scope| {
            let mut workers = Vec::with_capacity(max_clients);
            let mut failure = None;

            while workers.len() < max_clients && !worker.shutdown.is_shutdown() {
                match listener.wait_readable(timeout) {
                    Ok(true) => {}
                    Ok(false) => {
                        if workers.is_empty() {
                            failure = Some(Error::Timeout);
                        } else {
                            debug!("No more clients within {:?}", timeout);
                        }
                        break;
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
                if worker.shutdown.is_shutdown() {
                    break;
                }

                let (connection, address) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        if !worker.shutdown.is_shutdown() {
                            failure = Some(err);
                        }
                        break;
                    }
                };
                let Some((slot, buffer)) = slots.next() else {
                    break;
                };

                info!(
                    "Connection established on {}, connection id: {}",
                    listener,
                    connection.as_raw_fd()
                );
                worker.shutdown.track(connection.as_raw_fd());
                let peer = PeerInfo { slot, address };
                workers.push(scope.spawn(move || worker.serve(connection, peer, buffer)));
            }

            let reports: Vec<SessionReport> = workers
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(report) => Some(report),
                    Err(_) => {
                        error!("A server worker panicked");
                        None
                    }
                })
                .collect();
            (reports, failure)
        });

        match failure {
            Some(err) if reports.is_empty() => {
                error!("l2cap_server_launch: {}", err);
                Err(err)
            }
            Some(err) => {
                warn!("Stopped accepting clients: {}", err);
                Ok(reports)
            }
            None => Ok(reports),
        }
    }

    /// Releases the buffers and the listening socket
    pub fn close(self) {
        info!("Closing server {}", self.listener);
        self.shutdown.shutdown();
    }
}

impl Drop for L2capServer {
    fn drop(&mut self) {
        self.shutdown.release_listener();
    }
}

impl fmt::Debug for L2capServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capServer")
            .field("listener", &self.listener)
            .field("max_clients", &self.max_clients)
            .field("buffer_capacity", &self.buffers.first().map_or(0, Vec::len))
            .field("shut_down", &self.shutdown.is_shutdown())
            .finish()
    }
}
