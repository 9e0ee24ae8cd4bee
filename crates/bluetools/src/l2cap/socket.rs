//! L2CAP sockets
//!
//! Connection-oriented (`SOCK_SEQPACKET`) L2CAP sockets: one write is one
//! message, one read returns at most one message.

use crate::error::{Error, Result};
use crate::gap::BdAddr;
use crate::sys;
use log::{debug, trace};
use std::fmt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

const AF_BLUETOOTH: i32 = 31;
const BTPROTO_L2CAP: i32 = 0;

/// Kernel `struct sockaddr_l2`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

impl SockaddrL2 {
    fn new(address: &BdAddr, psm: u16) -> Self {
        Self {
            l2_family: AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: psm.to_le(),
            l2_bdaddr: address.bytes,
            ..Default::default()
        }
    }
}

/// An L2CAP socket, optionally bound or connected
pub struct L2capSocket {
    fd: RawFd,
    address: BdAddr,
    psm: u16,
}

impl L2capSocket {
    /// Opens an unbound socket targeting `address` (any adapter when `None`) on `psm`
    pub fn open(address: Option<&BdAddr>, psm: u16) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                BTPROTO_L2CAP,
            )
        };
        if fd < 0 {
            return Err(Error::SocketError(std::io::Error::last_os_error()));
        }

        let address = address.copied().unwrap_or(BdAddr::ANY);
        debug!("Opened L2CAP socket {} for {} psm 0x{:04X}", fd, address, psm);
        Ok(Self { fd, address, psm })
    }

    /// Opens a socket bound to the local adapter `adapter` on `psm`
    pub fn open_bound(adapter: Option<&BdAddr>, psm: u16) -> Result<Self> {
        let socket = Self::open(adapter, psm)?;
        socket.bind()?;
        Ok(socket)
    }

    pub fn bind(&self) -> Result<()> {
        let addr = SockaddrL2::new(&self.address, self.psm);
        let result = unsafe {
            libc::bind(
                self.fd,
                &addr as *const SockaddrL2 as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(Error::BindError(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Connects to the address and PSM given at open. Blocks.
    pub fn connect(&self) -> Result<()> {
        let addr = SockaddrL2::new(&self.address, self.psm);
        let result = unsafe {
            libc::connect(
                self.fd,
                &addr as *const SockaddrL2 as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(Error::from_connection_io(std::io::Error::last_os_error()));
        }
        debug!("L2CAP socket {} connected to {}", self.fd, self.address);
        Ok(())
    }

    pub fn listen(&self, backlog: usize) -> Result<()> {
        let backlog = backlog.min(libc::c_int::MAX as usize) as libc::c_int;
        if unsafe { libc::listen(self.fd, backlog) } < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Accepts one connection and returns it with the peer address.
    ///
    /// The peer address is [`BdAddr::ANY`] for non-Bluetooth transports.
    pub fn accept(&self) -> Result<(L2capSocket, BdAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = loop {
            let fd = unsafe {
                libc::accept4(
                    self.fd,
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                break fd;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(Error::Io(err));
            }
        };

        let peer = if storage.ss_family as i32 == AF_BLUETOOTH {
            let addr = unsafe { *(&storage as *const libc::sockaddr_storage as *const SockaddrL2) };
            BdAddr::new(addr.l2_bdaddr)
        } else {
            BdAddr::ANY
        };

        debug!("L2CAP socket {} accepted {} from {}", self.fd, fd, peer);
        Ok((
            L2capSocket {
                fd,
                address: peer,
                psm: self.psm,
            },
            peer,
        ))
    }

    /// Waits for incoming data; `None` waits forever. `Ok(false)` on timeout.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        sys::poll_readable(self.fd, timeout).map_err(Error::from_connection_io)
    }

    /// Reads one message. Zero means the peer closed the connection.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = sys::read_fd(self.fd, buf).map_err(Error::from_connection_io)?;
        trace!("L2CAP {} < {}", self.fd, hex::encode(&buf[..n]));
        Ok(n)
    }

    /// Writes `message` as a single packet
    pub fn send(&self, message: &[u8]) -> Result<()> {
        trace!("L2CAP {} > {}", self.fd, hex::encode(message));
        let n = sys::write_fd(self.fd, message).map_err(Error::from_connection_io)?;
        if n < message.len() {
            return Err(Error::Io(std::io::Error::from(std::io::ErrorKind::WriteZero)));
        }
        Ok(())
    }

    /// Remote address for connecting sockets, local one for bound sockets
    pub fn address(&self) -> &BdAddr {
        &self.address
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }
}

impl fmt::Display for L2capSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} psm 0x{:04X} (fd {})", self.address, self.psm, self.fd)
    }
}

impl fmt::Debug for L2capSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capSocket")
            .field("fd", &self.fd)
            .field("address", &self.address.to_string())
            .field("psm", &self.psm)
            .finish()
    }
}

impl AsRawFd for L2capSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for L2capSocket {
    /// Wraps an already connected or listening descriptor
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd,
            address: BdAddr::ANY,
            psm: 0,
        }
    }
}

impl IntoRawFd for L2capSocket {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for L2capSocket {
    fn drop(&mut self) {
        debug!("Closing L2CAP socket {}", self.fd);
        sys::close_fd(self.fd);
    }
}
