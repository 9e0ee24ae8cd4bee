//! HCI Socket implementation for Bluetooth communication
//!
//! This module provides a wrapper around the raw HCI socket interface,
//! allowing for communication with Bluetooth controllers. The controller
//! talks to sockets through the [`HciChannel`] and [`HciSocketProvider`]
//! traits so that it can be driven without hardware.

use crate::error::{Error, Result};
use crate::gap::BdAddr;
use crate::hci::codec::EventFilter;
use crate::hci::packet::HciCommand;
use crate::sys;
use log::{debug, trace};
use std::ffi::CStr;
use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

// Bluetooth socket constants
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_CHANNEL_RAW: u16 = 0;
const SOL_HCI: i32 = 0;
const HCI_FILTER: i32 = 2;

const HCI_MAX_DEV: usize = 16;
const HCI_UP: u32 = 0;

// _IOR('H', 210, int) and _IOR('H', 211, int)
const HCIGETDEVLIST: u64 = 0x8004_48D2;
const HCIGETDEVINFO: u64 = 0x8004_48D3;

/// Identity of the adapter a socket is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub dev_id: u16,
    pub address: BdAddr,
    pub name: String,
}

/// Operations the controller needs from an adapter-bound socket
pub trait HciChannel: Send + Sync {
    /// Index of the adapter the socket is bound to
    fn dev_id(&self) -> u16;

    fn send_command(&self, command: &HciCommand) -> Result<()>;

    /// Waits for an incoming packet; `Ok(false)` on timeout
    fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool>;

    /// Reads one packet, indicator byte included. Zero means end of stream.
    fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    fn filter(&self) -> Result<EventFilter>;

    fn set_filter(&self, filter: &EventFilter) -> Result<()>;

    fn adapter_info(&self) -> Result<AdapterInfo>;
}

/// Source of fresh adapter-bound sockets
pub trait HciSocketProvider: Send + Sync {
    type Socket: HciChannel;

    /// Opens a socket on the adapter with address `adapter`, or on the
    /// default adapter when `None`
    fn open(&self, adapter: Option<&BdAddr>) -> Result<Self::Socket>;
}

/// Provider opening real raw HCI sockets
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSockets;

impl HciSocketProvider for SystemSockets {
    type Socket = HciSocket;

    fn open(&self, adapter: Option<&BdAddr>) -> Result<HciSocket> {
        HciSocket::open_adapter(adapter)
    }
}

// Define the sockaddr_hci structure
#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy, Default)]
struct HciDevReq {
    dev_id: u16,
    dev_opt: u32,
}

#[repr(C)]
struct HciDevListReq {
    dev_num: u16,
    dev_req: [HciDevReq; HCI_MAX_DEV],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Default)]
struct HciDevStats {
    err_rx: u32,
    err_tx: u32,
    cmd_tx: u32,
    evt_rx: u32,
    acl_tx: u32,
    acl_rx: u32,
    sco_tx: u32,
    sco_rx: u32,
    byte_rx: u32,
    byte_tx: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Default)]
struct HciDevInfo {
    dev_id: u16,
    name: [libc::c_char; 8],
    bdaddr: [u8; 6],
    flags: u32,
    dev_type: u8,
    features: [u8; 8],
    pkt_type: u32,
    link_policy: u32,
    link_mode: u32,
    acl_mtu: u16,
    acl_pkts: u16,
    sco_mtu: u16,
    sco_pkts: u16,
    stat: HciDevStats,
}

impl HciDevInfo {
    fn is_up(&self) -> bool {
        self.flags & (1 << HCI_UP) != 0
    }

    fn name(&self) -> String {
        let mut raw = [0u8; 9];
        for (dst, src) in raw.iter_mut().zip(self.name.iter()) {
            *dst = *src as u8;
        }
        CStr::from_bytes_until_nul(&raw)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Unbound raw HCI socket descriptor, negative on failure
fn raw_hci_socket() -> RawFd {
    unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW | libc::SOCK_CLOEXEC, BTPROTO_HCI) }
}

fn device_info(ctl: RawFd, dev_id: u16) -> std::io::Result<HciDevInfo> {
    let mut info = HciDevInfo {
        dev_id,
        ..Default::default()
    };
    let result = unsafe { libc::ioctl(ctl, HCIGETDEVINFO as _, &mut info as *mut HciDevInfo) };
    if result < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(info)
}

/// Finds the adapter index for `adapter`, or the first adapter that is up
fn resolve_device_id(adapter: Option<&BdAddr>) -> Result<u16> {
    let ctl = raw_hci_socket();
    if ctl < 0 {
        return Err(Error::SocketError(std::io::Error::last_os_error()));
    }

    let result = (|| {
        let mut list = HciDevListReq {
            dev_num: HCI_MAX_DEV as u16,
            dev_req: [HciDevReq::default(); HCI_MAX_DEV],
        };
        let rc = unsafe { libc::ioctl(ctl, HCIGETDEVLIST as _, &mut list as *mut HciDevListReq) };
        if rc < 0 {
            return Err(Error::SocketError(std::io::Error::last_os_error()));
        }

        let count = (list.dev_num as usize).min(HCI_MAX_DEV);
        for req in &list.dev_req[..count] {
            let info = match device_info(ctl, req.dev_id) {
                Ok(info) => info,
                Err(err) => {
                    debug!("Skipping hci{}: {}", req.dev_id, err);
                    continue;
                }
            };
            let matches = match adapter {
                Some(addr) => info.bdaddr == addr.bytes,
                None => info.is_up(),
            };
            if matches {
                return Ok(req.dev_id);
            }
        }

        Err(Error::SocketError(std::io::Error::from_raw_os_error(libc::ENODEV)))
    })();

    sys::close_fd(ctl);
    result
}

/// Represents an HCI socket
#[derive(Debug)]
pub struct HciSocket {
    fd: RawFd,
    dev_id: u16,
}

impl HciSocket {
    /// Gets the raw file descriptor for the socket
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Opens a new HCI socket
    ///
    /// # Arguments
    ///
    /// * `dev_id` - The device ID to open (0 for the first device)
    ///
    /// # Returns
    ///
    /// A new `HciSocket` instance or an error if the socket could not be opened
    pub fn open(dev_id: u16) -> Result<Self> {
        // Open a raw HCI socket
        let fd = raw_hci_socket();

        if fd < 0 {
            return Err(Error::SocketError(std::io::Error::last_os_error()));
        }

        // Bind to the specified device
        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };

        let result = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            sys::close_fd(fd);
            return Err(Error::BindError(err));
        }

        debug!("Opened HCI socket {} on hci{}", fd, dev_id);
        Ok(HciSocket { fd, dev_id })
    }

    /// Opens a socket on the adapter owning `adapter`, or on the first adapter that is up
    pub fn open_adapter(adapter: Option<&BdAddr>) -> Result<Self> {
        let dev_id = resolve_device_id(adapter)?;
        Self::open(dev_id)
    }
}

impl HciChannel for HciSocket {
    fn dev_id(&self) -> u16 {
        self.dev_id
    }

    /// Sends an HCI command to the controller
    fn send_command(&self, command: &HciCommand) -> Result<()> {
        let packet = command.to_packet();
        trace!("HCI > {}", hex::encode(&packet));
        match sys::write_fd(self.fd, &packet) {
            Ok(n) if n == packet.len() => Ok(()),
            Ok(_) => Err(Error::command_io(
                command.opcode(),
                &std::io::Error::from(std::io::ErrorKind::WriteZero),
            )),
            Err(err) => Err(Error::command_io(command.opcode(), &err)),
        }
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(sys::poll_readable(self.fd, timeout)?)
    }

    fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let n = sys::read_fd(self.fd, buf)?;
        trace!("HCI < {}", hex::encode(&buf[..n]));
        Ok(n)
    }

    fn filter(&self) -> Result<EventFilter> {
        let mut filter = EventFilter::new();
        let mut len = std::mem::size_of::<EventFilter>() as libc::socklen_t;
        let result = unsafe {
            libc::getsockopt(
                self.fd,
                SOL_HCI,
                HCI_FILTER,
                &mut filter as *mut EventFilter as *mut libc::c_void,
                &mut len,
            )
        };
        if result < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(filter)
    }

    fn set_filter(&self, filter: &EventFilter) -> Result<()> {
        let result = unsafe {
            libc::setsockopt(
                self.fd,
                SOL_HCI,
                HCI_FILTER,
                filter as *const EventFilter as *const libc::c_void,
                std::mem::size_of::<EventFilter>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn adapter_info(&self) -> Result<AdapterInfo> {
        let info = device_info(self.fd, self.dev_id)?;
        Ok(AdapterInfo {
            dev_id: self.dev_id,
            address: BdAddr::new(info.bdaddr),
            name: info.name(),
        })
    }
}

impl fmt::Display for HciSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hci{} (fd {})", self.dev_id, self.fd)
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        debug!("Closing HCI socket {}", self.fd);
        sys::close_fd(self.fd);
    }
}
