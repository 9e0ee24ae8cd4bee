//! bluetools - host-side Bluetooth tools over BlueZ raw sockets
//!
//! This library drives a local Bluetooth adapter through its HCI socket:
//! classic and LE discovery, RSSI measurement and LE white list management,
//! all through a controller state machine that records every discovered
//! peer in a shared device registry. It also provides a small L2CAP
//! client/server framework for request/response messaging between hosts.

pub mod config;
pub mod error;
pub mod gap;
pub mod hci;
pub mod l2cap;
mod sys;

// Re-export common types for convenience
pub use config::{Config, HciConfig, L2capConfig};
pub use error::{Error, Result};
pub use gap::{AddressType, BdAddr, Device, DeviceRegistry, KnownDevicePolicy};
pub use hci::{
    ControllerState, HciCommand, HciController, HciEvent, HciSocket, LeAdvertisingReport,
    LeScanParameters, RssiSample, SocketId,
};
pub use l2cap::{L2capClient, L2capServer, L2capSocket, PeerInfo, ShutdownHandle};
