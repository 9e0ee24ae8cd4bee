//! Bluetooth HCI (Host Controller Interface) implementation
//!
//! This module provides functionality for interacting with HCI interfaces:
//! command encoding, event decoding, raw sockets and the controller state
//! machine built on top of them.

pub mod codec;
pub mod constants;
pub mod controller;
pub mod packet;
pub mod socket;
pub mod states;

#[cfg(test)]
mod tests;

pub use codec::{build_event_filter, EventFilter, InquiryResult, LeAdvertisingReport};
pub use controller::{ControllerState, HciController, LeScanParameters, RssiSample, SocketId};
pub use packet::{HciCommand, HciEvent};
pub use socket::{AdapterInfo, HciChannel, HciSocket, HciSocketProvider, SystemSockets};
pub use states::{LeFeatures, LeStates};
