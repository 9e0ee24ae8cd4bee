use crate::error::Error;
use crate::gap::constants::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    Public,
    Random,
    Unknown,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            _ => AddressType::Unknown,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::Unknown => UNKNOWN_ADDRESS_TYPE,
        }
    }
}

impl AddressType {
    /// Address type to put on the wire; the controller has no notion of "unknown".
    pub fn wire_value(self) -> u8 {
        match self {
            AddressType::Unknown => PUBLIC_DEVICE_ADDRESS,
            other => u8::from(other),
        }
    }

    fn tag(self) -> &'static str {
        match self {
            AddressType::Public => "[PDA]",
            AddressType::Random => "[RDA]",
            AddressType::Unknown => "[???]",
        }
    }
}

/// Bluetooth device address, stored in HCI wire order (least significant byte first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    /// `00:00:00:00:00:00`, "any adapter" when binding
    pub const ANY: BdAddr = BdAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_any(&self) -> bool {
        self.bytes == [0; 6]
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = Error;

    /// Parses the human form `AA:BB:CC:DD:EE:FF` (most significant byte first).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidParameter(format!("invalid Bluetooth address: {s}"));

        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(invalid());
            }
            bytes[5 - i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self { bytes })
    }
}

/// What the library knows about a remote (or local) device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub address: BdAddr,
    pub address_type: AddressType,
    pub real_name: String,
    pub custom_name: String,
}

impl Device {
    /// Creates a record; missing names become [`UNKNOWN_NAME`].
    pub fn new(
        address: BdAddr,
        address_type: AddressType,
        real_name: Option<&str>,
        custom_name: Option<&str>,
    ) -> Self {
        Self {
            address,
            address_type,
            real_name: truncate_name(real_name.unwrap_or(UNKNOWN_NAME)),
            custom_name: truncate_name(custom_name.unwrap_or(UNKNOWN_NAME)),
        }
    }

    /// Record carrying nothing but the address
    pub fn minimal(address: BdAddr) -> Self {
        Self::new(address, AddressType::Unknown, None, None)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] : {} a.k.a {}",
            self.address_type.tag(),
            self.address,
            self.real_name,
            self.custom_name
        )
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() <= BT_NAME_LENGTH {
        return name.to_string();
    }
    let mut end = BT_NAME_LENGTH;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
