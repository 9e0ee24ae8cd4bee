//! HCI packet structures and parsing
//!
//! This module contains structures and methods for handling HCI packets.

use crate::error::{Error, Result};
use crate::gap::BdAddr;
use crate::hci::constants::*;

/// Packs an OGF/OCF pair into a 16-bit opcode
pub fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x3ff)
}

/// Splits a 16-bit opcode into its OGF/OCF pair
pub fn opcode_split(opcode: u16) -> (u8, u16) {
    ((opcode >> 10) as u8, opcode & 0x3ff)
}

/// HCI commands issued by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Inquiry {
        lap: u32,
        length: u8,
        num_responses: u8,
    },
    RemoteNameRequest {
        bd_addr: BdAddr,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
    },

    // Host Controller Commands (OGF: 0x03)
    WriteInquiryMode {
        mode: u8,
    },

    // LE Commands (OGF: 0x08)
    LeReadLocalSupportedFeatures,
    LeReadSupportedStates,
    LeReadWhiteListSize,
    LeClearWhiteList,
    LeAddDeviceToWhiteList {
        address_type: u8,
        address: BdAddr,
    },
    LeRemoveDeviceFromWhiteList {
        address_type: u8,
        address: BdAddr,
    },
    LeSetScanParameters {
        scan_type: u8,
        scan_interval: u16,
        scan_window: u16,
        own_address_type: u8,
        filter_policy: u8,
    },
    LeSetScanEnable {
        enable: bool,
        filter_duplicates: bool,
    },

    /// Any other command, given by its opcode parts and raw parameters
    Raw {
        ogf: u8,
        ocf: u16,
        parameters: Vec<u8>,
    },
}

impl HciCommand {
    /// Creates a raw command from its OGF, OCF and parameter bytes
    pub fn new(ogf: u8, ocf: u16, parameters: Vec<u8>) -> Self {
        Self::Raw {
            ogf,
            ocf,
            parameters,
        }
    }

    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            // Link Control Commands
            Self::Inquiry { .. } => (OGF_LINK_CTL, OCF_INQUIRY),
            Self::RemoteNameRequest { .. } => (OGF_LINK_CTL, OCF_REMOTE_NAME_REQ),

            // Host Controller Commands
            Self::WriteInquiryMode { .. } => (OGF_HOST_CTL, OCF_WRITE_INQUIRY_MODE),

            // LE Commands
            Self::LeReadLocalSupportedFeatures => (OGF_LE, OCF_LE_READ_LOCAL_SUPPORTED_FEATURES),
            Self::LeReadSupportedStates => (OGF_LE, OCF_LE_READ_SUPPORTED_STATES),
            Self::LeReadWhiteListSize => (OGF_LE, OCF_LE_READ_WHITE_LIST_SIZE),
            Self::LeClearWhiteList => (OGF_LE, OCF_LE_CLEAR_WHITE_LIST),
            Self::LeAddDeviceToWhiteList { .. } => (OGF_LE, OCF_LE_ADD_DEVICE_TO_WHITE_LIST),
            Self::LeRemoveDeviceFromWhiteList { .. } => {
                (OGF_LE, OCF_LE_REMOVE_DEVICE_FROM_WHITE_LIST)
            }
            Self::LeSetScanParameters { .. } => (OGF_LE, OCF_LE_SET_SCAN_PARAMETERS),
            Self::LeSetScanEnable { .. } => (OGF_LE, OCF_LE_SET_SCAN_ENABLE),

            Self::Raw { ogf, ocf, .. } => (*ogf, *ocf),
        }
    }

    /// 16-bit opcode of this command
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Convert the command to its raw parameter bytes
    pub fn parameters(&self) -> Vec<u8> {
        match self {
            Self::LeReadLocalSupportedFeatures
            | Self::LeReadSupportedStates
            | Self::LeReadWhiteListSize
            | Self::LeClearWhiteList => vec![],

            Self::Inquiry {
                lap,
                length,
                num_responses,
            } => {
                let lap = lap.to_le_bytes();
                vec![lap[0], lap[1], lap[2], *length, *num_responses]
            }

            Self::RemoteNameRequest {
                bd_addr,
                page_scan_repetition_mode,
                clock_offset,
            } => {
                let mut params = Vec::with_capacity(10);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(*page_scan_repetition_mode);
                params.push(0x00); // reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
                params
            }

            Self::WriteInquiryMode { mode } => vec![*mode],

            Self::LeAddDeviceToWhiteList {
                address_type,
                address,
            }
            | Self::LeRemoveDeviceFromWhiteList {
                address_type,
                address,
            } => {
                let mut params = Vec::with_capacity(7);
                params.push(*address_type);
                params.extend_from_slice(address.as_slice());
                params
            }

            Self::LeSetScanParameters {
                scan_type,
                scan_interval,
                scan_window,
                own_address_type,
                filter_policy,
            } => {
                let mut params = Vec::with_capacity(7);
                params.push(*scan_type);
                params.extend_from_slice(&scan_interval.to_le_bytes());
                params.extend_from_slice(&scan_window.to_le_bytes());
                params.push(*own_address_type);
                params.push(*filter_policy);
                params
            }

            Self::LeSetScanEnable {
                enable,
                filter_duplicates,
            } => vec![*enable as u8, *filter_duplicates as u8],

            Self::Raw { parameters, .. } => parameters.clone(),
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parse an HCI event from raw bytes starting at the event code
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HCI_EVENT_HDR_SIZE {
            return Err(Error::MalformedPacket(format!(
                "event header needs {} bytes, got {}",
                HCI_EVENT_HDR_SIZE,
                data.len()
            )));
        }

        let event_code = data[0];
        let parameter_total_length = data[1];
        let end = parameter_total_length as usize + HCI_EVENT_HDR_SIZE;

        if data.len() < end {
            return Err(Error::MalformedPacket(format!(
                "event 0x{:02X} declares {} parameter bytes, only {} present",
                event_code,
                parameter_total_length,
                data.len() - HCI_EVENT_HDR_SIZE
            )));
        }

        Ok(HciEvent {
            event_code,
            parameter_total_length,
            parameters: data[HCI_EVENT_HDR_SIZE..end].to_vec(),
        })
    }

    /// Parse an event from a packet as read from a raw socket (indicator byte first)
    pub fn from_packet(packet: &[u8]) -> Result<Self> {
        match packet.first() {
            Some(&HCI_EVENT_PKT) => Self::parse(&packet[1..]),
            Some(other) => Err(Error::MalformedPacket(format!(
                "expected event packet indicator 0x04, got 0x{:02X}",
                other
            ))),
            None => Err(Error::MalformedPacket("empty packet".into())),
        }
    }

    /// Opcode carried by a Command Complete or Command Status event
    pub fn command_opcode(&self) -> Option<u16> {
        let offset = match self.event_code {
            EVT_CMD_COMPLETE => 1,
            EVT_CMD_STATUS => 2,
            _ => return None,
        };
        self.parameters
            .get(offset..offset + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Check whether this is the Command Complete event of `ogf`/`ocf`
    pub fn is_command_complete(&self, ogf: u8, ocf: u16) -> bool {
        self.event_code == EVT_CMD_COMPLETE && self.command_opcode() == Some(opcode(ogf, ocf))
    }

    /// Check whether this is the Command Status event of `ogf`/`ocf`
    pub fn is_command_status(&self, ogf: u8, ocf: u16) -> bool {
        self.event_code == EVT_CMD_STATUS && self.command_opcode() == Some(opcode(ogf, ocf))
    }

    /// Status byte of a Command Complete / Command Status event
    pub fn get_status(&self) -> Option<u8> {
        match self.event_code {
            EVT_CMD_COMPLETE => self.parameters.get(3).copied(),
            EVT_CMD_STATUS => self.parameters.first().copied(),
            _ => None,
        }
    }

    /// Return parameters of a Command Complete event, status byte excluded
    pub fn return_parameters(&self) -> &[u8] {
        match self.event_code {
            EVT_CMD_COMPLETE if self.parameters.len() > 4 => &self.parameters[4..],
            _ => &[],
        }
    }
}
