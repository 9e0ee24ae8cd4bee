//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;
pub const HCI_VENDOR_PKT: u8 = 0xFF;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;
// Indicator + event header + parameters
pub const HCI_MAX_EVENT_SIZE: usize = 260;
pub const HCI_EVENT_HDR_SIZE: usize = 2;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_LE: u8 = 0x08;

// Link Control Commands (OGF: 0x01)
pub const OCF_INQUIRY: u16 = 0x0001;
pub const OCF_REMOTE_NAME_REQ: u16 = 0x0019;

// Host Controller Commands (OGF: 0x03)
pub const OCF_WRITE_INQUIRY_MODE: u16 = 0x0045;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_READ_LOCAL_SUPPORTED_FEATURES: u16 = 0x0003;
pub const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;
pub const OCF_LE_READ_WHITE_LIST_SIZE: u16 = 0x000F;
pub const OCF_LE_CLEAR_WHITE_LIST: u16 = 0x0010;
pub const OCF_LE_ADD_DEVICE_TO_WHITE_LIST: u16 = 0x0011;
pub const OCF_LE_REMOVE_DEVICE_FROM_WHITE_LIST: u16 = 0x0012;
pub const OCF_LE_READ_SUPPORTED_STATES: u16 = 0x001C;

// HCI Events
pub const EVT_INQUIRY_COMPLETE: u8 = 0x01;
pub const EVT_INQUIRY_RESULT: u8 = 0x02;
pub const EVT_REMOTE_NAME_REQ_COMPLETE: u8 = 0x07;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_INQUIRY_RESULT_WITH_RSSI: u8 = 0x22;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// Inquiry
/// General Inquiry Access Code, 0x9E8B33
pub const GIAC_LAP: u32 = 0x9E8B33;
/// One inquiry length unit is 1.28 s
pub const INQUIRY_UNIT_MS: u64 = 1280;
pub const INQUIRY_MODE_STANDARD: u8 = 0x00;
pub const INQUIRY_MODE_RSSI: u8 = 0x01;

// Remote name request defaults
pub const PSCAN_REP_MODE_R1: u8 = 0x01;

// LE scan parameters
pub const LE_SCAN_PASSIVE: u8 = 0x00;
pub const LE_SCAN_ACTIVE: u8 = 0x01;
pub const LE_FILTER_ACCEPT_ALL: u8 = 0x00;
pub const LE_FILTER_WHITELIST_ONLY: u8 = 0x01;

// RSSI
/// Reported when the controller cannot measure the signal
pub const RSSI_UNAVAILABLE: i8 = 127;
/// LE reports at or above this value are treated as suspicious
pub const LE_RSSI_ANOMALY_THRESHOLD: i8 = 21;

// Sizes of command return parameters (status byte excluded)
pub const LE_FEATURES_SIZE: usize = 8;
pub const LE_STATES_SIZE: usize = 8;

/// Successful command status
pub const HCI_SUCCESS: u8 = 0x00;
