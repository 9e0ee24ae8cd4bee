// Address types
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;
pub const UNKNOWN_ADDRESS_TYPE: u8 = 0xFF;

// Placeholder used whenever a name could not be resolved or was not supplied
pub const UNKNOWN_NAME: &str = "UNKNOWN";

// Maximum length of a remote name (Remote Name Request Complete)
pub const BT_NAME_LENGTH: usize = 248;
