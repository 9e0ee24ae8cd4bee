pub mod constants;
pub mod registry;
pub mod types;

pub use constants::*;
pub use registry::{DeviceRegistry, KnownDevicePolicy};
pub use types::*;
