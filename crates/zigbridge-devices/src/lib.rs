/*!
 * ZigBridge Devices
 *
 * This crate bridges a Zigbee coordinator into the ZigBridge device registry:
 * the coordinator link contract, per-device adapters, the bridge with its
 * connection state machine, and the registry itself.
 */

#![warn(missing_docs)]

// Re-export core types
pub use zigbridge_core::prelude;

pub mod adapter;
pub mod bridge;
pub mod connection;
pub mod coordinator;
pub mod device;
pub mod management;
pub mod registry;

#[cfg(test)]
#[allow(dead_code)]
mod mock;

pub use adapter::{Inspection, ValueChange, ZigbeeDevice, VALUE_EVENT};
pub use bridge::ZigbeeBridge;
pub use connection::{ConnectionState, ControllerConfig};
pub use coordinator::{
    Coordinator, CoordinatorEvent, CoordinatorFactory, Endpoint, IeeeAddr, Indication,
    MeshDeviceInfo,
};
pub use device::{Device, DeviceCapability, DeviceError, DeviceMetadata};
pub use registry::{DeviceHandle, DeviceRegistry, RegistryEvent, SharedDeviceRegistry};

/// ZigBridge devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
