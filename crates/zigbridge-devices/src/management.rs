/*!
 * Bridge-level registry entry.
 */
use std::sync::Weak;

use async_trait::async_trait;

use zigbridge_core::types::Value;

use crate::bridge::{BridgeInner, ZigbeeBridge};
use crate::coordinator::IeeeAddr;
use crate::device::{CommandArgs, Device, DeviceCapability, DeviceError, DeviceMetadata, Result};

/// Registry device type of the bridge entry
pub const BRIDGE_TYPE: &str = "bridge-zigbee";

const COMMANDS: &[&str] = &["state", "connect", "list", "permitJoin"];

/// Management surface of a [`ZigbeeBridge`], registered as
/// `zigbee:bridge:<machineId>`
#[derive(Debug)]
pub struct BridgeDevice {
    bridge: Weak<BridgeInner>,
    metadata: DeviceMetadata,
}

impl BridgeDevice {
    pub(crate) fn new(bridge: Weak<BridgeInner>) -> Self {
        Self {
            bridge,
            metadata: DeviceMetadata::new(BRIDGE_TYPE)
                .with_capability(DeviceCapability::Config)
                .with_capability(DeviceCapability::State)
                .with_name("Zigbee Bridge"),
        }
    }

    fn bridge(&self) -> Result<ZigbeeBridge> {
        ZigbeeBridge::upgrade(&self.bridge)
            .ok_or_else(|| DeviceError::Other("zigbee bridge has been dropped".to_string()))
    }
}

#[async_trait]
impl Device for BridgeDevice {
    fn metadata(&self) -> &DeviceMetadata {
        &self.metadata
    }

    fn available_commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn execute_command(&self, command: &str, args: &[Value]) -> Result<Value> {
        let bridge = self.bridge()?;
        let args = CommandArgs::new(command, args);

        match command {
            "state" => Ok(Value::from_serialize(&bridge.state())?),
            "connect" => {
                let port = args.optional_string(0, "port")?;
                let state = bridge.connect(port).await?;
                Ok(Value::from_serialize(&state)?)
            }
            "list" => {
                let ieee_addr = args
                    .optional_string(0, "ieeeAddr")?
                    .map(|raw| raw.parse::<IeeeAddr>())
                    .transpose()
                    .map_err(|err| DeviceError::InvalidArgument(err.to_string()))?;
                Ok(Value::from_serialize(&bridge.list(ieee_addr)?)?)
            }
            "permitJoin" => {
                bridge.permit_join()?;
                Ok(Value::Null)
            }
            _ => Err(DeviceError::UnknownCommand(command.to_string())),
        }
    }
}
