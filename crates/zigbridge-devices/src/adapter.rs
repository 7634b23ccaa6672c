/*!
 * Zigbee device adapter.
 *
 * One [`ZigbeeDevice`] is registered per mesh device. It translates registry
 * commands into endpoint-addressed coordinator calls and renders the
 * coordinator's view of the device as an [`Inspection`].
 */
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use zigbridge_core::types::{Attributes, Id, Value};

use crate::coordinator::{
    ClusterId, Coordinator, Endpoint, EndpointId, IeeeAddr, MeshDeviceInfo, MeshDeviceType,
    MeshStatus,
};
use crate::device::{CommandArgs, Device, DeviceCapability, DeviceError, DeviceMetadata, Result};

/// Registry event carrying attribute changes
pub const VALUE_EVENT: &str = "zigbee:value";

/// Registry device type of mesh devices
pub const DEVICE_TYPE: &str = "zigbee";

const COMMANDS: &[&str] = &[
    "zigbeeInspect",
    "zigbeeRead",
    "zigbeeFunctional",
    "zigbeeFoundation",
    "zigbeeReport",
];

/// Registry key of the mesh device with `ieee_addr`
pub fn device_key(ieee_addr: IeeeAddr) -> Id {
    Id::from(format!("zigbee:{}", ieee_addr))
}

/// One changed attribute, as emitted under [`VALUE_EVENT`]
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    /// Endpoint reporting the change
    pub endpoint: EndpointId,
    /// Cluster of the attribute
    pub cluster: ClusterId,
    /// Attribute identifier
    pub attribute: String,
    /// Reported value
    pub new_value: Value,
}

impl From<ValueChange> for Value {
    fn from(change: ValueChange) -> Self {
        let mut payload = Attributes::new();
        payload.insert("endpoint".to_string(), change.endpoint.into());
        payload.insert("cluster".to_string(), change.cluster.into());
        payload.insert("attribute".to_string(), change.attribute.into());
        payload.insert("newValue".to_string(), change.new_value);
        Value::Object(payload)
    }
}

/// Per-cluster section of an [`Inspection`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterView {
    /// Input (server) cluster
    #[serde(rename = "in")]
    pub input: bool,
    /// Output (client) cluster
    #[serde(rename = "out")]
    pub output: bool,
    /// Cached attribute values
    pub attributes: Attributes,
}

/// Per-endpoint section of an [`Inspection`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointView {
    /// Endpoint number
    pub id: EndpointId,
    /// Application profile identifier
    pub profile_id: u16,
    /// Device role identifier
    pub device_id: u16,
    /// Clusters by identifier
    pub clusters: BTreeMap<ClusterId, ClusterView>,
}

/// Snapshot of a mesh device as seen by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inspection {
    /// Hardware address
    pub ieee_addr: IeeeAddr,
    /// Reachability; `offline` when the coordinator no longer lists the device
    pub status: MeshStatus,
    /// Device role
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<MeshDeviceType>,
    /// Current network address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_addr: Option<u16>,
    /// Manufacturer code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<u16>,
    /// Endpoint details; omitted for offline devices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<EndpointView>>,
}

impl Inspection {
    fn offline(ieee_addr: IeeeAddr) -> Self {
        Self {
            ieee_addr,
            status: MeshStatus::Offline,
            device_type: None,
            network_addr: None,
            manufacturer: None,
            endpoints: None,
        }
    }
}

/// Registry entry for a single mesh device
#[derive(Debug)]
pub struct ZigbeeDevice {
    coordinator: Arc<dyn Coordinator>,
    ieee_addr: IeeeAddr,
    endpoints: BTreeMap<EndpointId, Arc<dyn Endpoint>>,
    metadata: DeviceMetadata,
}

impl ZigbeeDevice {
    /// Create an adapter for `info` dispatching through `endpoints`
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        info: &MeshDeviceInfo,
        endpoints: BTreeMap<EndpointId, Arc<dyn Endpoint>>,
    ) -> Self {
        Self {
            coordinator,
            ieee_addr: info.ieee_addr,
            endpoints,
            metadata: DeviceMetadata::new(DEVICE_TYPE).with_capability(DeviceCapability::Nameable),
        }
    }

    /// Hardware address of the device
    pub fn ieee_addr(&self) -> IeeeAddr {
        self.ieee_addr
    }

    /// Registry key of the device
    pub fn key(&self) -> Id {
        device_key(self.ieee_addr)
    }

    /// Endpoints the adapter can address
    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.endpoints.keys().copied().collect()
    }

    fn endpoint(&self, endpoint: EndpointId) -> Result<&Arc<dyn Endpoint>> {
        self.endpoints
            .get(&endpoint)
            .ok_or(DeviceError::UnknownEndpoint(endpoint))
    }

    /// Read an attribute of a cluster
    pub async fn read_attribute(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        attribute: &str,
    ) -> Result<Value> {
        let ep = self.endpoint(endpoint)?;
        debug!(ieee_addr = %self.ieee_addr, endpoint, cluster, attribute, "read");
        Ok(ep.read(cluster, attribute).await?)
    }

    /// Send a cluster-specific command
    pub async fn invoke_functional(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        command: &str,
        payload: Attributes,
    ) -> Result<Value> {
        let ep = self.endpoint(endpoint)?;
        debug!(ieee_addr = %self.ieee_addr, endpoint, cluster, command, "functional");
        Ok(ep.functional(cluster, command, payload).await?)
    }

    /// Send a foundation command
    pub async fn invoke_foundation(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
        command: &str,
        payload: Attributes,
    ) -> Result<Value> {
        let ep = self.endpoint(endpoint)?;
        debug!(ieee_addr = %self.ieee_addr, endpoint, cluster, command, "foundation");
        Ok(ep.foundation(cluster, command, payload).await?)
    }

    /// Configure attribute reporting for a cluster
    pub async fn configure_reporting(
        &self,
        endpoint: EndpointId,
        cluster: ClusterId,
    ) -> Result<Value> {
        let ep = self.endpoint(endpoint)?;
        debug!(ieee_addr = %self.ieee_addr, endpoint, cluster, "configure reporting");
        Ok(ep.report(cluster).await?)
    }

    /// Build a snapshot of the device from the coordinator's current view
    pub fn inspect(&self) -> Inspection {
        let Some(device) = self.coordinator.list(Some(self.ieee_addr)).into_iter().next() else {
            return Inspection::offline(self.ieee_addr);
        };

        let endpoints = self
            .endpoints
            .values()
            .map(|ep| {
                let dump = ep.dump();
                let clusters = dump
                    .clusters
                    .into_iter()
                    .map(|(id, cluster)| {
                        let direction = cluster.direction();
                        let view = ClusterView {
                            input: direction.input,
                            output: direction.output,
                            attributes: cluster.attrs,
                        };
                        (id, view)
                    })
                    .collect();

                EndpointView {
                    id: dump.ep_id,
                    profile_id: dump.prof_id,
                    device_id: dump.dev_id,
                    clusters,
                }
            })
            .collect();

        Inspection {
            ieee_addr: device.ieee_addr,
            status: device.status,
            device_type: Some(device.device_type),
            network_addr: Some(device.nwk_addr),
            manufacturer: device.manuf_id,
            endpoints: Some(endpoints),
        }
    }
}

#[async_trait]
impl Device for ZigbeeDevice {
    fn metadata(&self) -> &DeviceMetadata {
        &self.metadata
    }

    fn available_commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn execute_command(&self, command: &str, args: &[Value]) -> Result<Value> {
        let args = CommandArgs::new(command, args);

        match command {
            "zigbeeInspect" => Ok(Value::from_serialize(&self.inspect())?),
            "zigbeeRead" => {
                let endpoint = args.integer(0, "endpoint")?;
                let cluster = args.integer(1, "cluster")?;
                let attribute = args.string(2, "attribute")?;
                self.read_attribute(endpoint, cluster, &attribute).await
            }
            "zigbeeFunctional" => {
                let endpoint = args.integer(0, "endpoint")?;
                let cluster = args.integer(1, "cluster")?;
                let cmd = args.string(2, "command")?;
                let payload = args.attributes(3, "payload")?;
                self.invoke_functional(endpoint, cluster, &cmd, payload).await
            }
            "zigbeeFoundation" => {
                let endpoint = args.integer(0, "endpoint")?;
                let cluster = args.integer(1, "cluster")?;
                let cmd = args.string(2, "command")?;
                let payload = args.attributes(3, "payload")?;
                self.invoke_foundation(endpoint, cluster, &cmd, payload).await
            }
            "zigbeeReport" => {
                let endpoint = args.integer(0, "endpoint")?;
                let cluster = args.integer(1, "cluster")?;
                self.configure_reporting(endpoint, cluster).await
            }
            _ => Err(DeviceError::UnknownCommand(command.to_string())),
        }
    }
}
