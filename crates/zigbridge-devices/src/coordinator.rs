/*!
 * Coordinator link contract.
 *
 * The Zigbee stack itself (framing, security, routing, firmware handling) is an
 * external dependency. This module defines what the bridge needs from it: a
 * link that can be started and stopped, lists the devices it knows, hands out
 * endpoint handles, and broadcasts indications.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

use zigbridge_core::types::{Attributes, Value};

/// Application endpoint number within a mesh device
pub type EndpointId = u8;

/// Cluster identifier
pub type ClusterId = u16;

/// Result type for calls crossing into the coordinator stack
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failure reported by the coordinator stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    /// Create a transport error with a human readable message
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message reported by the stack
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error returned when parsing an [`IeeeAddr`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid IEEE address: {0}")]
pub struct ParseIeeeAddrError(String);

/// Stable 64-bit hardware address of a mesh device
///
/// Rendered as `0x` followed by 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IeeeAddr(u64);

impl IeeeAddr {
    /// Wrap a raw address
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw address
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for IeeeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl FromStr for IeeeAddr {
    type Err = ParseIeeeAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() || digits.len() > 16 {
            return Err(ParseIeeeAddrError(s.to_string()));
        }

        u64::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| ParseIeeeAddrError(s.to_string()))
    }
}

impl TryFrom<String> for IeeeAddr {
    type Error = ParseIeeeAddrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IeeeAddr> for String {
    fn from(addr: IeeeAddr) -> Self {
        addr.to_string()
    }
}

/// Role of a device in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshDeviceType {
    /// The network coordinator
    Coordinator,
    /// A routing node
    Router,
    /// A sleepy or non-routing node
    EndDevice,
}

/// Reachability of a device as tracked by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshStatus {
    /// Reachable
    Online,
    /// Known but not reachable, or no longer listed
    Offline,
}

/// Device descriptor as listed by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshDeviceInfo {
    /// Hardware address
    pub ieee_addr: IeeeAddr,
    /// Network address; reassigned on rejoin, zero for the coordinator itself
    pub nwk_addr: u16,
    /// Device role
    #[serde(rename = "type")]
    pub device_type: MeshDeviceType,
    /// Reachability
    pub status: MeshStatus,
    /// Manufacturer code, when the node reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manuf_id: Option<u16>,
    /// Active endpoints
    #[serde(default)]
    pub ep_list: Vec<EndpointId>,
}

/// Input/output flags of a cluster on an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClusterDirection {
    /// Server side (input) cluster
    pub input: bool,
    /// Client side (output) cluster
    pub output: bool,
}

impl ClusterDirection {
    /// Decode the raw direction code reported by the stack
    ///
    /// Codes 1 and 3 mark an input cluster, code 2 an output cluster.
    pub fn from_code(code: u8) -> Self {
        Self {
            input: code == 1 || code == 3,
            output: code == 2,
        }
    }
}

/// Cached state of a single cluster
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterDump {
    /// Raw direction code
    pub dir: u8,
    /// Last known attribute values
    pub attrs: Attributes,
}

impl ClusterDump {
    /// Decoded direction flags
    pub fn direction(&self) -> ClusterDirection {
        ClusterDirection::from_code(self.dir)
    }
}

/// Snapshot of an endpoint's descriptor and cluster cache
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EndpointDump {
    /// Endpoint number
    pub ep_id: EndpointId,
    /// Application profile identifier
    pub prof_id: u16,
    /// Device role identifier within the profile
    pub dev_id: u16,
    /// Clusters by identifier
    pub clusters: BTreeMap<ClusterId, ClusterDump>,
}

/// Handle to an endpoint owned by the coordinator
#[async_trait]
pub trait Endpoint: Send + Sync + fmt::Debug {
    /// Endpoint number
    fn id(&self) -> EndpointId;

    /// Current descriptor and cached cluster values
    fn dump(&self) -> EndpointDump;

    /// Read one attribute of a cluster
    async fn read(&self, cluster: ClusterId, attribute: &str) -> TransportResult<Value>;

    /// Send a foundation (generic ZCL) command
    async fn foundation(
        &self,
        cluster: ClusterId,
        command: &str,
        payload: Attributes,
    ) -> TransportResult<Value>;

    /// Send a cluster-specific command
    async fn functional(
        &self,
        cluster: ClusterId,
        command: &str,
        payload: Attributes,
    ) -> TransportResult<Value>;

    /// Configure attribute reporting for a cluster
    async fn report(&self, cluster: ClusterId) -> TransportResult<Value>;
}

/// Reference to an endpoint carried in indications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRef {
    /// Owning device
    pub ieee_addr: IeeeAddr,
    /// Endpoint number
    pub ep_id: EndpointId,
}

/// Unsolicited notifications from the mesh
#[derive(Debug, Clone, PartialEq)]
pub enum Indication {
    /// A device joined or was rediscovered
    DeviceIncoming {
        /// Hardware address of the device
        ieee_addr: IeeeAddr,
    },
    /// A device announced that it is leaving
    DeviceLeaving {
        /// Hardware address of the device
        ieee_addr: IeeeAddr,
    },
    /// Attribute values changed on one or more endpoints
    DeviceChange {
        /// Endpoints the change applies to
        endpoints: Vec<EndpointRef>,
        /// Cluster the attributes belong to
        cluster: ClusterId,
        /// Changed attributes and their new values
        data: Attributes,
    },
    /// Any indication the bridge does not act upon
    Other {
        /// Indication type as named by the stack
        kind: String,
    },
}

/// Events broadcast by a coordinator link
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// The stack finished its start-up sequence
    Ready,
    /// A runtime error on the link
    Error(String),
    /// The join window changed; zero means joining is closed
    PermitJoining {
        /// Seconds left in the window
        time_left: u16,
    },
    /// An indication from the mesh
    Indication(Indication),
}

/// A live link to the coordinator hardware
#[async_trait]
pub trait Coordinator: Send + Sync + fmt::Debug {
    /// Open the serial link and start the stack
    async fn start(&self) -> TransportResult<()>;

    /// Stop the stack and release the serial port
    async fn stop(&self) -> TransportResult<()>;

    /// Devices known to the stack, optionally only the one with `ieee_addr`
    fn list(&self, ieee_addr: Option<IeeeAddr>) -> Vec<MeshDeviceInfo>;

    /// Endpoint handle for `ep_id` on the given device
    fn find(&self, ieee_addr: IeeeAddr, ep_id: EndpointId) -> Option<Arc<dyn Endpoint>>;

    /// Allow new devices to join for `duration`
    async fn permit_join(&self, duration: Duration) -> TransportResult<()>;

    /// Subscribe to link events
    ///
    /// Size the channel for a burst of indications. A receiver that falls
    /// behind loses events, and the bridge answers that with a full resync.
    fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent>;

    /// Diagnostic information about the stack and network
    fn info(&self) -> Value {
        Value::Null
    }
}

/// Opens coordinator links for a serial port
pub trait CoordinatorFactory: Send + Sync + fmt::Debug {
    /// Create a (not yet started) link on `port`, persisting the network
    /// database at `database_path`
    fn open(&self, port: &str, database_path: &Path) -> TransportResult<Arc<dyn Coordinator>>;
}

/// Create a single-settlement completion pair
///
/// Stacks built on completion callbacks hand the [`Completer`] to the callback
/// and return the [`Completion`] to the caller. The completer is consumed when
/// it settles, so a request resolves or rejects at most once; dropping it
/// unsettled rejects the completion.
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer(tx), Completion(rx))
}

/// Settling half of a [`completion`] pair
#[derive(Debug)]
pub struct Completer<T>(oneshot::Sender<TransportResult<T>>);

impl<T> Completer<T> {
    /// Settle with a result
    pub fn settle(self, result: TransportResult<T>) {
        // The caller may have stopped waiting; nothing to deliver then.
        let _ = self.0.send(result);
    }

    /// Settle successfully
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    /// Settle with a failure message
    pub fn reject<S: Into<String>>(self, message: S) {
        self.settle(Err(TransportError::new(message)));
    }
}

/// Awaiting half of a [`completion`] pair
#[derive(Debug)]
pub struct Completion<T>(oneshot::Receiver<TransportResult<T>>);

impl<T> Future for Completion<T> {
    type Output = TransportResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|settled| {
            settled.unwrap_or_else(|_| {
                Err(TransportError::new(
                    "request was dropped by the coordinator without a response",
                ))
            })
        })
    }
}
