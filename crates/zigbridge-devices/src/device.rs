/*!
 * Device trait and core device abstractions.
 *
 * Everything placed in the registry implements [`Device`]: it describes itself
 * through [`DeviceMetadata`] and exposes commands the registry invokes by name.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use zigbridge_core::{
    error::Error as CoreError,
    types::{Attributes, Id, Value},
};

use crate::coordinator::{EndpointId, TransportError};

/// Error type for device operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The addressed endpoint does not exist on the device
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),

    /// The coordinator stack failed to carry out a request
    #[error("Transport error: {0}")]
    Transport(String),

    /// No coordinator link is established
    #[error("Zigbee needs to be connected")]
    NotConnected,

    /// The device does not offer the command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A command argument is missing or has the wrong shape
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A registry entry already exists under the key
    #[error("Device with ID {0} already registered")]
    AlreadyRegistered(Id),

    /// No registry entry exists under the key
    #[error("Device with ID {0} not registered")]
    NotRegistered(Id),

    /// A lock guarding shared state was poisoned
    #[error("Lock error: {0}")]
    Lock(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl From<TransportError> for DeviceError {
    fn from(err: TransportError) -> Self {
        DeviceError::Transport(err.message().to_string())
    }
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Device capability
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCapability {
    /// The device accepts a user supplied name
    Nameable,
    /// The device exposes configuration commands
    Config,
    /// The device exposes its state
    State,
    /// Custom capability
    Custom(String),
}

/// Registry-facing description of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Device types, most specific last
    #[serde(rename = "type")]
    pub types: Vec<String>,
    /// Device capabilities
    pub capabilities: Vec<DeviceCapability>,
    /// Human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DeviceMetadata {
    /// Create metadata for a single device type
    pub fn new<S: Into<String>>(device_type: S) -> Self {
        Self {
            types: vec![device_type.into()],
            capabilities: Vec::new(),
            name: None,
        }
    }

    /// Add a capability
    pub fn with_capability(mut self, capability: DeviceCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Set the name
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Check if the metadata lists a device type
    pub fn has_type(&self, device_type: &str) -> bool {
        self.types.iter().any(|t| t == device_type)
    }
}

/// The core device trait
///
/// This trait defines the interface for every entry in the device registry.
#[async_trait]
pub trait Device: Send + Sync + Debug {
    /// Get the device metadata
    fn metadata(&self) -> &DeviceMetadata;

    /// Check if the device has a specific capability
    fn has_capability(&self, capability: &DeviceCapability) -> bool {
        self.metadata().capabilities.contains(capability)
    }

    /// Names of the commands the device accepts
    fn available_commands(&self) -> &'static [&'static str];

    /// Check if a command is supported by the device
    fn supports_command(&self, command: &str) -> bool {
        self.available_commands().contains(&command)
    }

    /// Execute a command by name with positional arguments
    async fn execute_command(&self, command: &str, args: &[Value]) -> Result<Value>;
}

/// Positional arguments of a command invocation
///
/// `Null` arguments count as absent, matching callers that pass explicit
/// placeholders for optional trailing parameters.
#[derive(Debug, Clone, Copy)]
pub struct CommandArgs<'a> {
    command: &'a str,
    args: &'a [Value],
}

impl<'a> CommandArgs<'a> {
    /// Wrap the arguments of `command`
    pub fn new(command: &'a str, args: &'a [Value]) -> Self {
        Self { command, args }
    }

    /// Argument at `index`, if present and not null
    pub fn get(&self, index: usize) -> Option<&'a Value> {
        self.args.get(index).filter(|v| !v.is_null())
    }

    /// Argument at `index`, failing when absent
    pub fn required(&self, index: usize, name: &str) -> Result<&'a Value> {
        self.get(index).ok_or_else(|| {
            DeviceError::InvalidArgument(format!("{}: missing {}", self.command, name))
        })
    }

    /// Integer argument; numeric strings in decimal or `0x` hex are accepted
    pub fn integer<T: TryFrom<i64>>(&self, index: usize, name: &str) -> Result<T> {
        let value = self.required(index, name)?;
        let raw = match value {
            Value::String(s) => parse_integer(s),
            other => other.as_integer(),
        };

        raw.and_then(|i| T::try_from(i).ok()).ok_or_else(|| {
            DeviceError::InvalidArgument(format!(
                "{}: {} must be an integer in range, got {:?}",
                self.command, name, value
            ))
        })
    }

    /// String argument; numbers are rendered in decimal
    pub fn string(&self, index: usize, name: &str) -> Result<String> {
        match self.required(index, name)? {
            Value::String(s) => Ok(s.clone()),
            Value::Integer(i) => Ok(i.to_string()),
            other => Err(DeviceError::InvalidArgument(format!(
                "{}: {} must be a string, got {:?}",
                self.command, name, other
            ))),
        }
    }

    /// Optional string argument
    pub fn optional_string(&self, index: usize, name: &str) -> Result<Option<String>> {
        match self.get(index) {
            Some(_) => self.string(index, name).map(Some),
            None => Ok(None),
        }
    }

    /// Attribute map argument; absent means empty
    pub fn attributes(&self, index: usize, name: &str) -> Result<Attributes> {
        match self.get(index) {
            None => Ok(Attributes::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(other) => Err(DeviceError::InvalidArgument(format!(
                "{}: {} must be an object, got {:?}",
                self.command, name, other
            ))),
        }
    }
}

fn parse_integer(s: &str) -> Option<i64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
