/*!
 * Device registry for ZigBridge.
 *
 * Entries are keyed by namespaced identifiers (`zigbee:<ieeeAddr>`,
 * `zigbee:bridge:<machineId>`). Whoever registers an entry receives a
 * [`DeviceHandle`] to emit events for it and to remove it again.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use zigbridge_core::types::{Id, Value};

use crate::device::{Device, DeviceError, DeviceMetadata, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An event emitted by a registered device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNotification {
    /// The emitting entry
    pub id: Id,
    /// Event name, e.g. `zigbee:value`
    pub event: String,
    /// Event payload
    pub payload: Value,
    /// When the registry accepted the event
    pub timestamp: DateTime<Utc>,
}

/// Event types for device registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A device was added to the registry
    DeviceAdded {
        /// The device ID
        id: Id,
        /// The device metadata
        metadata: DeviceMetadata,
    },
    /// A device was removed from the registry
    DeviceRemoved(Id),
    /// A registered device emitted an event
    DeviceEvent(DeviceNotification),
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    /// The registered devices
    devices: RwLock<HashMap<Id, Arc<dyn Device>>>,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    fn insert(&self, id: Id, device: Arc<dyn Device>) -> Result<()> {
        let metadata = device.metadata().clone();
        let mut devices = self.devices.write().map_err(|_| {
            DeviceError::Lock("Failed to acquire write lock on device registry".to_string())
        })?;

        if devices.contains_key(&id) {
            return Err(DeviceError::AlreadyRegistered(id));
        }

        devices.insert(id.clone(), device);
        debug!("Registered device with ID {}", id);
        let _ = self
            .event_sender
            .send(RegistryEvent::DeviceAdded { id, metadata });

        Ok(())
    }

    fn remove(&self, id: &Id) -> Result<()> {
        let mut devices = self.devices.write().map_err(|_| {
            DeviceError::Lock("Failed to acquire write lock on device registry".to_string())
        })?;

        if devices.remove(id).is_none() {
            return Err(DeviceError::NotRegistered(id.clone()));
        }

        debug!("Unregistered device with ID {}", id);
        let _ = self.event_sender.send(RegistryEvent::DeviceRemoved(id.clone()));

        Ok(())
    }

    fn emit(&self, id: &Id, event: &str, payload: Value) -> Result<()> {
        if !self.has_device(id)? {
            return Err(DeviceError::NotRegistered(id.clone()));
        }

        trace!("Device {} emitted {}", id, event);
        let _ = self
            .event_sender
            .send(RegistryEvent::DeviceEvent(DeviceNotification {
                id: id.clone(),
                event: event.to_string(),
                payload,
                timestamp: Utc::now(),
            }));

        Ok(())
    }

    /// Get a device by ID
    pub fn get_device(&self, id: &Id) -> Result<Arc<dyn Device>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Lock("Failed to acquire read lock on device registry".to_string())
        })?;

        devices
            .get(id)
            .cloned()
            .ok_or_else(|| DeviceError::NotRegistered(id.clone()))
    }

    /// Get all device IDs
    pub fn get_device_ids(&self) -> Result<Vec<Id>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Lock("Failed to acquire read lock on device registry".to_string())
        })?;

        let mut ids: Vec<Id> = devices.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Get devices by type
    pub fn get_devices_by_type(&self, device_type: &str) -> Result<Vec<Arc<dyn Device>>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Lock("Failed to acquire read lock on device registry".to_string())
        })?;

        Ok(devices
            .values()
            .filter(|device| device.metadata().has_type(device_type))
            .cloned()
            .collect())
    }

    /// Invoke a command on a registered device by name
    pub async fn call(&self, id: &Id, command: &str, args: &[Value]) -> Result<Value> {
        let device = self.get_device(id)?;
        if !device.supports_command(command) {
            return Err(DeviceError::UnknownCommand(command.to_string()));
        }

        debug!("Calling {} on device {}", command, id);
        device.execute_command(command, args).await
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Count registered devices
    pub fn count_devices(&self) -> Result<usize> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Lock("Failed to acquire read lock on device registry".to_string())
        })?;

        Ok(devices.len())
    }

    /// Check if a device is registered
    pub fn has_device(&self, id: &Id) -> Result<bool> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Lock("Failed to acquire read lock on device registry".to_string())
        })?;

        Ok(devices.contains_key(id))
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared device registry that can be cloned
#[derive(Debug, Clone)]
pub struct SharedDeviceRegistry(Arc<DeviceRegistry>);

impl SharedDeviceRegistry {
    /// Create a new shared device registry
    pub fn new() -> Self {
        Self(Arc::new(DeviceRegistry::new()))
    }

    /// Get a reference to the device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.0
    }

    /// Register a device under `id`
    ///
    /// The returned handle is the only way to emit events for the entry or to
    /// remove it.
    pub fn register<I: Into<Id>>(&self, id: I, device: Arc<dyn Device>) -> Result<DeviceHandle> {
        let id = id.into();
        self.0.insert(id.clone(), device)?;
        Ok(DeviceHandle {
            id,
            registry: self.clone(),
        })
    }
}

impl Default for SharedDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<DeviceRegistry> for SharedDeviceRegistry {
    fn as_ref(&self) -> &DeviceRegistry {
        self.registry()
    }
}

/// Registration handle for a single registry entry
#[derive(Debug)]
pub struct DeviceHandle {
    id: Id,
    registry: SharedDeviceRegistry,
}

impl DeviceHandle {
    /// Key the entry is registered under
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Emit an event on behalf of the entry
    pub fn emit<V: Into<Value>>(&self, event: &str, payload: V) -> Result<()> {
        self.registry.0.emit(&self.id, event, payload.into())
    }

    /// Remove the entry from the registry
    pub fn remove(self) -> Result<()> {
        self.registry.0.remove(&self.id)
    }
}
