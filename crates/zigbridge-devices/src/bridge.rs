/*!
 * Zigbee bridge.
 *
 * [`ZigbeeBridge`] owns the coordinator link and mirrors the mesh into the
 * device registry: every routable mesh device gets a [`ZigbeeDevice`] entry,
 * attribute reports become `zigbee:value` notifications, and a bridge-level
 * entry exposes connection management. Connection handling lives in
 * [`crate::connection`].
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use zigbridge_core::config::BridgeConfig;
use zigbridge_core::error::Error as CoreError;
use zigbridge_core::logging::component_span;
use zigbridge_core::storage::{KeyValueStore, SharedStore};
use zigbridge_core::types::{Attributes, Id};
use zigbridge_core::utils::spawn_and_log;

use crate::adapter::{ValueChange, ZigbeeDevice, VALUE_EVENT};
use crate::connection::{ConnectionState, ControllerConfig, PendingConnect, CONTROLLER_KEY};
use crate::coordinator::{
    ClusterId, Coordinator, CoordinatorEvent, CoordinatorFactory, EndpointRef, IeeeAddr,
    Indication, MeshDeviceInfo, TransportError,
};
use crate::device::{DeviceError, Result};
use crate::management::BridgeDevice;
use crate::registry::{DeviceHandle, SharedDeviceRegistry};

/// Store key of the generated machine identifier
pub const MACHINE_ID_KEY: &str = "zigbee:machine-id";

/// Directory under the data directory holding the coordinator database
pub const DATABASE_DIR: &str = "zigbee";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// The live coordinator link
pub(crate) struct ActiveLink {
    pub(crate) port: String,
    pub(crate) coordinator: Arc<dyn Coordinator>,
    pub(crate) pump: Option<JoinHandle<()>>,
}

struct TrackedDevice {
    device: Arc<ZigbeeDevice>,
    handle: DeviceHandle,
}

pub(crate) struct BridgeInner {
    pub(crate) config: BridgeConfig,
    pub(crate) store: SharedStore,
    pub(crate) factory: Arc<dyn CoordinatorFactory>,
    registry: SharedDeviceRegistry,
    machine_id: String,
    pub(crate) controller: Mutex<ControllerConfig>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) link: RwLock<Option<ActiveLink>>,
    pub(crate) pending: Mutex<Option<PendingConnect>>,
    devices: Mutex<HashMap<IeeeAddr, TrackedDevice>>,
    bridge_handle: Mutex<Option<DeviceHandle>>,
}

impl fmt::Debug for BridgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeInner")
            .field("machine_id", &self.machine_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Bridge between a Zigbee coordinator and the device registry
///
/// Cloning is cheap; all clones share the same link and device table.
#[derive(Debug, Clone)]
pub struct ZigbeeBridge {
    pub(crate) inner: Arc<BridgeInner>,
}

impl ZigbeeBridge {
    /// Create a bridge, restoring the persisted controller port
    ///
    /// No link is opened until [`init`](Self::init) or
    /// [`connect`](Self::connect) is called.
    pub fn new(
        config: BridgeConfig,
        store: SharedStore,
        registry: SharedDeviceRegistry,
        factory: Arc<dyn CoordinatorFactory>,
    ) -> Result<Self> {
        let controller = store
            .load::<ControllerConfig>(CONTROLLER_KEY)?
            .unwrap_or_default();

        let machine_id = match config.machine_id.clone() {
            Some(id) => id,
            None => match store.load::<String>(MACHINE_ID_KEY)? {
                Some(id) => id,
                None => {
                    let id = Id::new().to_string();
                    store.save(MACHINE_ID_KEY, &id)?;
                    debug!(machine_id = %id, "generated machine id");
                    id
                }
            },
        };

        let (state, _) = watch::channel(ConnectionState {
            configured: controller.port.is_some(),
            connected: false,
        });

        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                store,
                factory,
                registry,
                machine_id,
                controller: Mutex::new(controller),
                state,
                link: RwLock::new(None),
                pending: Mutex::new(None),
                devices: Mutex::new(HashMap::new()),
                bridge_handle: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn upgrade(inner: &Weak<BridgeInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Identifier of the machine running the bridge
    pub fn machine_id(&self) -> &str {
        &self.inner.machine_id
    }

    /// Registry key of the bridge entry
    pub fn bridge_key(&self) -> Id {
        Id::from(format!("zigbee:bridge:{}", self.inner.machine_id))
    }

    /// The registry devices are published to
    pub fn registry(&self) -> &SharedDeviceRegistry {
        &self.inner.registry
    }

    /// Path of the coordinator network database
    pub fn database_path(&self) -> PathBuf {
        self.inner
            .store
            .data_dir()
            .join(DATABASE_DIR)
            .join(&self.inner.config.database_file)
    }

    /// Register the bridge entry and connect with the persisted port
    pub async fn init(&self) -> Result<ConnectionState> {
        let database_dir = self.inner.store.data_dir().join(DATABASE_DIR);
        std::fs::create_dir_all(&database_dir).map_err(CoreError::from)?;

        {
            let mut bridge_handle = lock(&self.inner.bridge_handle);
            if bridge_handle.is_none() {
                let device = Arc::new(BridgeDevice::new(Arc::downgrade(&self.inner)));
                *bridge_handle = Some(self.inner.registry.register(self.bridge_key(), device)?);
                info!(machine_id = %self.inner.machine_id, "zigbee bridge registered");
            }
        }

        self.reconnect().await
    }

    /// Stop the link and remove every registry entry the bridge created
    pub async fn shutdown(&self) -> Result<()> {
        let pending = lock(&self.inner.pending).clone();
        if let Some(attempt) = pending {
            if let Err(err) = attempt.await {
                debug!("connection attempt failed during shutdown: {}", err);
            }
        }

        self.teardown().await;

        let tracked: Vec<TrackedDevice> = lock(&self.inner.devices)
            .drain()
            .map(|(_, tracked)| tracked)
            .collect();
        for tracked in tracked {
            if let Err(err) = tracked.handle.remove() {
                warn!(ieee_addr = %tracked.device.ieee_addr(), "failed to unregister device: {}", err);
            }
        }

        let bridge_handle = lock(&self.inner.bridge_handle).take();
        if let Some(handle) = bridge_handle {
            handle.remove()?;
        }

        info!("zigbee bridge shut down");
        Ok(())
    }

    /// The coordinator of the live link, if any
    pub fn coordinator(&self) -> Option<Arc<dyn Coordinator>> {
        read(&self.inner.link)
            .as_ref()
            .map(|link| link.coordinator.clone())
    }

    /// Devices known to the coordinator
    pub fn list(&self, ieee_addr: Option<IeeeAddr>) -> Result<Vec<MeshDeviceInfo>> {
        let coordinator = self.coordinator().ok_or(DeviceError::NotConnected)?;
        Ok(coordinator.list(ieee_addr))
    }

    /// Open the join window for the configured duration
    ///
    /// Returns once the request is issued; the outcome is only logged.
    pub fn permit_join(&self) -> Result<()> {
        let coordinator = self.coordinator().ok_or(DeviceError::NotConnected)?;
        let duration = self.inner.config.permit_join_duration();

        spawn_and_log("permit-join", async move {
            coordinator.permit_join(duration).await?;
            info!("devices can now join for {}s", duration.as_secs());
            Ok::<_, TransportError>(())
        });
        Ok(())
    }

    /// Adapter registered for `ieee_addr`, if the device is tracked
    pub fn device(&self, ieee_addr: IeeeAddr) -> Option<Arc<ZigbeeDevice>> {
        lock(&self.inner.devices)
            .get(&ieee_addr)
            .map(|tracked| tracked.device.clone())
    }

    /// Hardware addresses of all tracked devices, sorted
    pub fn tracked_devices(&self) -> Vec<IeeeAddr> {
        let mut addrs: Vec<IeeeAddr> = lock(&self.inner.devices).keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// Process an event as if the live coordinator had emitted it
    pub fn handle_event(&self, event: CoordinatorEvent) {
        match self.coordinator() {
            Some(coordinator) => self.process_event(&coordinator, event),
            None => debug!("ignoring coordinator event without a link: {:?}", event),
        }
    }

    pub(crate) fn process_event(&self, coordinator: &Arc<dyn Coordinator>, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Ready => debug!("coordinator ready"),
            CoordinatorEvent::Error(message) => warn!("coordinator error: {}", message),
            CoordinatorEvent::PermitJoining { time_left: 0 } => {
                info!("no longer allowing devices to join")
            }
            CoordinatorEvent::PermitJoining { time_left } => {
                trace!(time_left, "join window open")
            }
            CoordinatorEvent::Indication(indication) => {
                self.handle_indication(coordinator, indication)
            }
        }
    }

    fn handle_indication(&self, coordinator: &Arc<dyn Coordinator>, indication: Indication) {
        match indication {
            Indication::DeviceIncoming { ieee_addr } => {
                debug!(%ieee_addr, "device incoming");
                for info in coordinator.list(Some(ieee_addr)) {
                    self.register_device(coordinator, &info);
                }
            }
            Indication::DeviceChange {
                endpoints,
                cluster,
                data,
            } => self.forward_changes(&endpoints, cluster, &data),
            Indication::DeviceLeaving { ieee_addr } => {
                info!(%ieee_addr, "device leaving the network");
            }
            Indication::Other { kind } => trace!(kind = %kind, "unhandled indication"),
        }
    }

    /// Register every device the coordinator currently knows
    pub(crate) fn resync(&self, coordinator: &Arc<dyn Coordinator>) {
        let devices = coordinator.list(None);
        debug!(count = devices.len(), "resynchronizing devices");
        for info in &devices {
            self.register_device(coordinator, info);
        }
    }

    fn register_device(&self, coordinator: &Arc<dyn Coordinator>, info: &MeshDeviceInfo) {
        if info.nwk_addr == 0 {
            trace!(ieee_addr = %info.ieee_addr, "skipping device without a network address");
            return;
        }

        let endpoints: BTreeMap<_, _> = info
            .ep_list
            .iter()
            .filter_map(|&ep_id| {
                coordinator
                    .find(info.ieee_addr, ep_id)
                    .map(|endpoint| (ep_id, endpoint))
            })
            .collect();
        let device = Arc::new(ZigbeeDevice::new(coordinator.clone(), info, endpoints));

        let mut devices = lock(&self.inner.devices);
        if let Some(previous) = devices.remove(&info.ieee_addr) {
            if let Err(err) = previous.handle.remove() {
                warn!(ieee_addr = %info.ieee_addr, "failed to unregister previous entry: {}", err);
            }
        }

        match self.inner.registry.register(device.key(), device.clone()) {
            Ok(handle) => {
                info!(
                    ieee_addr = %info.ieee_addr,
                    nwk_addr = info.nwk_addr,
                    endpoints = ?device.endpoint_ids(),
                    "registered zigbee device"
                );
                devices.insert(info.ieee_addr, TrackedDevice { device, handle });
            }
            Err(err) => warn!(ieee_addr = %info.ieee_addr, "failed to register device: {}", err),
        }
    }

    fn forward_changes(&self, endpoints: &[EndpointRef], cluster: ClusterId, data: &Attributes) {
        let devices = lock(&self.inner.devices);
        for endpoint in endpoints {
            let Some(tracked) = devices.get(&endpoint.ieee_addr) else {
                trace!(ieee_addr = %endpoint.ieee_addr, "change for untracked device");
                continue;
            };

            for (attribute, value) in data {
                let change = ValueChange {
                    endpoint: endpoint.ep_id,
                    cluster,
                    attribute: attribute.clone(),
                    new_value: value.clone(),
                };
                if let Err(err) = tracked.handle.emit(VALUE_EVENT, change) {
                    warn!(ieee_addr = %endpoint.ieee_addr, "failed to emit value change: {}", err);
                }
            }
        }
    }

    /// Forward link events to the bridge in emission order
    pub(crate) fn spawn_pump(
        &self,
        coordinator: Arc<dyn Coordinator>,
        mut events: broadcast::Receiver<CoordinatorEvent>,
    ) -> JoinHandle<()> {
        let bridge = Arc::downgrade(&self.inner);
        let span = component_span("zigbee-bridge", Some(self.inner.machine_id.as_str()));

        tokio::spawn(
            async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let Some(bridge) = ZigbeeBridge::upgrade(&bridge) else {
                                break;
                            };
                            bridge.process_event(&coordinator, event);
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(
                                "event pump lagged, {} coordinator events lost, resynchronizing",
                                missed
                            );
                            let Some(bridge) = ZigbeeBridge::upgrade(&bridge) else {
                                break;
                            };
                            bridge.resync(&coordinator);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                trace!("event pump stopped");
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use zigbridge_core::storage::MemoryStore;
    use zigbridge_core::types::Value;

    use crate::coordinator::MeshStatus;
    use crate::device::{Device, DeviceCapability};
    use crate::mock::{MockCoordinator, MockEndpoint, MockFactory};
    use crate::registry::RegistryEvent;

    const HUB: IeeeAddr = IeeeAddr::new(0x00124b00_0000_0001);
    const LAMP: IeeeAddr = IeeeAddr::new(0x00124b00_1122_3344);
    const SENSOR: IeeeAddr = IeeeAddr::new(0x00158d00_0a0b_0c0d);

    struct Fixture {
        bridge: ZigbeeBridge,
        factory: Arc<MockFactory>,
        registry: SharedDeviceRegistry,
        store: SharedStore,
        _dir: TempDir,
    }

    fn fixture(port: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: SharedStore = Arc::new(MemoryStore::new(dir.path()));
        if let Some(port) = port {
            store
                .save(
                    CONTROLLER_KEY,
                    &ControllerConfig {
                        port: Some(port.to_string()),
                    },
                )
                .unwrap();
        }

        let factory = MockFactory::new();
        factory.with_device(MockCoordinator::device(HUB, 0, &[1]), vec![MockEndpoint::bare(1)]);
        factory.with_device(
            MockCoordinator::device(LAMP, 0x4a1b, &[1, 2]),
            vec![MockEndpoint::bare(1), MockEndpoint::bare(2)],
        );

        let registry = SharedDeviceRegistry::new();
        let bridge = ZigbeeBridge::new(
            BridgeConfig::default(),
            store.clone(),
            registry.clone(),
            factory.clone(),
        )
        .unwrap();

        Fixture {
            bridge,
            factory,
            registry,
            store,
            _dir: dir,
        }
    }

    fn lamp_key() -> Id {
        crate::adapter::device_key(LAMP)
    }

    fn drain(events: &mut broadcast::Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test]
    async fn test_machine_id_is_generated_once() {
        let f = fixture(None);
        let stored: Option<String> = f.store.load(MACHINE_ID_KEY).unwrap();
        assert_eq!(stored.as_deref(), Some(f.bridge.machine_id()));

        let again = ZigbeeBridge::new(
            BridgeConfig::default(),
            f.store.clone(),
            f.registry.clone(),
            f.factory.clone(),
        )
        .unwrap();
        assert_eq!(again.machine_id(), f.bridge.machine_id());

        let fixed = ZigbeeBridge::new(
            BridgeConfig {
                machine_id: Some("kitchen-pi".to_string()),
                ..BridgeConfig::default()
            },
            f.store.clone(),
            f.registry.clone(),
            f.factory.clone(),
        )
        .unwrap();
        assert_eq!(fixed.bridge_key().as_str(), "zigbee:bridge:kitchen-pi");
    }

    #[test_log::test(tokio::test)]
    async fn test_resync_skips_coordinator_placeholder() {
        let f = fixture(None);
        f.bridge.connect(Some("/dev/ttyACM0".to_string())).await.unwrap();

        assert_eq!(f.bridge.tracked_devices(), vec![LAMP]);
        assert!(f.registry.registry().has_device(&lamp_key()).unwrap());
        assert!(!f
            .registry
            .registry()
            .has_device(&crate::adapter::device_key(HUB))
            .unwrap());
        assert_eq!(f.bridge.device(LAMP).unwrap().endpoint_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_rejoin_replaces_entry_exactly_once() {
        let f = fixture(None);
        f.bridge.connect(Some("/dev/ttyACM0".to_string())).await.unwrap();
        let coordinator = f.factory.last().unwrap();
        let mut events = f.registry.registry().subscribe();

        for nwk_addr in [0x1111, 0x2222] {
            coordinator.add_device(
                MockCoordinator::device(LAMP, nwk_addr, &[1]),
                vec![MockEndpoint::bare(1)],
            );
            f.bridge.handle_event(CoordinatorEvent::Indication(Indication::DeviceIncoming {
                ieee_addr: LAMP,
            }));
        }

        let events = drain(&mut events);
        let removed = events
            .iter()
            .filter(|e| matches!(e, RegistryEvent::DeviceRemoved(id) if *id == lamp_key()))
            .count();
        let added = events
            .iter()
            .filter(|e| matches!(e, RegistryEvent::DeviceAdded { id, .. } if *id == lamp_key()))
            .count();
        assert_eq!(removed, 2);
        assert_eq!(added, 2);

        assert_eq!(f.registry.registry().count_devices().unwrap(), 1);
        assert_eq!(f.bridge.device(LAMP).unwrap().endpoint_ids(), vec![1]);
        assert_eq!(f.bridge.device(LAMP).unwrap().inspect().network_addr, Some(0x2222));
    }

    #[tokio::test]
    async fn test_incoming_placeholder_is_never_registered() {
        let f = fixture(None);
        f.bridge.connect(Some("/dev/ttyACM0".to_string())).await.unwrap();
        let coordinator = f.factory.last().unwrap();
        coordinator.add_device(MockCoordinator::device(SENSOR, 0, &[1]), vec![MockEndpoint::bare(1)]);

        f.bridge.handle_event(CoordinatorEvent::Indication(Indication::DeviceIncoming {
            ieee_addr: SENSOR,
        }));

        assert!(f.bridge.device(SENSOR).is_none());
        assert_eq!(f.registry.registry().count_devices().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_change_indication_emits_one_event_per_attribute() {
        let f = fixture(None);
        f.bridge.connect(Some("/dev/ttyACM0".to_string())).await.unwrap();
        let mut events = f.registry.registry().subscribe();

        let mut data = Attributes::new();
        data.insert("measuredValue".to_string(), Value::Integer(2150));
        data.insert("minMeasuredValue".to_string(), Value::Integer(-4000));
        data.insert("maxMeasuredValue".to_string(), Value::Integer(12500));

        f.bridge.handle_event(CoordinatorEvent::Indication(Indication::DeviceChange {
            endpoints: vec![
                EndpointRef {
                    ieee_addr: LAMP,
                    ep_id: 2,
                },
                EndpointRef {
                    ieee_addr: SENSOR,
                    ep_id: 1,
                },
            ],
            cluster: 0x0402,
            data,
        }));

        let notifications: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                RegistryEvent::DeviceEvent(notification) => Some(notification),
                _ => None,
            })
            .collect();
        assert_eq!(notifications.len(), 3);

        for notification in &notifications {
            assert_eq!(notification.id, lamp_key());
            assert_eq!(notification.event, VALUE_EVENT);
            let payload = notification.payload.as_object().unwrap();
            assert_eq!(payload.get("endpoint"), Some(&Value::Integer(2)));
            assert_eq!(payload.get("cluster"), Some(&Value::Integer(0x0402)));
        }

        let first = notifications[0].payload.as_object().unwrap();
        assert_eq!(first.get("attribute"), Some(&Value::from("maxMeasuredValue")));
        assert_eq!(first.get("newValue"), Some(&Value::Integer(12500)));
    }

    #[tokio::test]
    async fn test_pump_forwards_link_events() {
        let f = fixture(None);
        f.bridge.connect(Some("/dev/ttyACM0".to_string())).await.unwrap();
        let mut events = f.registry.registry().subscribe();

        let mut data = Attributes::new();
        data.insert("onOff".to_string(), Value::Bool(false));
        f.factory
            .last()
            .unwrap()
            .emit(CoordinatorEvent::Indication(Indication::DeviceChange {
                endpoints: vec![EndpointRef {
                    ieee_addr: LAMP,
                    ep_id: 1,
                }],
                cluster: 6,
                data,
            }));

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            RegistryEvent::DeviceEvent(notification) => {
                assert_eq!(notification.id, lamp_key());
                let payload = notification.payload.as_object().unwrap();
                assert_eq!(payload.get("newValue"), Some(&Value::Bool(false)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_lagging_pump_resynchronizes() {
        let f = fixture(None);
        f.bridge.connect(Some("/dev/ttyACM0".to_string())).await.unwrap();
        let coordinator = f.factory.last().unwrap();

        // The pump only runs once this task yields, so the burst overflows it
        // and the join announcement is lost.
        coordinator.add_device(MockCoordinator::device(SENSOR, 0x7c01, &[1]), vec![MockEndpoint::bare(1)]);
        coordinator.emit(CoordinatorEvent::Indication(Indication::DeviceIncoming {
            ieee_addr: SENSOR,
        }));
        for _ in 0..100 {
            coordinator.emit(CoordinatorEvent::PermitJoining { time_left: 60 });
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while f.bridge.device(SENSOR).is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(f.bridge.tracked_devices(), vec![LAMP, SENSOR]);
        assert!(f
            .registry
            .registry()
            .has_device(&crate::adapter::device_key(SENSOR))
            .unwrap());
    }

    #[tokio::test]
    async fn test_failed_permit_join_is_not_fatal() {
        let f = fixture(None);
        f.bridge.connect(Some("/dev/ttyACM0".to_string())).await.unwrap();
        let coordinator = f.factory.last().unwrap();
        coordinator.fail_permit_join(Some("network busy"));

        assert_eq!(f.bridge.permit_join(), Ok(()));
        tokio::time::timeout(Duration::from_secs(1), async {
            while coordinator.permit_joins().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(f.bridge.state().connected);
    }

    #[tokio::test]
    async fn test_leaving_device_lingers() {
        let f = fixture(None);
        f.bridge.connect(Some("/dev/ttyACM0".to_string())).await.unwrap();
        f.factory.last().unwrap().remove_device(LAMP);

        f.bridge.handle_event(CoordinatorEvent::Indication(Indication::DeviceLeaving {
            ieee_addr: LAMP,
        }));

        assert!(f.registry.registry().has_device(&lamp_key()).unwrap());
        let inspection = f.bridge.device(LAMP).unwrap().inspect();
        assert_eq!(inspection.status, MeshStatus::Offline);
    }

    #[tokio::test]
    async fn test_management_requires_link() {
        let f = fixture(None);
        assert_eq!(f.bridge.list(None), Err(DeviceError::NotConnected));
        assert_eq!(f.bridge.permit_join(), Err(DeviceError::NotConnected));
    }

    #[tokio::test]
    async fn test_permit_join_uses_configured_window() {
        let f = fixture(None);
        f.bridge.connect(Some("/dev/ttyACM0".to_string())).await.unwrap();

        f.bridge.permit_join().unwrap();
        let coordinator = f.factory.last().unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while coordinator.permit_joins().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(coordinator.permit_joins(), vec![Duration::from_secs(60)]);
        assert_eq!(f.bridge.list(None).unwrap().len(), 2);
        assert_eq!(f.bridge.list(Some(LAMP)).unwrap().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_init_and_shutdown() {
        let f = fixture(Some("/dev/ttyUSB0"));

        let state = f.bridge.init().await.unwrap();
        assert!(state.configured && state.connected);
        assert!(f.store.data_dir().join(DATABASE_DIR).is_dir());
        assert_eq!(f.factory.opened_ports(), vec!["/dev/ttyUSB0".to_string()]);
        assert_eq!(
            f.factory.last().unwrap().database_path(),
            f.bridge.database_path().as_path()
        );

        let entry = f.registry.registry().get_device(&f.bridge.bridge_key()).unwrap();
        assert!(entry.metadata().has_type("bridge-zigbee"));
        assert!(entry.has_capability(&DeviceCapability::Config));
        assert!(entry.has_capability(&DeviceCapability::State));
        assert_eq!(entry.metadata().name.as_deref(), Some("Zigbee Bridge"));
        assert_eq!(f.registry.registry().count_devices().unwrap(), 2);

        f.bridge.shutdown().await.unwrap();
        assert_eq!(f.registry.registry().count_devices().unwrap(), 0);
        assert_eq!(f.factory.last().unwrap().stop_count(), 1);
        assert!(f.bridge.coordinator().is_none());
        assert!(!f.bridge.state().connected);
    }

    #[tokio::test]
    async fn test_init_without_port_stays_disconnected() {
        let f = fixture(None);
        let state = f.bridge.init().await.unwrap();

        assert_eq!(
            state,
            ConnectionState {
                configured: false,
                connected: false
            }
        );
        assert_eq!(f.factory.open_count(), 0);
        assert_eq!(f.registry.registry().count_devices().unwrap(), 1);
    }
}
