/*!
 * In-memory coordinator stack for tests.
 */
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use zigbridge_core::types::{Attributes, Value};

use crate::coordinator::{
    completion, ClusterId, Coordinator, CoordinatorEvent, CoordinatorFactory, Endpoint,
    EndpointDump, EndpointId, IeeeAddr, MeshDeviceInfo, MeshDeviceType, MeshStatus,
    TransportError, TransportResult,
};

/// Endpoint answering from its dump and recording every request
#[derive(Debug)]
pub struct MockEndpoint {
    dump: EndpointDump,
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
}

impl MockEndpoint {
    pub fn new(dump: EndpointDump) -> Arc<Self> {
        Arc::new(Self {
            dump,
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        })
    }

    pub fn bare(ep_id: EndpointId) -> Arc<Self> {
        Self::new(EndpointDump {
            ep_id,
            prof_id: 0x0104,
            dev_id: 0x0100,
            clusters: BTreeMap::new(),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    /// Record the call and answer asynchronously, like a stack settling a
    /// request from its own callback.
    async fn respond(&self, call: String, value: Value) -> TransportResult<Value> {
        self.calls.lock().unwrap().push(call);
        let failure = self.failure.lock().unwrap().clone();

        let (completer, done) = completion();
        tokio::spawn(async move {
            match failure {
                Some(message) => completer.reject(message),
                None => completer.resolve(value),
            }
        });
        done.await
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn id(&self) -> EndpointId {
        self.dump.ep_id
    }

    fn dump(&self) -> EndpointDump {
        self.dump.clone()
    }

    async fn read(&self, cluster: ClusterId, attribute: &str) -> TransportResult<Value> {
        let value = self
            .dump
            .clusters
            .get(&cluster)
            .and_then(|c| c.attrs.get(attribute))
            .cloned()
            .unwrap_or_default();
        self.respond(format!("read:{}:{}", cluster, attribute), value)
            .await
    }

    async fn foundation(
        &self,
        cluster: ClusterId,
        command: &str,
        payload: Attributes,
    ) -> TransportResult<Value> {
        let call = format!("foundation:{}:{}:{}", cluster, command, payload.len());
        self.respond(call, Value::Object(payload)).await
    }

    async fn functional(
        &self,
        cluster: ClusterId,
        command: &str,
        payload: Attributes,
    ) -> TransportResult<Value> {
        let call = format!("functional:{}:{}:{}", cluster, command, payload.len());
        self.respond(call, Value::Object(payload)).await
    }

    async fn report(&self, cluster: ClusterId) -> TransportResult<Value> {
        self.respond(format!("report:{}", cluster), Value::Null).await
    }
}

type DeviceEntry = (MeshDeviceInfo, BTreeMap<EndpointId, Arc<MockEndpoint>>);

/// Coordinator whose mesh is a table the test edits directly
#[derive(Debug)]
pub struct MockCoordinator {
    port: String,
    database_path: PathBuf,
    devices: Mutex<BTreeMap<IeeeAddr, DeviceEntry>>,
    events: broadcast::Sender<CoordinatorEvent>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: Mutex<Option<String>>,
    fail_stop: Mutex<Option<String>>,
    start_delay: Mutex<Duration>,
    permit_joins: Mutex<Vec<Duration>>,
    fail_permit_join: Mutex<Option<String>>,
}

impl MockCoordinator {
    pub fn new(port: &str) -> Arc<Self> {
        Self::with_database(port, Path::new("dev.db"))
    }

    fn with_database(port: &str, database_path: &Path) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            port: port.to_string(),
            database_path: database_path.to_path_buf(),
            devices: Mutex::new(BTreeMap::new()),
            events,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_start: Mutex::new(None),
            fail_stop: Mutex::new(None),
            start_delay: Mutex::new(Duration::ZERO),
            permit_joins: Mutex::new(Vec::new()),
            fail_permit_join: Mutex::new(None),
        })
    }

    /// Descriptor of an online router
    pub fn device(ieee_addr: IeeeAddr, nwk_addr: u16, ep_list: &[EndpointId]) -> MeshDeviceInfo {
        MeshDeviceInfo {
            ieee_addr,
            nwk_addr,
            device_type: MeshDeviceType::Router,
            status: MeshStatus::Online,
            manuf_id: Some(0x115f),
            ep_list: ep_list.to_vec(),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    /// Add or replace a device and its endpoints
    pub fn add_device(&self, info: MeshDeviceInfo, endpoints: Vec<Arc<MockEndpoint>>) {
        let endpoints = endpoints.into_iter().map(|ep| (ep.id(), ep)).collect();
        self.devices
            .lock()
            .unwrap()
            .insert(info.ieee_addr, (info, endpoints));
    }

    pub fn remove_device(&self, ieee_addr: IeeeAddr) {
        self.devices.lock().unwrap().remove(&ieee_addr);
    }

    pub fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    pub fn fail_start(&self, message: Option<&str>) {
        *self.fail_start.lock().unwrap() = message.map(str::to_string);
    }

    pub fn fail_stop(&self, message: Option<&str>) {
        *self.fail_stop.lock().unwrap() = message.map(str::to_string);
    }

    pub fn delay_start(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub fn fail_permit_join(&self, message: Option<&str>) {
        *self.fail_permit_join.lock().unwrap() = message.map(str::to_string);
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn permit_joins(&self) -> Vec<Duration> {
        self.permit_joins.lock().unwrap().clone()
    }
}

#[async_trait]
impl Coordinator for MockCoordinator {
    async fn start(&self) -> TransportResult<()> {
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.starts.fetch_add(1, Ordering::SeqCst);
        let failure = self.fail_start.lock().unwrap().clone();
        match failure {
            Some(message) => Err(TransportError::new(message)),
            None => Ok(()),
        }
    }

    async fn stop(&self) -> TransportResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let failure = self.fail_stop.lock().unwrap().clone();
        match failure {
            Some(message) => Err(TransportError::new(message)),
            None => Ok(()),
        }
    }

    fn list(&self, ieee_addr: Option<IeeeAddr>) -> Vec<MeshDeviceInfo> {
        let devices = self.devices.lock().unwrap();
        devices
            .values()
            .filter(|(info, _)| ieee_addr.map_or(true, |addr| info.ieee_addr == addr))
            .map(|(info, _)| info.clone())
            .collect()
    }

    fn find(&self, ieee_addr: IeeeAddr, ep_id: EndpointId) -> Option<Arc<dyn Endpoint>> {
        let devices = self.devices.lock().unwrap();
        let (_, endpoints) = devices.get(&ieee_addr)?;
        endpoints
            .get(&ep_id)
            .map(|ep| ep.clone() as Arc<dyn Endpoint>)
    }

    async fn permit_join(&self, duration: Duration) -> TransportResult<()> {
        self.permit_joins.lock().unwrap().push(duration);
        if let Some(message) = self.fail_permit_join.lock().unwrap().clone() {
            return Err(TransportError::new(message));
        }
        self.emit(CoordinatorEvent::PermitJoining {
            time_left: duration.as_secs() as u16,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    fn info(&self) -> Value {
        let mut info = Attributes::new();
        info.insert("port".to_string(), self.port.clone().into());
        info.insert("panId".to_string(), Value::Integer(0x1a62));
        Value::Object(info)
    }
}

/// Factory handing out [`MockCoordinator`]s pre-populated with a device table
#[derive(Debug, Default)]
pub struct MockFactory {
    opened: Mutex<Vec<Arc<MockCoordinator>>>,
    template: Mutex<Vec<(MeshDeviceInfo, Vec<Arc<MockEndpoint>>)>>,
    fail_start: Mutex<Option<String>>,
    start_delay: Mutex<Duration>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Device present on every coordinator opened from now on
    pub fn with_device(&self, info: MeshDeviceInfo, endpoints: Vec<Arc<MockEndpoint>>) {
        self.template.lock().unwrap().push((info, endpoints));
    }

    /// Make coordinators opened from now on fail to start
    pub fn fail_start(&self, message: Option<&str>) {
        *self.fail_start.lock().unwrap() = message.map(str::to_string);
    }

    pub fn delay_start(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub fn opened_ports(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.port().to_string())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<MockCoordinator>> {
        self.opened.lock().unwrap().last().cloned()
    }

    pub fn nth(&self, index: usize) -> Option<Arc<MockCoordinator>> {
        self.opened.lock().unwrap().get(index).cloned()
    }
}

impl CoordinatorFactory for MockFactory {
    fn open(&self, port: &str, database_path: &Path) -> TransportResult<Arc<dyn Coordinator>> {
        let coordinator = MockCoordinator::with_database(port, database_path);
        for (info, endpoints) in self.template.lock().unwrap().iter() {
            coordinator.add_device(info.clone(), endpoints.clone());
        }
        coordinator.fail_start(self.fail_start.lock().unwrap().as_deref());
        coordinator.delay_start(*self.start_delay.lock().unwrap());

        self.opened.lock().unwrap().push(coordinator.clone());
        Ok(coordinator)
    }
}
