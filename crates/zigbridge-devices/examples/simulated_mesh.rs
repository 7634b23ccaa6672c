//! Drive a bridge against an in-process simulated coordinator.
//!
//! Run with `cargo run -p zigbridge-devices --example simulated_mesh`. State
//! is kept under `general.data_dir` (`./data` unless `ZIGBRIDGE__GENERAL__DATA_DIR`
//! says otherwise), so a second run starts with the port it saved.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;

use zigbridge_core::config::ConfigBuilder;
use zigbridge_core::logging;
use zigbridge_core::storage::{FileStore, SharedStore};
use zigbridge_core::types::{Attributes, Value};
use zigbridge_devices::adapter::device_key;
use zigbridge_devices::coordinator::{
    completion, ClusterDump, ClusterId, EndpointDump, EndpointId, EndpointRef, MeshDeviceType,
    MeshStatus, TransportError, TransportResult,
};
use zigbridge_devices::{
    Coordinator, CoordinatorEvent, CoordinatorFactory, Endpoint, IeeeAddr, Indication,
    MeshDeviceInfo, RegistryEvent, SharedDeviceRegistry, ZigbeeBridge,
};

const LAMP: IeeeAddr = IeeeAddr::new(0x0017_8801_0203_0405);

#[derive(Debug)]
struct OnOffLight {
    on: Mutex<bool>,
}

impl OnOffLight {
    fn attrs(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("onOff".to_string(), Value::Bool(*self.on.lock().unwrap()));
        attrs
    }
}

#[async_trait]
impl Endpoint for OnOffLight {
    fn id(&self) -> EndpointId {
        11
    }

    fn dump(&self) -> EndpointDump {
        let mut clusters = BTreeMap::new();
        clusters.insert(0x0006, ClusterDump { dir: 1, attrs: self.attrs() });
        EndpointDump {
            ep_id: 11,
            prof_id: 0x0104,
            dev_id: 0x0100,
            clusters,
        }
    }

    async fn read(&self, _cluster: ClusterId, attribute: &str) -> TransportResult<Value> {
        let (completer, done) = completion();
        match self.attrs().get(attribute) {
            Some(value) => completer.resolve(value.clone()),
            None => completer.reject(format!("unsupported attribute {}", attribute)),
        }
        done.await
    }

    async fn foundation(&self, _: ClusterId, _: &str, _: Attributes) -> TransportResult<Value> {
        Ok(Value::Null)
    }

    async fn functional(
        &self,
        _cluster: ClusterId,
        command: &str,
        _payload: Attributes,
    ) -> TransportResult<Value> {
        let mut on = self.on.lock().unwrap();
        match command {
            "on" => *on = true,
            "off" => *on = false,
            "toggle" => *on = !*on,
            other => return Err(TransportError::new(format!("unknown command {}", other))),
        }
        Ok(Value::Bool(*on))
    }

    async fn report(&self, _cluster: ClusterId) -> TransportResult<Value> {
        Ok(Value::Null)
    }
}

#[derive(Debug)]
struct SimulatedCoordinator {
    lamp: Arc<OnOffLight>,
    events: broadcast::Sender<CoordinatorEvent>,
}

#[async_trait]
impl Coordinator for SimulatedCoordinator {
    async fn start(&self) -> TransportResult<()> {
        let _ = self.events.send(CoordinatorEvent::Ready);
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        Ok(())
    }

    fn list(&self, ieee_addr: Option<IeeeAddr>) -> Vec<MeshDeviceInfo> {
        let lamp = MeshDeviceInfo {
            ieee_addr: LAMP,
            nwk_addr: 0x6f21,
            device_type: MeshDeviceType::Router,
            status: MeshStatus::Online,
            manuf_id: Some(0x100b),
            ep_list: vec![11],
        };
        [lamp]
            .into_iter()
            .filter(|d| ieee_addr.map_or(true, |addr| d.ieee_addr == addr))
            .collect()
    }

    fn find(&self, ieee_addr: IeeeAddr, ep_id: EndpointId) -> Option<Arc<dyn Endpoint>> {
        (ieee_addr == LAMP && ep_id == 11).then(|| self.lamp.clone() as Arc<dyn Endpoint>)
    }

    async fn permit_join(&self, duration: Duration) -> TransportResult<()> {
        let _ = self.events.send(CoordinatorEvent::PermitJoining {
            time_left: duration.as_secs() as u16,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug, Default)]
struct SimulatedFactory {
    opened: Mutex<Option<Arc<SimulatedCoordinator>>>,
}

impl CoordinatorFactory for SimulatedFactory {
    fn open(&self, port: &str, database_path: &Path) -> TransportResult<Arc<dyn Coordinator>> {
        info!(port, database = %database_path.display(), "opening simulated coordinator");
        let (events, _) = broadcast::channel(16);
        let coordinator = Arc::new(SimulatedCoordinator {
            lamp: Arc::new(OnOffLight { on: Mutex::new(false) }),
            events,
        });
        *self.opened.lock().unwrap() = Some(coordinator.clone());
        Ok(coordinator)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new().with_default_environment().build()?;
    logging::init_from_config(&config.logging)?;

    let data_dir = config.general.data_path();
    info!(data_dir = %data_dir.display(), "opening store");
    let store: SharedStore = Arc::new(FileStore::open(&data_dir)?);
    let registry = SharedDeviceRegistry::new();
    let factory = Arc::new(SimulatedFactory::default());

    let bridge = ZigbeeBridge::new(config.bridge.clone(), store, registry.clone(), factory.clone())?;

    let mut events = registry.registry().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RegistryEvent::DeviceAdded { id, metadata } => {
                    info!("added {} {:?}", id, metadata.types)
                }
                RegistryEvent::DeviceRemoved(id) => info!("removed {}", id),
                RegistryEvent::DeviceEvent(n) => info!("{} {} {:?}", n.id, n.event, n.payload),
            }
        }
    });

    let state = bridge.init().await?;
    info!(?state, "bridge initialized");

    let bridge_key = bridge.bridge_key();
    let state = registry
        .registry()
        .call(&bridge_key, "connect", &[Value::from("/dev/ttyACM0")])
        .await?;
    info!(?state, "connected");

    let lamp = device_key(LAMP);
    registry
        .registry()
        .call(&lamp, "zigbeeFunctional", &[Value::Integer(11), "0x0006".into(), "toggle".into()])
        .await?;
    let on = registry
        .registry()
        .call(&lamp, "zigbeeRead", &[Value::Integer(11), Value::Integer(6), "onOff".into()])
        .await?;
    info!(?on, "lamp state");

    let mut report = Attributes::new();
    report.insert("onOff".to_string(), on);
    if let Some(coordinator) = factory.opened.lock().unwrap().clone() {
        let _ = coordinator
            .events
            .send(CoordinatorEvent::Indication(Indication::DeviceChange {
                endpoints: vec![EndpointRef { ieee_addr: LAMP, ep_id: 11 }],
                cluster: 6,
                data: report,
            }));
    }

    registry.registry().call(&bridge_key, "permitJoin", &[]).await?;

    let inspection = registry.registry().call(&lamp, "zigbeeInspect", &[]).await?;
    println!("{}", serde_json::to_string_pretty(&serde_json::Value::from(inspection))?);

    tokio::time::sleep(Duration::from_millis(100)).await;
    bridge.shutdown().await?;
    Ok(())
}
