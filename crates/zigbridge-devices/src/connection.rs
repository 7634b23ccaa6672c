/*!
 * Coordinator connection state machine.
 *
 * A single attempt at a time drives the link towards the desired port: tear
 * down a link on the wrong port, open one on the right port, settle. The
 * attempt runs on its own task and is shared by every caller that asks for a
 * connection while it is outstanding.
 */
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bridge::{lock, read, write, ActiveLink, ZigbeeBridge};
use crate::device::{DeviceError, Result};

/// Store key of the persisted controller configuration
pub const CONTROLLER_KEY: &str = "zigbee:controller";

/// Persisted controller configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Serial port of the coordinator
    #[serde(default)]
    pub port: Option<String>,
}

/// Externally visible connection status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// A port is configured
    pub configured: bool,
    /// A coordinator link is up
    pub connected: bool,
}

/// Outstanding connection attempt, shared by all waiters
pub(crate) type PendingConnect = Shared<BoxFuture<'static, Result<ConnectionState>>>;

enum Step {
    Continue,
    Settled,
}

impl ZigbeeBridge {
    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The configured serial port
    pub fn port(&self) -> Option<String> {
        lock(&self.inner.controller).port.clone()
    }

    /// Point the bridge at `port` and connect
    ///
    /// A changed port is persisted and the link is moved over to it; `None`
    /// clears the port and drops the link, as does an empty or blank port.
    /// An unchanged port returns the current state while connected, and
    /// otherwise joins the outstanding attempt or starts a new one.
    pub async fn connect(&self, port: Option<String>) -> Result<ConnectionState> {
        let port = port.filter(|port| !port.trim().is_empty());
        let changed = {
            let mut controller = lock(&self.inner.controller);
            if controller.port != port {
                let updated = ControllerConfig { port: port.clone() };
                self.inner.store.save(CONTROLLER_KEY, &updated)?;
                *controller = updated;
                true
            } else {
                false
            }
        };

        if changed {
            info!(port = ?port, "coordinator port changed");
            self.inner
                .state
                .send_modify(|state| state.configured = port.is_some());
            return self.reconnect().await;
        }

        let state = self.state();
        let pending = lock(&self.inner.pending).is_some();
        if (state.connected && !pending) || !state.configured {
            return Ok(state);
        }

        self.reconnect().await
    }

    /// Join the outstanding connection attempt, or start one
    pub(crate) async fn reconnect(&self) -> Result<ConnectionState> {
        let attempt = {
            let mut pending = lock(&self.inner.pending);
            match pending.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let bridge = self.clone();
                    let task = tokio::spawn(async move { bridge.drive().await });
                    let attempt = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(DeviceError::Other(format!("connection task failed: {}", err)))
                        })
                    }
                    .boxed()
                    .shared();
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    async fn drive(&self) -> Result<ConnectionState> {
        loop {
            match self.step().await {
                Ok(Step::Continue) => {}
                Ok(Step::Settled) => {
                    let mut pending = lock(&self.inner.pending);
                    if self.link_port() == self.port() {
                        *pending = None;
                        let state = self.state();
                        debug!(?state, "connection settled");
                        return Ok(state);
                    }
                }
                Err(err) => {
                    *lock(&self.inner.pending) = None;
                    return Err(err);
                }
            }
        }
    }

    async fn step(&self) -> Result<Step> {
        let desired = self.port();
        match (self.link_port(), desired) {
            (Some(current), desired) if Some(&current) != desired.as_ref() => {
                self.teardown().await;
                Ok(Step::Continue)
            }
            (None, Some(port)) => {
                self.open_link(&port).await?;
                Ok(Step::Continue)
            }
            _ => Ok(Step::Settled),
        }
    }

    fn link_port(&self) -> Option<String> {
        read(&self.inner.link).as_ref().map(|link| link.port.clone())
    }

    async fn open_link(&self, port: &str) -> Result<()> {
        let database_path = self.database_path();
        info!(port, "connecting to coordinator");

        let coordinator = self.inner.factory.open(port, &database_path)?;
        let events = coordinator.subscribe();
        if let Err(err) = coordinator.start().await {
            error!(port, "failed to start coordinator: {}", err);
            return Err(err.into());
        }

        info!(port, "coordinator connected, discovering devices");
        debug!(info = ?coordinator.info(), "coordinator info");

        *write(&self.inner.link) = Some(ActiveLink {
            port: port.to_string(),
            coordinator: coordinator.clone(),
            pump: None,
        });
        self.inner.state.send_modify(|state| state.connected = true);

        self.resync(&coordinator);
        let pump = self.spawn_pump(coordinator, events);
        if let Some(link) = write(&self.inner.link).as_mut() {
            link.pump = Some(pump);
        }

        Ok(())
    }

    /// Stop the live link, if any
    ///
    /// A failed stop is logged; the link is considered gone either way.
    pub(crate) async fn teardown(&self) {
        let link = write(&self.inner.link).take();
        let Some(link) = link else {
            return;
        };

        if let Some(pump) = link.pump {
            pump.abort();
        }

        info!(port = %link.port, "disconnecting from coordinator");
        if let Err(err) = link.coordinator.stop().await {
            warn!(port = %link.port, "failed to stop coordinator: {}", err);
        }
        self.inner.state.send_modify(|state| state.connected = false);
    }
}
