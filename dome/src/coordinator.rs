//! Dome coordinator
//!
//! Owns the six controllers, the device link and the event dispatcher.
//! Inbound property updates are routed to the controller that owns them,
//! and a single monitor task keeps local state in step with the device:
//!
//! - every tick it polls the resolved properties and re-routes the ones
//!   that changed since last seen
//! - every weather interval it re-evaluates the weather
//! - every tick it re-evaluates telescope following
//! - it routes updates pushed by the link as they arrive

use crate::config::DomeConfig;
use crate::error::{DomeError, DomeResult};
use crate::events::{panic_message, DomeEvent, EventDispatcher, HandlerId};
use crate::home::HomeManager;
use crate::link::{DeviceLink, Property, PropertyElement};
use crate::motion::MotionController;
use crate::parking::{ParkStatus, ParkingController};
use crate::properties::{PropertyMap, PropertyRole, ResolvedProperty, RouteTarget};
use crate::shutter::{ShutterController, ShutterState};
use crate::telescope::TelescopeCoordinator;
use crate::weather::WeatherMonitor;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// =============================================================================
// Shared core
// =============================================================================

struct MonitorHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// State shared by the coordinator and, through weak references, by every
/// controller
pub(crate) struct DomeCore {
    pub(crate) link: Arc<dyn DeviceLink>,
    pub(crate) config: DomeConfig,
    pub(crate) events: EventDispatcher,
    pub(crate) properties: RwLock<PropertyMap>,
    last_seen: RwLock<HashMap<String, Property>>,
    monitor: Mutex<Option<MonitorHandle>>,

    pub(crate) motion: MotionController,
    pub(crate) shutter: ShutterController,
    pub(crate) parking: ParkingController,
    pub(crate) weather: WeatherMonitor,
    pub(crate) telescope: TelescopeCoordinator,
    pub(crate) home: HomeManager,
}

impl DomeCore {
    fn new(link: Arc<dyn DeviceLink>, config: DomeConfig) -> Arc<Self> {
        Arc::new_cyclic(|core: &Weak<DomeCore>| DomeCore {
            motion: MotionController::new(core.clone(), &config.motion),
            shutter: ShutterController::new(core.clone()),
            parking: ParkingController::new(core.clone(), config.park_position),
            weather: WeatherMonitor::new(core.clone(), &config.weather),
            telescope: TelescopeCoordinator::new(core.clone(), &config.telescope),
            home: HomeManager::new(core.clone(), &config.home),
            events: EventDispatcher::new(config.event_buffer_size),
            link,
            properties: RwLock::new(PropertyMap::default()),
            last_seen: RwLock::new(HashMap::new()),
            monitor: Mutex::new(None),
            config,
        })
    }

    pub(crate) fn device(&self) -> &str {
        self.link.device_name()
    }

    pub(crate) async fn ensure_connected(&self) -> DomeResult<()> {
        if self.link.is_connected().await {
            Ok(())
        } else {
            Err(DomeError::NotConnected)
        }
    }

    pub(crate) async fn resolved(&self, role: PropertyRole) -> Option<ResolvedProperty> {
        self.properties.read().await.get(role).cloned()
    }

    /// Resolved property for `role`, or `PropertyNotFound`
    pub(crate) async fn require(&self, role: PropertyRole) -> DomeResult<ResolvedProperty> {
        self.resolved(role)
            .await
            .ok_or_else(|| DomeError::PropertyNotFound(format!("{:?}", role)))
    }

    pub(crate) async fn send(&self, property: &str, values: Vec<PropertyElement>) -> DomeResult<()> {
        tracing::debug!("[{}] -> {} {:?}", self.device(), property, values);
        self.link.send_command(property, values).await
    }

    /// Send a one-element switch command
    pub(crate) async fn send_switch(&self, property: &str, element: &str) -> DomeResult<()> {
        self.send(property, vec![PropertyElement::switch(element, true)])
            .await
    }

    /// Log a failed command at the level its error kind calls for
    pub(crate) fn logged<T>(&self, result: DomeResult<T>, operation: &str) -> DomeResult<T> {
        if let Err(e) = &result {
            e.log(self.device(), operation);
        }
        result
    }

    pub(crate) async fn emit(&self, event: DomeEvent) {
        self.events.emit(event).await;
    }

    /// Hand a property update to the controller that owns it
    pub(crate) async fn route(&self, property: &Property) {
        let target = self.properties.read().await.route(&property.name);
        let result = match target {
            Some(RouteTarget::Motion) => self.motion.handle_property(property).await,
            Some(RouteTarget::Shutter) => self.shutter.handle_property(property).await,
            Some(RouteTarget::Parking) => self.parking.handle_property(property).await,
            Some(RouteTarget::Weather) => self.weather.handle_property(property).await,
            Some(RouteTarget::Telescope) => self.telescope.handle_property(property).await,
            Some(RouteTarget::Home) => self.home.handle_property(property).await,
            None => {
                tracing::trace!("[{}] Ignoring {}", self.device(), property.name);
                return;
            }
        };
        if let Err(e) = result {
            e.log(self.device(), &format!("{} update", property.name));
        }
    }

    /// Record an update as seen, then route it
    pub(crate) async fn ingest(&self, property: Property) {
        self.last_seen
            .write()
            .await
            .insert(property.name.clone(), property.clone());
        self.route(&property).await;
    }

    /// Resolve the property map and route every resolved property once
    async fn sync_properties(&self) {
        let map = PropertyMap::resolve(self.link.as_ref()).await;
        tracing::info!("[{}] Resolved {} dome properties", self.device(), map.len());
        let names: Vec<String> = map.property_names().map(String::from).collect();
        *self.properties.write().await = map;

        for name in names {
            if let Some(property) = self.link.get_property(&name).await {
                self.ingest(property).await;
            }
        }
    }

    /// Re-route resolved properties whose cached value changed since last seen
    async fn poll_properties(&self) {
        let names: Vec<String> = self
            .properties
            .read()
            .await
            .property_names()
            .map(String::from)
            .collect();

        for name in names {
            let Some(property) = self.link.get_property(&name).await else {
                continue;
            };
            let changed = {
                let mut seen = self.last_seen.write().await;
                if seen.get(&name) == Some(&property) {
                    false
                } else {
                    seen.insert(name, property.clone());
                    true
                }
            };
            if changed {
                self.route(&property).await;
            }
        }
    }

    async fn tick(&self) {
        self.poll_properties().await;

        if self
            .weather
            .is_check_due(self.config.weather_check_interval())
            .await
        {
            if let Err(e) = self.weather.check_weather_status().await {
                e.log(self.device(), "Weather check");
            }
        }

        if let Err(e) = self.telescope.update_following().await {
            tracing::debug!("[{}] Following update failed: {}", self.device(), e);
        }
    }
}

// =============================================================================
// Monitor task
// =============================================================================

async fn run_monitor(
    core: Weak<DomeCore>,
    interval: Duration,
    mut updates: broadcast::Receiver<Property>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut listening = true;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let Some(core) = core.upgrade() else { break };
                if let Err(payload) = AssertUnwindSafe(core.tick()).catch_unwind().await {
                    tracing::error!(
                        "[{}] Dome monitor tick panicked: {}",
                        core.device(),
                        panic_message(&payload)
                    );
                }
            }
            update = updates.recv(), if listening => {
                let Some(core) = core.upgrade() else { break };
                match update {
                    Ok(property) => core.ingest(property).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Polling catches up on whatever was dropped
                        tracing::warn!("[{}] Missed {} property updates", core.device(), skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("[{}] Property updates closed, polling only", core.device());
                        listening = false;
                    }
                }
            }
        }
    }

    tracing::debug!("Dome monitor stopped");
}

// =============================================================================
// Public coordinator
// =============================================================================

/// Snapshot of the whole dome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomeStatus {
    pub device: String,
    pub connected: bool,
    pub azimuth: f64,
    pub target_azimuth: f64,
    pub moving: bool,
    pub emergency_stopped: bool,
    pub shutter: ShutterState,
    pub park: ParkStatus,
    pub weather_safe: bool,
    pub weather_details: String,
    pub following: bool,
    pub home_position: Option<f64>,
    pub finding_home: bool,
}

/// Entry point of the dome core
#[derive(Clone)]
pub struct DomeCoordinator {
    core: Arc<DomeCore>,
}

impl DomeCoordinator {
    /// Build a coordinator over `link`. The configuration is validated here.
    pub fn new(link: Arc<dyn DeviceLink>, config: DomeConfig) -> DomeResult<Self> {
        config.validate()?;
        Ok(Self {
            core: DomeCore::new(link, config),
        })
    }

    pub fn device_name(&self) -> &str {
        self.core.device()
    }

    pub fn config(&self) -> &DomeConfig {
        &self.core.config
    }

    pub async fn is_connected(&self) -> bool {
        self.core.link.is_connected().await
    }

    /// Connect the link, sync device state and start monitoring.
    ///
    /// Connecting an already monitored dome does nothing.
    pub async fn connect(&self) -> DomeResult<()> {
        let core = &self.core;
        let mut monitor = core.monitor.lock().await;
        if monitor.is_some() {
            tracing::debug!("[{}] Already connected", core.device());
            return Ok(());
        }

        tracing::info!("[{}] Connecting dome", core.device());
        if let Err(e) = core.link.connect().await {
            e.log(core.device(), "Connect");
            return Err(e);
        }

        // Subscribe before the initial sync so no update falls in between
        let updates = core.link.subscribe();
        core.sync_properties().await;
        if let Err(e) = core.weather.check_weather_status().await {
            e.log(core.device(), "Initial weather check");
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_monitor(
            Arc::downgrade(core),
            core.config.monitor_interval(),
            updates,
            shutdown_rx,
        ));
        *monitor = Some(MonitorHandle { shutdown, task });
        drop(monitor);

        tracing::info!("[{}] Dome connected", core.device());
        core.emit(DomeEvent::Connection { connected: true }).await;

        if core.home.auto_home_on_startup().await && !core.home.is_home_set().await {
            tracing::info!("[{}] Searching for home on startup", core.device());
            core.home.spawn_search(core.clone()).await;
        }
        Ok(())
    }

    /// Stop monitoring, close the shutter if configured, and disconnect.
    ///
    /// A background home search is aborted and the monitor task joined
    /// before anything else happens.
    pub async fn shutdown(&self) -> DomeResult<()> {
        let core = &self.core;
        tracing::info!("[{}] Shutting down dome", core.device());

        core.home.cancel_background_search().await;

        if let Some(monitor) = core.monitor.lock().await.take() {
            let _ = monitor.shutdown.send(());
            if let Err(e) = monitor.task.await {
                tracing::error!("[{}] Dome monitor task failed: {}", core.device(), e);
            }
        }

        if core.config.close_shutter_on_shutdown && core.link.is_connected().await {
            let state = core.shutter.state().await;
            if !matches!(state, ShutterState::Closed | ShutterState::Closing) {
                tracing::info!("[{}] Closing shutter before disconnect", core.device());
                if let Err(e) = core.shutter.close(core).await {
                    e.log(core.device(), "Close shutter on shutdown");
                }
            }
        }

        if let Err(e) = core.link.disconnect().await {
            e.log(core.device(), "Disconnect");
            return Err(e);
        }
        core.emit(DomeEvent::Connection { connected: false }).await;
        Ok(())
    }

    /// Re-resolve device properties and route their current values
    pub async fn resync(&self) {
        self.core.sync_properties().await;
    }

    /// Route a property update as if the link had pushed it
    pub async fn route(&self, property: &Property) {
        self.core.route(property).await;
    }

    pub async fn status(&self) -> DomeStatus {
        let core = &self.core;
        let condition = core.weather.condition().await;
        DomeStatus {
            device: core.device().to_string(),
            connected: core.link.is_connected().await,
            azimuth: core.motion.current_azimuth().await,
            target_azimuth: core.motion.target_azimuth().await,
            moving: core.motion.is_moving().await,
            emergency_stopped: core.motion.is_emergency_stopped().await,
            shutter: core.shutter.state().await,
            park: core.parking.status().await,
            weather_safe: condition.safe,
            weather_details: condition.details,
            following: core.telescope.is_following().await,
            home_position: core.home.home_position().await,
            finding_home: core.home.is_finding_home(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomeEvent> {
        self.core.events.subscribe()
    }

    pub async fn on_event<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&DomeEvent) + Send + Sync + 'static,
    {
        self.core.events.on_event(handler).await
    }

    pub async fn remove_handler(&self, id: HandlerId) -> bool {
        self.core.events.remove_handler(id).await
    }

    pub fn motion(&self) -> &MotionController {
        &self.core.motion
    }

    pub fn shutter(&self) -> &ShutterController {
        &self.core.shutter
    }

    pub fn parking(&self) -> &ParkingController {
        &self.core.parking
    }

    pub fn weather(&self) -> &WeatherMonitor {
        &self.core.weather
    }

    pub fn telescope(&self) -> &TelescopeCoordinator {
        &self.core.telescope
    }

    pub fn home(&self) -> &HomeManager {
        &self.core.home
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use crate::sim::SimulatedDome;

    pub(crate) async fn connected(config: DomeConfig) -> (Arc<SimulatedDome>, DomeCoordinator) {
        connected_with(SimulatedDome::new("Dome Simulator"), config).await
    }

    pub(crate) async fn connected_with(
        sim: SimulatedDome,
        config: DomeConfig,
    ) -> (Arc<SimulatedDome>, DomeCoordinator) {
        let sim = Arc::new(sim);
        let coord = DomeCoordinator::new(sim.clone(), config).unwrap();
        coord.connect().await.unwrap();
        (sim, coord)
    }

    /// Device that answers a command before `send_command` returns, the way
    /// a blocking driver call does
    pub(crate) struct EagerDevice {
        pub(crate) sim: Arc<SimulatedDome>,
        replies: Mutex<HashMap<String, Vec<Property>>>,
        send_latency: Duration,
    }

    impl EagerDevice {
        /// Push `reply` whenever a command for `property` arrives
        pub(crate) async fn reply_to(&self, property: &str, reply: Property) {
            self.replies
                .lock()
                .await
                .entry(property.to_string())
                .or_default()
                .push(reply);
        }
    }

    #[async_trait]
    impl DeviceLink for EagerDevice {
        fn device_name(&self) -> &str {
            self.sim.device_name()
        }

        async fn connect(&self) -> DomeResult<()> {
            self.sim.connect().await
        }

        async fn disconnect(&self) -> DomeResult<()> {
            self.sim.disconnect().await
        }

        async fn is_connected(&self) -> bool {
            self.sim.is_connected().await
        }

        async fn send_command(&self, property: &str, values: Vec<PropertyElement>) -> DomeResult<()> {
            self.sim.send_command(property, values).await?;
            let replies = self.replies.lock().await.get(property).cloned();
            for reply in replies.unwrap_or_default() {
                self.sim.push_property(reply).await;
            }
            tokio::time::sleep(self.send_latency).await;
            Ok(())
        }

        async fn get_property(&self, name: &str) -> Option<Property> {
            self.sim.get_property(name).await
        }

        fn subscribe(&self) -> broadcast::Receiver<Property> {
            self.sim.subscribe()
        }
    }

    pub(crate) async fn connected_eager(config: DomeConfig) -> (Arc<EagerDevice>, DomeCoordinator) {
        let device = Arc::new(EagerDevice {
            sim: Arc::new(SimulatedDome::new("Dome Simulator")),
            replies: Mutex::new(HashMap::new()),
            send_latency: Duration::from_millis(200),
        });
        let coord = DomeCoordinator::new(device.clone(), config).unwrap();
        coord.connect().await.unwrap();
        (device, coord)
    }

    /// Formatted log output collected by [`capture_logs`]
    #[derive(Clone, Default)]
    pub(crate) struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl LogBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Collect log lines on this thread until the guard drops
    pub(crate) fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        (buffer, tracing::subscriber::set_default(subscriber))
    }

    /// Change a device property and deliver it to the coordinator
    pub(crate) async fn device_update(sim: &SimulatedDome, coord: &DomeCoordinator, property: Property) {
        sim.set_property(property.clone()).await;
        coord.core.ingest(property).await;
    }
}
