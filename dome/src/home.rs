//! Home manager
//!
//! Finds, stores and returns to the dome's reference azimuth. Only one home
//! search runs at a time; a second request fails fast with `Busy`.

use crate::angle::normalize_azimuth;
use crate::config::HomeConfig;
use crate::coordinator::DomeCore;
use crate::error::{DomeError, DomeResult};
use crate::events::{DomeEvent, HomeEvent};
use crate::link::{Property, PropertyState};
use crate::properties::{names, PropertyRole, ResolvedProperty};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug)]
struct HomeState {
    home_position: Option<f64>,
    auto_home_enabled: bool,
    auto_home_on_startup: bool,
}

/// Releases the single-flight flag when the search ends, however it ends
struct SearchGuard<'a>(&'a AtomicBool);

impl Drop for SearchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct HomeManager {
    core: Weak<DomeCore>,
    state: RwLock<HomeState>,
    searching: AtomicBool,
    /// Search started by auto-home, aborted on shutdown
    background: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
    poll_interval: Duration,
}

impl HomeManager {
    pub(crate) fn new(core: Weak<DomeCore>, config: &HomeConfig) -> Self {
        Self {
            core,
            state: RwLock::new(HomeState {
                home_position: config.home_position.map(normalize_azimuth),
                auto_home_enabled: config.auto_home_enabled,
                auto_home_on_startup: config.auto_home_on_startup,
            }),
            searching: AtomicBool::new(false),
            background: Mutex::new(None),
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    fn core(&self) -> DomeResult<Arc<DomeCore>> {
        self.core.upgrade().ok_or(DomeError::CoordinatorDropped)
    }

    pub async fn home_position(&self) -> Option<f64> {
        self.state.read().await.home_position
    }

    pub async fn is_home_set(&self) -> bool {
        self.home_position().await.is_some()
    }

    pub fn is_finding_home(&self) -> bool {
        self.searching.load(Ordering::SeqCst)
    }

    pub async fn is_auto_home_enabled(&self) -> bool {
        self.state.read().await.auto_home_enabled
    }

    pub async fn auto_home_on_startup(&self) -> bool {
        self.state.read().await.auto_home_on_startup
    }

    pub async fn set_auto_home_on_startup(&self, enable: bool) {
        self.state.write().await.auto_home_on_startup = enable;
    }

    /// Enable automatic homing. Enabling without a known home while
    /// connected starts a search in the background.
    pub async fn enable_auto_home(&self, enable: bool) -> DomeResult<()> {
        let core = self.core()?;
        let needs_home = {
            let mut state = self.state.write().await;
            state.auto_home_enabled = enable;
            enable && state.home_position.is_none()
        };
        tracing::info!(
            "[{}] Auto home {}",
            core.device(),
            if enable { "enabled" } else { "disabled" }
        );

        if needs_home && core.link.is_connected().await {
            self.spawn_search(core.clone()).await;
        }
        Ok(())
    }

    /// Run `find_home` in the background unless a background search is still running
    pub(crate) async fn spawn_search(&self, core: Arc<DomeCore>) {
        let mut background = self.background.lock().await;
        if background.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        *background = Some(tokio::spawn(async move {
            if let Err(e) = core.home.find_home().await {
                tracing::debug!("[{}] Background home search ended: {}", core.device(), e);
            }
        }));
    }

    /// Abort a background search and wait for it to release the core
    pub(crate) async fn cancel_background_search(&self) {
        let task = self.background.lock().await.take();
        if let Some(task) = task {
            if !task.is_finished() {
                tracing::info!("Cancelling background home search");
            }
            task.abort();
            let _ = task.await;
        }
    }

    /// Discover the home position.
    ///
    /// Uses the device's own discovery when it has one, otherwise moves to 0°
    /// and takes the resting position as home. The wait is bounded by the
    /// configured timeout.
    pub async fn find_home(&self) -> DomeResult<f64> {
        let core = self.core()?;
        let result = self.search(&core).await;
        core.logged(result, "Find home")
    }

    async fn search(&self, core: &DomeCore) -> DomeResult<f64> {
        if self
            .searching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DomeError::Busy("home search already in progress".to_string()));
        }
        let _guard = SearchGuard(&self.searching);

        core.ensure_connected().await?;
        if core.motion.is_moving().await {
            return Err(DomeError::Busy("cannot find home while the dome is moving".to_string()));
        }

        let result = match core.resolved(PropertyRole::HomeDiscover).await {
            Some(discover) => self.find_home_native(core, &discover).await,
            None => self.find_home_manual(core).await,
        };

        match result {
            Ok(position) => {
                self.state.write().await.home_position = Some(position);
                tracing::info!("[{}] Home found at {:.2}°", core.device(), position);
                core.emit(DomeEvent::Home(HomeEvent {
                    home_found: true,
                    home_position: Some(position),
                }))
                .await;
                Ok(position)
            }
            Err(e) => {
                if matches!(e, DomeError::Timeout { .. }) {
                    core.emit(DomeEvent::Home(HomeEvent {
                        home_found: false,
                        home_position: None,
                    }))
                    .await;
                }
                Err(e)
            }
        }
    }

    /// Wait on the device's home property.
    ///
    /// The search completes only on evidence from that property: it went
    /// busy and then settled, it turned Ok from another state, or the device
    /// pushed a fresh Ok after the command. A device that never reacts runs
    /// into the timeout.
    async fn find_home_native(
        &self,
        core: &DomeCore,
        discover: &ResolvedProperty,
    ) -> DomeResult<f64> {
        let mut updates = core.link.subscribe();
        let baseline = core
            .link
            .get_property(&discover.property)
            .await
            .map(|p| p.state);

        let element = discover.element.as_deref().unwrap_or(names::HOME_DISCOVER);
        core.send_switch(&discover.property, element).await?;
        tracing::info!("[{}] Finding home position", core.device());

        let wait = async {
            let mut ticker = tokio::time::interval(self.poll_interval);
            let mut listening = true;
            let mut seen_busy = false;
            loop {
                let (state, pushed) = tokio::select! {
                    _ = ticker.tick() => {
                        let property = core.link.get_property(&discover.property).await;
                        (property.map(|p| p.state), false)
                    }
                    update = updates.recv(), if listening => match update {
                        Ok(property) if property.name == discover.property => {
                            (Some(property.state), true)
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => {
                            listening = false;
                            continue;
                        }
                    },
                };

                match state {
                    Some(PropertyState::Alert) => {
                        return Err(DomeError::SendFailed {
                            property: discover.property.clone(),
                            message: "device reported home search failure".to_string(),
                        });
                    }
                    Some(PropertyState::Busy) => seen_busy = true,
                    Some(_) if seen_busy => return Ok(()),
                    Some(PropertyState::Ok) if pushed || baseline != Some(PropertyState::Ok) => {
                        return Ok(())
                    }
                    _ => {}
                }
            }
        };
        self.bounded(wait).await?;

        Ok(self.device_azimuth(core).await)
    }

    async fn find_home_manual(&self, core: &DomeCore) -> DomeResult<f64> {
        tracing::info!(
            "[{}] No home discovery on device, searching manually",
            core.device()
        );
        core.motion.move_to(core, 0.0).await?;

        let wait = async {
            while core.motion.is_moving().await {
                tokio::time::sleep(self.poll_interval).await;
            }
            Ok(())
        };
        self.bounded(wait).await?;

        Ok(core.motion.current_azimuth().await)
    }

    async fn bounded<F>(&self, wait: F) -> DomeResult<()>
    where
        F: std::future::Future<Output = DomeResult<()>>,
    {
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| DomeError::Timeout {
                operation: "find home".to_string(),
                duration: self.timeout,
            })?
    }

    /// Azimuth straight from the device cache, ahead of routed updates
    async fn device_azimuth(&self, core: &DomeCore) -> f64 {
        if let Some(position) = core.resolved(PropertyRole::AbsolutePosition).await {
            if let Some(azimuth) = core
                .link
                .get_property(&position.property)
                .await
                .and_then(|p| p.first_number())
            {
                return normalize_azimuth(azimuth);
            }
        }
        core.motion.current_azimuth().await
    }

    /// Make the current azimuth the home position
    pub async fn set_home(&self) -> DomeResult<f64> {
        let core = self.core()?;
        let result = self.set_home_here(&core).await;
        core.logged(result, "Set home")
    }

    async fn set_home_here(&self, core: &DomeCore) -> DomeResult<f64> {
        core.ensure_connected().await?;

        if let Some(set) = core.resolved(PropertyRole::HomeSet).await {
            let element = set.element.as_deref().unwrap_or(names::HOME_SET);
            core.send_switch(&set.property, element).await?;
        }
        let position = core.motion.current_azimuth().await;
        self.store_home(core, position).await;
        Ok(position)
    }

    /// Store a known home azimuth without touching the device
    pub async fn set_home_position(&self, azimuth: f64) -> DomeResult<()> {
        let core = self.core()?;
        if !azimuth.is_finite() {
            return core.logged(
                Err(DomeError::InvalidParameter(format!(
                    "home position {} is not a valid azimuth",
                    azimuth
                ))),
                "Set home position",
            );
        }
        self.store_home(&core, normalize_azimuth(azimuth)).await;
        Ok(())
    }

    async fn store_home(&self, core: &DomeCore, position: f64) {
        self.state.write().await.home_position = Some(position);
        tracing::info!("[{}] Home position set to {:.2}°", core.device(), position);
        core.emit(DomeEvent::Home(HomeEvent {
            home_found: true,
            home_position: Some(position),
        }))
        .await;
    }

    /// Return to the home position
    pub async fn goto_home(&self) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.goto(&core).await;
        core.logged(result, "Go to home")
    }

    async fn goto(&self, core: &DomeCore) -> DomeResult<()> {
        core.ensure_connected().await?;
        let home = self.home_position().await.ok_or(DomeError::HomeNotSet)?;

        match core.resolved(PropertyRole::HomeGoto).await {
            Some(goto) => {
                let element = goto.element.as_deref().unwrap_or(names::HOME_GOTO);
                core.send_switch(&goto.property, element).await?;
                tracing::info!("[{}] Going to home position {:.2}°", core.device(), home);
                Ok(())
            }
            None => core.motion.move_to(core, home).await,
        }
    }

    /// Apply a device update for a home property
    pub(crate) async fn handle_property(&self, property: &Property) -> DomeResult<()> {
        let core = self.core()?;
        match property.state {
            PropertyState::Alert => {
                tracing::warn!("[{}] {} reported alert", core.device(), property.name)
            }
            state => tracing::debug!("[{}] {} is {:?}", core.device(), property.name, state),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomeConfig;
    use crate::coordinator::test_support::{connected, connected_with, device_update};
    use crate::sim::{SimPhysics, SimulatedDome};

    fn short_timeouts() -> DomeConfig {
        let mut config = DomeConfig::default();
        config.home.timeout_ms = 300;
        config.home.poll_interval_ms = 20;
        config
    }

    async fn without_native_home(sim: SimulatedDome) -> SimulatedDome {
        sim.remove_property(names::DOME_HOME).await;
        sim
    }

    fn position(azimuth: f64) -> Property {
        Property::numbers(
            names::ABS_DOME_POSITION,
            &[(names::DOME_ABSOLUTE_POSITION, azimuth)],
        )
    }

    #[tokio::test]
    async fn test_single_flight() {
        let sim = without_native_home(SimulatedDome::new("Dome Simulator")).await;
        let (sim, coord) = connected_with(sim, short_timeouts()).await;
        device_update(&sim, &coord, position(90.0)).await;
        sim.clear_commands().await;

        // The device never reports motion, so the first search runs into its timeout
        let home = coord.home();
        let (first, second) = tokio::join!(home.find_home(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            home.find_home().await
        });

        assert!(matches!(first, Err(DomeError::Timeout { .. })));
        assert!(matches!(second, Err(DomeError::Busy(_))));
        assert_eq!(sim.count_numbers(names::ABS_DOME_POSITION).await, 1);
        assert!(!home.is_finding_home());
        assert!(!home.is_home_set().await);
    }

    #[tokio::test]
    async fn test_manual_home_with_physics() {
        let sim = SimulatedDome::new("Dome Simulator").with_physics(SimPhysics {
            slew_rate: 180.0,
            ..SimPhysics::default()
        });
        sim.set_property(position(60.0)).await;
        let sim = without_native_home(sim).await;
        let mut config = short_timeouts();
        config.home.timeout_ms = 3000;
        let (_sim, coord) = connected_with(sim, config).await;

        let home = coord.home().find_home().await.unwrap();
        assert!(home < 1.0 || home > 359.0);
        assert_eq!(coord.home().home_position().await, Some(home));
    }

    #[tokio::test]
    async fn test_native_home_with_physics() {
        let sim = SimulatedDome::new("Dome Simulator").with_physics(SimPhysics {
            slew_rate: 180.0,
            home_azimuth: 45.0,
            ..SimPhysics::default()
        });
        let mut config = short_timeouts();
        config.home.timeout_ms = 3000;
        let (sim, coord) = connected_with(sim, config).await;

        let home = coord.home().find_home().await.unwrap();
        assert!((home - 45.0).abs() < 1e-6);
        assert_eq!(sim.count_commands(names::DOME_HOME, names::HOME_DISCOVER).await, 1);
    }

    #[tokio::test]
    async fn test_find_home_refused_while_moving() {
        let (sim, coord) = connected(short_timeouts()).await;
        coord.motion().move_to_azimuth(200.0).await.unwrap();
        sim.clear_commands().await;

        assert!(matches!(coord.home().find_home().await, Err(DomeError::Busy(_))));
        assert!(sim.sent_commands().await.is_empty());
        assert!(!coord.home().is_finding_home());
    }

    #[tokio::test]
    async fn test_goto_home() {
        let (sim, coord) = connected(short_timeouts()).await;
        assert_eq!(coord.home().goto_home().await, Err(DomeError::HomeNotSet));

        coord.home().set_home_position(-60.0).await.unwrap();
        assert_eq!(coord.home().home_position().await, Some(300.0));
        coord.home().goto_home().await.unwrap();
        assert_eq!(sim.count_commands(names::DOME_HOME, names::HOME_GOTO).await, 1);
    }

    #[tokio::test]
    async fn test_goto_home_fallback() {
        let sim = without_native_home(SimulatedDome::new("Dome Simulator")).await;
        let mut config = short_timeouts();
        config.home.home_position = Some(120.0);
        let (sim, coord) = connected_with(sim, config).await;

        coord.home().goto_home().await.unwrap();
        assert_eq!(sim.last_number(names::ABS_DOME_POSITION).await, Some(120.0));
    }

    #[tokio::test]
    async fn test_set_home() {
        let (sim, coord) = connected(short_timeouts()).await;
        device_update(&sim, &coord, position(33.0)).await;

        assert_eq!(coord.home().set_home().await.unwrap(), 33.0);
        assert_eq!(sim.count_commands(names::DOME_HOME, names::HOME_SET).await, 1);
        assert_eq!(coord.home().home_position().await, Some(33.0));
    }

    #[tokio::test]
    async fn test_enable_auto_home_starts_search() {
        let sim = SimulatedDome::new("Dome Simulator").with_physics(SimPhysics {
            slew_rate: 180.0,
            home_azimuth: 15.0,
            ..SimPhysics::default()
        });
        let mut config = short_timeouts();
        config.home.timeout_ms = 3000;
        let (_sim, coord) = connected_with(sim, config).await;
        let mut events = coord.subscribe();

        coord.home().enable_auto_home(true).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(DomeEvent::Home(e)) = events.recv().await {
                    return e;
                }
            }
        })
        .await
        .unwrap();

        assert!(event.home_found);
        assert!(matches!(event.home_position, Some(az) if (az - 15.0).abs() < 1e-6));
        assert!(coord.home().is_auto_home_enabled().await);
    }

    fn home_property(state: PropertyState) -> Property {
        Property::switches(
            names::DOME_HOME,
            &[
                (names::HOME_DISCOVER, state == PropertyState::Busy),
                (names::HOME_GOTO, false),
                (names::HOME_SET, false),
            ],
        )
        .with_state(state)
    }

    #[tokio::test]
    async fn test_native_home_times_out_when_device_ignores_it() {
        let sim = SimulatedDome::new("Dome Simulator");
        sim.set_property(position(137.0)).await;
        let (sim, coord) = connected_with(sim, short_timeouts()).await;
        let mut events = coord.subscribe();

        let result = coord.home().find_home().await;
        assert!(matches!(result, Err(DomeError::Timeout { .. })));
        assert_eq!(sim.count_commands(names::DOME_HOME, names::HOME_DISCOVER).await, 1);
        assert!(!coord.home().is_home_set().await);

        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(DomeEvent::Home(e)) = events.recv().await {
                    return e;
                }
            }
        })
        .await
        .unwrap();
        assert!(!event.home_found);
    }

    #[tokio::test]
    async fn test_native_home_waits_for_slow_device() {
        let (sim, coord) = connected(short_timeouts()).await;

        let device = sim.clone();
        let driver = tokio::spawn(async move {
            // Several poll intervals pass before the device reacts
            tokio::time::sleep(Duration::from_millis(80)).await;
            device.push_property(home_property(PropertyState::Busy)).await;
            tokio::time::sleep(Duration::from_millis(60)).await;
            device.push_property(position(210.0)).await;
            device.push_property(home_property(PropertyState::Ok)).await;
        });

        let home = coord.home().find_home().await.unwrap();
        driver.await.unwrap();
        assert_eq!(home, 210.0);
        assert_eq!(coord.home().home_position().await, Some(210.0));
    }

    #[tokio::test]
    async fn test_native_home_alert_fails() {
        let (sim, coord) = connected(short_timeouts()).await;

        let device = sim.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            device.push_property(home_property(PropertyState::Alert)).await;
        });

        let result = coord.home().find_home().await;
        assert!(matches!(result, Err(DomeError::SendFailed { .. })));
        assert!(!coord.home().is_home_set().await);
    }

    #[tokio::test]
    async fn test_background_search_cancelled() {
        let (_sim, coord) = connected(short_timeouts()).await;
        coord.home().enable_auto_home(true).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coord.home().is_finding_home());
        coord.home().cancel_background_search().await;
        assert!(!coord.home().is_finding_home());
    }

    #[tokio::test]
    async fn test_not_connected() {
        let sim = std::sync::Arc::new(SimulatedDome::new("Dome Simulator"));
        let coord = crate::DomeCoordinator::new(sim, short_timeouts()).unwrap();
        assert_eq!(coord.home().find_home().await, Err(DomeError::NotConnected));
        assert!(!coord.home().is_finding_home());
    }
}
