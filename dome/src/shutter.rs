//! Shutter controller
//!
//! Tracks the shutter state machine. Commands move the state optimistically
//! to `Opening`/`Closing`; device updates are authoritative and always win.

use crate::coordinator::DomeCore;
use crate::error::{DomeError, DomeResult};
use crate::events::{DomeEvent, ShutterEvent};
use crate::link::{Property, PropertyState};
use crate::properties::{names, PropertyRole};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// Dome shutter state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShutterState {
    #[default]
    Unknown,
    Open,
    Closed,
    Opening,
    Closing,
}

impl ShutterState {
    /// Shutter is travelling
    pub fn is_moving(self) -> bool {
        matches!(self, ShutterState::Opening | ShutterState::Closing)
    }

    /// Derive the state from a shutter property
    pub fn from_property(property: &Property) -> Option<Self> {
        if property.state == PropertyState::Alert {
            return Some(ShutterState::Unknown);
        }
        let busy = property.is_busy();
        if property.switch(names::SHUTTER_OPEN) == Some(true) {
            Some(if busy { ShutterState::Opening } else { ShutterState::Open })
        } else if property.switch(names::SHUTTER_CLOSE) == Some(true) {
            Some(if busy { ShutterState::Closing } else { ShutterState::Closed })
        } else {
            None
        }
    }
}

impl std::fmt::Display for ShutterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShutterState::Unknown => "unknown",
            ShutterState::Open => "open",
            ShutterState::Closed => "closed",
            ShutterState::Opening => "opening",
            ShutterState::Closing => "closing",
        };
        f.write_str(s)
    }
}

pub struct ShutterController {
    core: Weak<DomeCore>,
    state: RwLock<ShutterState>,
    operations: AtomicU64,
}

impl ShutterController {
    pub(crate) fn new(core: Weak<DomeCore>) -> Self {
        Self {
            core,
            state: RwLock::new(ShutterState::Unknown),
            operations: AtomicU64::new(0),
        }
    }

    fn core(&self) -> DomeResult<Arc<DomeCore>> {
        self.core.upgrade().ok_or(DomeError::CoordinatorDropped)
    }

    pub async fn state(&self) -> ShutterState {
        *self.state.read().await
    }

    /// Number of open/close commands that reached the device
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    pub fn reset_operation_count(&self) {
        self.operations.store(0, Ordering::SeqCst);
    }

    /// Check every precondition for opening.
    ///
    /// The dome must not be parked, and the weather must be safe unless
    /// weather monitoring is disabled.
    pub async fn check_can_open(&self) -> DomeResult<()> {
        let core = self.core()?;
        if core.parking.is_parked().await {
            return Err(DomeError::Unsafe("dome is parked".to_string()));
        }
        if !core.weather.is_safe_for_operation().await {
            let details = core.weather.condition().await.details;
            return Err(DomeError::Unsafe(format!("weather unsafe: {}", details)));
        }
        Ok(())
    }

    pub async fn can_open_shutter(&self) -> bool {
        self.check_can_open().await.is_ok()
    }

    /// Open the shutter. No-op if it is already open or opening.
    pub async fn open_shutter(&self) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.open(&core).await;
        core.logged(result, "Open shutter")
    }

    async fn open(&self, core: &DomeCore) -> DomeResult<()> {
        core.ensure_connected().await?;

        let current = self.state().await;
        if matches!(current, ShutterState::Open | ShutterState::Opening) {
            tracing::debug!("[{}] Shutter already {}", core.device(), current);
            return Ok(());
        }

        self.check_can_open().await?;
        let shutter = core.require(PropertyRole::Shutter).await?;

        tracing::info!("[{}] Opening shutter", core.device());
        self.command(core, &shutter.property, names::SHUTTER_OPEN, ShutterState::Opening)
            .await
    }

    /// Close the shutter. Always allowed; no-op if already closed or closing.
    pub async fn close_shutter(&self) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.close(&core).await;
        core.logged(result, "Close shutter")
    }

    /// Unlogged close for callers that report failures in their own context
    pub(crate) async fn close(&self, core: &DomeCore) -> DomeResult<()> {
        core.ensure_connected().await?;

        let current = self.state().await;
        if matches!(current, ShutterState::Closed | ShutterState::Closing) {
            tracing::debug!("[{}] Shutter already {}", core.device(), current);
            return Ok(());
        }

        let shutter = core.require(PropertyRole::Shutter).await?;

        tracing::info!("[{}] Closing shutter", core.device());
        self.command(core, &shutter.property, names::SHUTTER_CLOSE, ShutterState::Closing)
            .await
    }

    /// Enter `travelling` and send the command.
    ///
    /// The state changes before the send so a confirmation that arrives while
    /// the send is in flight wins. The event fires only once the command is
    /// out; a failed send quietly restores the previous state unless a device
    /// update replaced it in the meantime.
    async fn command(
        &self,
        core: &DomeCore,
        property: &str,
        element: &str,
        travelling: ShutterState,
    ) -> DomeResult<()> {
        let previous = std::mem::replace(&mut *self.state.write().await, travelling);

        let sent = core.send_switch(property, element).await;
        let pending = {
            let mut state = self.state.write().await;
            let pending = *state == travelling;
            if pending && sent.is_err() {
                *state = previous;
            }
            pending
        };
        sent?;

        self.operations.fetch_add(1, Ordering::SeqCst);
        if pending {
            tracing::debug!("[{}] Shutter {} -> {}", core.device(), previous, travelling);
            core.emit(DomeEvent::Shutter(ShutterEvent { state: travelling }))
                .await;
        }
        Ok(())
    }

    /// Stop shutter travel. The resting state is unknown until the device reports it.
    pub async fn abort_shutter(&self) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.abort(&core).await;
        core.logged(result, "Abort shutter")
    }

    async fn abort(&self, core: &DomeCore) -> DomeResult<()> {
        core.ensure_connected().await?;

        let shutter = core.require(PropertyRole::Shutter).await?;
        core.send_switch(&shutter.property, names::SHUTTER_ABORT).await?;
        tracing::warn!("[{}] Shutter motion aborted", core.device());

        if self.state().await.is_moving() {
            self.transition(core, ShutterState::Unknown).await;
        }
        Ok(())
    }

    /// Apply a device update for the shutter property
    pub(crate) async fn handle_property(&self, property: &Property) -> DomeResult<()> {
        let core = self.core()?;

        let new_state = match ShutterState::from_property(property) {
            Some(state) => state,
            // Neither switch on: travel was interrupted
            None if self.state().await.is_moving() && !property.is_busy() => ShutterState::Unknown,
            None => return Ok(()),
        };

        if property.state == PropertyState::Alert {
            tracing::warn!("[{}] Shutter reported alert", core.device());
        }
        self.transition(&core, new_state).await;
        Ok(())
    }

    async fn transition(&self, core: &DomeCore, new_state: ShutterState) {
        {
            let mut state = self.state.write().await;
            if *state == new_state {
                return;
            }
            tracing::debug!("[{}] Shutter {} -> {}", core.device(), *state, new_state);
            *state = new_state;
        }
        core.emit(DomeEvent::Shutter(ShutterEvent { state: new_state }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::test_support::{capture_logs, connected, connected_eager, device_update};
    use crate::config::DomeConfig;

    fn shutter_property(open: bool, close: bool, state: PropertyState) -> Property {
        Property::switches(
            names::DOME_SHUTTER,
            &[(names::SHUTTER_OPEN, open), (names::SHUTTER_CLOSE, close)],
        )
        .with_state(state)
    }

    #[test]
    fn test_state_from_property() {
        let prop = shutter_property(true, false, PropertyState::Busy);
        assert_eq!(ShutterState::from_property(&prop), Some(ShutterState::Opening));
        let prop = shutter_property(true, false, PropertyState::Ok);
        assert_eq!(ShutterState::from_property(&prop), Some(ShutterState::Open));
        let prop = shutter_property(false, true, PropertyState::Busy);
        assert_eq!(ShutterState::from_property(&prop), Some(ShutterState::Closing));
        let prop = shutter_property(false, true, PropertyState::Alert);
        assert_eq!(ShutterState::from_property(&prop), Some(ShutterState::Unknown));
        let prop = shutter_property(false, false, PropertyState::Idle);
        assert_eq!(ShutterState::from_property(&prop), None);
    }

    #[tokio::test]
    async fn test_open_and_confirm() {
        let (sim, coord) = connected(DomeConfig::default()).await;
        assert_eq!(coord.shutter().state().await, ShutterState::Closed);

        coord.shutter().open_shutter().await.unwrap();
        assert_eq!(coord.shutter().state().await, ShutterState::Opening);
        assert_eq!(coord.shutter().operation_count(), 1);
        assert_eq!(
            sim.count_commands(names::DOME_SHUTTER, names::SHUTTER_OPEN).await,
            1
        );

        // Second open while opening is a no-op
        coord.shutter().open_shutter().await.unwrap();
        assert_eq!(coord.shutter().operation_count(), 1);

        device_update(&sim, &coord, shutter_property(true, false, PropertyState::Ok)).await;
        assert_eq!(coord.shutter().state().await, ShutterState::Open);
    }

    #[tokio::test]
    async fn test_open_refused_while_parked() {
        let (sim, coord) = connected(DomeConfig::default()).await;
        device_update(
            &sim,
            &coord,
            Property::switches(names::DOME_PARK, &[(names::PARK, true), (names::UNPARK, false)]),
        )
        .await;
        assert!(coord.parking().is_parked().await);
        sim.clear_commands().await;

        let (logs, _guard) = capture_logs();
        let err = coord.shutter().open_shutter().await.unwrap_err();
        assert!(matches!(err, DomeError::Unsafe(_)));
        assert!(sim.sent_commands().await.is_empty());
        let output = logs.contents();
        assert!(output.contains("WARN"));
        assert!(output.contains("Open shutter: Unsafe to operate: dome is parked"));
        assert_eq!(coord.shutter().operation_count(), 0);
        assert!(!coord.shutter().can_open_shutter().await);
    }

    #[tokio::test]
    async fn test_close_always_allowed() {
        let (sim, coord) = connected(DomeConfig::default()).await;
        device_update(&sim, &coord, shutter_property(true, false, PropertyState::Ok)).await;
        device_update(
            &sim,
            &coord,
            Property::switches(names::DOME_PARK, &[(names::PARK, true), (names::UNPARK, false)]),
        )
        .await;

        coord.shutter().close_shutter().await.unwrap();
        assert_eq!(coord.shutter().state().await, ShutterState::Closing);
        assert_eq!(coord.shutter().operation_count(), 1);

        // Already closing
        coord.shutter().close_shutter().await.unwrap();
        assert_eq!(
            sim.count_commands(names::DOME_SHUTTER, names::SHUTTER_CLOSE).await,
            1
        );
    }

    #[tokio::test]
    async fn test_failed_send_does_not_count() {
        let (sim, coord) = connected(DomeConfig::default()).await;
        sim.fail_sends(true);

        let (logs, _guard) = capture_logs();
        let err = coord.shutter().open_shutter().await.unwrap_err();
        assert!(matches!(err, DomeError::SendFailed { .. }));
        let output = logs.contents();
        assert!(output.contains("ERROR"));
        assert!(output.contains("Open shutter: Failed to send DOME_SHUTTER"));
        assert_eq!(coord.shutter().operation_count(), 0);
        assert_eq!(coord.shutter().state().await, ShutterState::Closed);
    }

    #[tokio::test]
    async fn test_confirmation_during_send_wins() {
        let (device, coord) = connected_eager(DomeConfig::default()).await;
        device
            .reply_to(names::DOME_SHUTTER, shutter_property(true, false, PropertyState::Ok))
            .await;

        coord.shutter().open_shutter().await.unwrap();
        assert_eq!(coord.shutter().state().await, ShutterState::Open);
        assert_eq!(coord.shutter().operation_count(), 1);

        // Polling finds nothing new, so the confirmed state stays
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(coord.shutter().state().await, ShutterState::Open);
    }

    #[tokio::test]
    async fn test_abort_returns_to_unknown() {
        let (sim, coord) = connected(DomeConfig::default()).await;
        coord.shutter().open_shutter().await.unwrap();

        coord.shutter().abort_shutter().await.unwrap();
        assert_eq!(coord.shutter().state().await, ShutterState::Unknown);
        assert_eq!(
            sim.count_commands(names::DOME_SHUTTER, names::SHUTTER_ABORT).await,
            1
        );

        coord.shutter().reset_operation_count();
        assert_eq!(coord.shutter().operation_count(), 0);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let sim = Arc::new(crate::sim::SimulatedDome::new("Dome Simulator"));
        let coord = crate::DomeCoordinator::new(sim.clone(), DomeConfig::default()).unwrap();
        assert_eq!(
            coord.shutter().open_shutter().await,
            Err(DomeError::NotConnected)
        );
        assert!(sim.sent_commands().await.is_empty());
    }
}
