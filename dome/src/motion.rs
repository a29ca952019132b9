//! Motion controller
//!
//! Owns the dome azimuth. `current_azimuth` and `moving` follow device
//! updates; `target_azimuth` is set when a move is issued. A move completes
//! when the reported azimuth comes within the configured tolerance of the
//! commanded position.

use crate::angle::{angular_distance, normalize_azimuth, shortest_path_with_direction, RotationDirection};
use crate::config::{check_speed_limits, AzimuthLimits, MotionConfig};
use crate::coordinator::DomeCore;
use crate::error::{DomeError, DomeResult};
use crate::events::{DomeEvent, MotionEvent};
use crate::link::{Property, PropertyElement, PropertyState};
use crate::properties::{names, PropertyRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Accumulated motion statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionStatistics {
    /// Degrees travelled, from device position updates
    pub total_rotation: f64,
    /// Absolute moves issued
    pub motion_count: u64,
    pub last_motion_duration: Option<Duration>,
}

#[derive(Debug)]
struct MotionState {
    current_azimuth: f64,
    target_azimuth: f64,
    /// Position actually sent to the device, target plus backlash
    commanded_azimuth: f64,
    moving: bool,
    continuous: Option<RotationDirection>,
    rotation_speed: f64,
    min_speed: f64,
    max_speed: f64,
    limits: Option<AzimuthLimits>,
    tolerance: f64,
    backlash_enabled: bool,
    backlash: f64,
    emergency_stop: bool,
    motion_started: Option<Instant>,
    stats: MotionStatistics,
    presets: BTreeMap<u8, f64>,
}

/// Motion fields a command changes optimistically
#[derive(Debug, Clone, Copy)]
struct MotionSnapshot {
    target_azimuth: f64,
    commanded_azimuth: f64,
    moving: bool,
    continuous: Option<RotationDirection>,
    motion_started: Option<Instant>,
    motion_count: u64,
}

impl MotionState {
    fn snapshot(&self) -> MotionSnapshot {
        MotionSnapshot {
            target_azimuth: self.target_azimuth,
            commanded_azimuth: self.commanded_azimuth,
            moving: self.moving,
            continuous: self.continuous,
            motion_started: self.motion_started,
            motion_count: self.stats.motion_count,
        }
    }

    fn restore(&mut self, snapshot: MotionSnapshot) {
        self.target_azimuth = snapshot.target_azimuth;
        self.commanded_azimuth = snapshot.commanded_azimuth;
        self.moving = snapshot.moving;
        self.continuous = snapshot.continuous;
        self.motion_started = snapshot.motion_started;
        self.stats.motion_count = snapshot.motion_count;
    }

    fn event(&self) -> MotionEvent {
        MotionEvent {
            current_azimuth: self.current_azimuth,
            target_azimuth: self.target_azimuth,
            moving: self.moving,
        }
    }

    fn finish_motion(&mut self) {
        self.moving = false;
        self.continuous = None;
        if let Some(started) = self.motion_started.take() {
            self.stats.last_motion_duration = Some(started.elapsed());
        }
    }
}

pub struct MotionController {
    core: Weak<DomeCore>,
    state: RwLock<MotionState>,
}

impl MotionController {
    pub(crate) fn new(core: Weak<DomeCore>, config: &MotionConfig) -> Self {
        Self {
            core,
            state: RwLock::new(MotionState {
                current_azimuth: 0.0,
                target_azimuth: 0.0,
                commanded_azimuth: 0.0,
                moving: false,
                continuous: None,
                rotation_speed: 0.0,
                min_speed: config.min_speed,
                max_speed: config.max_speed,
                limits: config.azimuth_limits,
                tolerance: config.tolerance_deg,
                backlash_enabled: config.backlash_enabled,
                backlash: config.backlash_deg,
                emergency_stop: false,
                motion_started: None,
                stats: MotionStatistics::default(),
                presets: config
                    .presets
                    .iter()
                    .map(|(slot, az)| (*slot, normalize_azimuth(*az)))
                    .collect(),
            }),
        }
    }

    fn core(&self) -> DomeResult<Arc<DomeCore>> {
        self.core.upgrade().ok_or(DomeError::CoordinatorDropped)
    }

    // =========================================================================
    // State
    // =========================================================================

    pub async fn current_azimuth(&self) -> f64 {
        self.state.read().await.current_azimuth
    }

    pub async fn target_azimuth(&self) -> f64 {
        self.state.read().await.target_azimuth
    }

    pub async fn is_moving(&self) -> bool {
        self.state.read().await.moving
    }

    /// Direction of a continuous rotation, if one is running
    pub async fn rotation_direction(&self) -> Option<RotationDirection> {
        self.state.read().await.continuous
    }

    pub async fn rotation_speed(&self) -> f64 {
        self.state.read().await.rotation_speed
    }

    /// Degrees left to the target, zero when idle
    pub async fn remaining_distance(&self) -> f64 {
        let state = self.state.read().await;
        if state.moving && state.continuous.is_none() {
            angular_distance(state.current_azimuth, state.commanded_azimuth)
        } else {
            0.0
        }
    }

    /// Estimate from the remaining distance and rotation speed (degrees per second)
    pub async fn estimated_time_to_target(&self) -> Option<Duration> {
        let speed = self.rotation_speed().await;
        if !speed.is_finite() || speed <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.remaining_distance().await / speed).ok()
    }

    // =========================================================================
    // Absolute and relative moves
    // =========================================================================

    /// Move the dome to an azimuth.
    ///
    /// Fails without touching the device when disconnected, stopped by an
    /// emergency stop, or when the normalized target is outside the limits.
    pub async fn move_to_azimuth(&self, azimuth: f64) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.move_to(&core, azimuth).await;
        core.logged(result, "Move to azimuth")
    }

    /// Unlogged move for callers that report failures in their own context
    pub(crate) async fn move_to(&self, core: &DomeCore, azimuth: f64) -> DomeResult<()> {
        if !azimuth.is_finite() {
            return Err(DomeError::InvalidParameter(format!(
                "azimuth {} is not a number",
                azimuth
            )));
        }
        core.ensure_connected().await?;
        let position = core.require(PropertyRole::AbsolutePosition).await?;

        // The move is recorded before the command leaves so a confirmation
        // arriving while the send is in flight lands on top of it
        let target = normalize_azimuth(azimuth);
        let (current, command, previous) = {
            let mut state = self.state.write().await;
            if state.emergency_stop {
                return Err(DomeError::Unsafe("emergency stop active".to_string()));
            }
            if let Some(limits) = state.limits {
                if !limits.contains(target) {
                    return Err(DomeError::OutsideLimits {
                        azimuth: target,
                        min: limits.min,
                        max: limits.max,
                    });
                }
            }
            if !state.moving && angular_distance(state.current_azimuth, target) < state.tolerance {
                tracing::debug!("[{}] Dome already at {:.2}°", core.device(), target);
                return Ok(());
            }
            let command = backlash_compensated(&state, target);
            let previous = state.snapshot();
            state.target_azimuth = target;
            state.commanded_azimuth = command;
            state.moving = true;
            state.continuous = None;
            state.motion_started = Some(Instant::now());
            state.stats.motion_count += 1;
            (state.current_azimuth, command, previous)
        };

        let element = position
            .element
            .as_deref()
            .unwrap_or(names::DOME_ABSOLUTE_POSITION);
        let sent = core
            .send(
                &position.property,
                vec![PropertyElement::number(element, command)],
            )
            .await;
        let pending = |s: &MotionState| {
            s.moving && s.continuous.is_none() && s.commanded_azimuth == command
        };
        if let Err(e) = sent {
            self.roll_back(previous, pending).await;
            return Err(e);
        }
        self.announce(core, pending).await;

        tracing::info!(
            "[{}] Moving dome from {:.2}° to {:.2}°",
            core.device(),
            current,
            target
        );
        Ok(())
    }

    /// Move by an offset from the current azimuth
    pub async fn rotate_relative(&self, degrees: f64) -> DomeResult<()> {
        let current = self.current_azimuth().await;
        self.move_to_azimuth(current + degrees).await
    }

    /// Undo an optimistic change after a failed send, unless a device update
    /// already replaced it
    async fn roll_back<F>(&self, previous: MotionSnapshot, unchanged: F)
    where
        F: FnOnce(&MotionState) -> bool,
    {
        let mut state = self.state.write().await;
        if unchanged(&*state) {
            state.restore(previous);
        }
    }

    /// Emit the optimistic state once the command is out, unless a device
    /// update already superseded it
    async fn announce<F>(&self, core: &DomeCore, unchanged: F)
    where
        F: FnOnce(&MotionState) -> bool,
    {
        let event = {
            let state = self.state.read().await;
            if !unchanged(&*state) {
                return;
            }
            state.event()
        };
        core.emit(DomeEvent::Motion(event)).await;
    }

    // =========================================================================
    // Continuous rotation
    // =========================================================================

    pub async fn start_rotation(&self, direction: RotationDirection) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.rotate(&core, direction).await;
        core.logged(result, "Start rotation")
    }

    async fn rotate(&self, core: &DomeCore, direction: RotationDirection) -> DomeResult<()> {
        core.ensure_connected().await?;
        let motion = core.require(PropertyRole::Motion).await?;

        let previous = {
            let mut state = self.state.write().await;
            if state.emergency_stop {
                return Err(DomeError::Unsafe("emergency stop active".to_string()));
            }
            let previous = state.snapshot();
            state.moving = true;
            state.continuous = Some(direction);
            state.motion_started = Some(Instant::now());
            previous
        };

        let element = match direction {
            RotationDirection::Clockwise => names::DOME_CW,
            RotationDirection::CounterClockwise => names::DOME_CCW,
        };
        let pending = |s: &MotionState| s.moving && s.continuous == Some(direction);
        if let Err(e) = core.send_switch(&motion.property, element).await {
            self.roll_back(previous, pending).await;
            return Err(e);
        }
        self.announce(core, pending).await;
        tracing::info!("[{}] Rotating {:?}", core.device(), direction);
        Ok(())
    }

    /// Soft stop. Falls back to abort when the device has no stop switch.
    pub async fn stop_rotation(&self) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.stop(&core).await;
        core.logged(result, "Stop rotation")
    }

    pub(crate) async fn stop(&self, core: &DomeCore) -> DomeResult<()> {
        core.ensure_connected().await?;

        let soft_stop = match core.resolved(PropertyRole::Motion).await {
            Some(motion) => core
                .link
                .get_property(&motion.property)
                .await
                .filter(|p| p.has_element(names::DOME_STOP))
                .map(|_| motion.property),
            None => None,
        };

        match soft_stop {
            Some(property) => {
                core.send_switch(&property, names::DOME_STOP).await?;
                tracing::info!("[{}] Stopping rotation", core.device());
                self.mark_stopped(core).await;
                Ok(())
            }
            None => self.abort(core).await,
        }
    }

    /// Hard stop, always attempted regardless of soft-stop support
    pub async fn abort_motion(&self) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.abort(&core).await;
        core.logged(result, "Abort motion")
    }

    async fn abort(&self, core: &DomeCore) -> DomeResult<()> {
        core.ensure_connected().await?;

        let (property, element) = match core.resolved(PropertyRole::Abort).await {
            Some(abort) => (
                abort.property,
                abort.element.unwrap_or_else(|| names::ABORT.to_string()),
            ),
            None => (names::DOME_ABORT_MOTION.to_string(), names::ABORT.to_string()),
        };
        core.send_switch(&property, &element).await?;

        tracing::warn!("[{}] Dome motion aborted", core.device());
        self.mark_stopped(core).await;
        Ok(())
    }

    /// Abort and refuse further motion until cleared
    pub async fn emergency_stop(&self) -> DomeResult<()> {
        self.state.write().await.emergency_stop = true;
        tracing::warn!("Dome emergency stop activated");
        self.abort_motion().await
    }

    pub async fn clear_emergency_stop(&self) {
        self.state.write().await.emergency_stop = false;
        tracing::info!("Dome emergency stop cleared");
    }

    pub async fn is_emergency_stopped(&self) -> bool {
        self.state.read().await.emergency_stop
    }

    async fn mark_stopped(&self, core: &DomeCore) {
        let event = {
            let mut state = self.state.write().await;
            if !state.moving {
                return;
            }
            state.finish_motion();
            state.target_azimuth = state.current_azimuth;
            state.commanded_azimuth = state.current_azimuth;
            state.event()
        };
        core.emit(DomeEvent::Motion(event)).await;
    }

    // =========================================================================
    // Limits, sync, speed, backlash
    // =========================================================================

    /// Restrict moves to `[min, max]`. Requires `0 <= min < max <= 360`.
    pub async fn set_azimuth_limits(&self, min: f64, max: f64) -> DomeResult<()> {
        let limits = AzimuthLimits::new(min, max)?;
        self.state.write().await.limits = Some(limits);
        tracing::info!("Azimuth limits set to [{:.2}°, {:.2}°]", min, max);
        Ok(())
    }

    pub async fn clear_azimuth_limits(&self) {
        self.state.write().await.limits = None;
    }

    pub async fn azimuth_limits(&self) -> Option<AzimuthLimits> {
        self.state.read().await.limits
    }

    /// Tell the device its current azimuth
    pub async fn sync_azimuth(&self, azimuth: f64) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.sync(&core, azimuth).await;
        core.logged(result, "Sync azimuth")
    }

    async fn sync(&self, core: &DomeCore, azimuth: f64) -> DomeResult<()> {
        if !azimuth.is_finite() {
            return Err(DomeError::InvalidParameter(format!(
                "azimuth {} is not a number",
                azimuth
            )));
        }
        core.ensure_connected().await?;

        let azimuth = normalize_azimuth(azimuth);
        let sync = core.require(PropertyRole::Sync).await?;
        let element = sync.element.as_deref().unwrap_or(names::DOME_SYNC_VALUE);
        core.send(&sync.property, vec![PropertyElement::number(element, azimuth)])
            .await?;

        let event = {
            let mut state = self.state.write().await;
            state.current_azimuth = azimuth;
            if !state.moving {
                state.target_azimuth = azimuth;
                state.commanded_azimuth = azimuth;
            }
            state.event()
        };
        tracing::info!("[{}] Dome synced to {:.2}°", core.device(), azimuth);
        core.emit(DomeEvent::Motion(event)).await;
        Ok(())
    }

    /// Accepted rotation speed range as (min, max)
    pub async fn speed_limits(&self) -> (f64, f64) {
        let state = self.state.read().await;
        (state.min_speed, state.max_speed)
    }

    /// Bound the speeds `set_rotation_speed` accepts. Requires `0 <= min < max`.
    pub async fn set_speed_limits(&self, min: f64, max: f64) -> DomeResult<()> {
        check_speed_limits(min, max)?;
        let mut state = self.state.write().await;
        state.min_speed = min;
        state.max_speed = max;
        tracing::info!("Rotation speed limits set to [{}, {}]", min, max);
        Ok(())
    }

    pub async fn is_speed_safe(&self, speed: f64) -> bool {
        let state = self.state.read().await;
        speed.is_finite() && speed > 0.0 && speed >= state.min_speed && speed <= state.max_speed
    }

    pub async fn set_rotation_speed(&self, speed: f64) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.set_speed(&core, speed).await;
        core.logged(result, "Set rotation speed")
    }

    async fn set_speed(&self, core: &DomeCore, speed: f64) -> DomeResult<()> {
        if !self.is_speed_safe(speed).await {
            let (min, max) = self.speed_limits().await;
            return Err(DomeError::InvalidParameter(format!(
                "rotation speed {} outside [{}, {}]",
                speed, min, max
            )));
        }
        core.ensure_connected().await?;

        let property = core.require(PropertyRole::Speed).await?;
        core.send(
            &property.property,
            vec![PropertyElement::number(names::DOME_SPEED_VALUE, speed)],
        )
        .await?;
        self.state.write().await.rotation_speed = speed;
        tracing::info!("[{}] Rotation speed set to {}", core.device(), speed);
        Ok(())
    }

    pub async fn backlash(&self) -> f64 {
        self.state.read().await.backlash
    }

    pub async fn is_backlash_enabled(&self) -> bool {
        self.state.read().await.backlash_enabled
    }

    /// Set the backlash value on the device when it supports it, locally otherwise
    pub async fn set_backlash(&self, degrees: f64) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.store_backlash(&core, degrees).await;
        core.logged(result, "Set backlash")
    }

    async fn store_backlash(&self, core: &DomeCore, degrees: f64) -> DomeResult<()> {
        if !degrees.is_finite() || degrees.abs() >= 180.0 {
            return Err(DomeError::InvalidParameter(format!(
                "invalid backlash {}",
                degrees
            )));
        }
        if let Some(property) = core.resolved(PropertyRole::Backlash).await {
            if core.link.is_connected().await {
                let element = property.element.as_deref().unwrap_or(names::DOME_BACKLASH_VALUE);
                core.send(
                    &property.property,
                    vec![PropertyElement::number(element, degrees)],
                )
                .await?;
            }
        }
        self.state.write().await.backlash = degrees;
        tracing::info!("Backlash compensation set to {:.2}°", degrees);
        Ok(())
    }

    pub async fn enable_backlash(&self, enable: bool) {
        self.state.write().await.backlash_enabled = enable;
        tracing::info!(
            "Backlash compensation {}",
            if enable { "enabled" } else { "disabled" }
        );
    }

    // =========================================================================
    // Statistics and presets
    // =========================================================================

    pub async fn statistics(&self) -> MotionStatistics {
        self.state.read().await.stats
    }

    pub async fn reset_statistics(&self) {
        self.state.write().await.stats = MotionStatistics::default();
    }

    pub async fn save_preset(&self, slot: u8, azimuth: f64) -> DomeResult<()> {
        if !azimuth.is_finite() {
            return Err(DomeError::InvalidParameter(format!(
                "preset azimuth {} is not a number",
                azimuth
            )));
        }
        self.state
            .write()
            .await
            .presets
            .insert(slot, normalize_azimuth(azimuth));
        Ok(())
    }

    /// Store the current azimuth in a preset slot
    pub async fn save_current_as_preset(&self, slot: u8) -> f64 {
        let mut state = self.state.write().await;
        let azimuth = state.current_azimuth;
        state.presets.insert(slot, azimuth);
        azimuth
    }

    pub async fn goto_preset(&self, slot: u8) -> DomeResult<()> {
        let core = self.core()?;
        let result = match self.preset(slot).await {
            Some(azimuth) => self.move_to(&core, azimuth).await,
            None => Err(DomeError::InvalidParameter(format!("preset {} is empty", slot))),
        };
        core.logged(result, "Go to preset")
    }

    pub async fn delete_preset(&self, slot: u8) -> bool {
        self.state.write().await.presets.remove(&slot).is_some()
    }

    pub async fn preset(&self, slot: u8) -> Option<f64> {
        self.state.read().await.presets.get(&slot).copied()
    }

    pub async fn presets(&self) -> BTreeMap<u8, f64> {
        self.state.read().await.presets.clone()
    }

    // =========================================================================
    // Device updates
    // =========================================================================

    /// Apply a device update for a motion property
    pub(crate) async fn handle_property(&self, property: &Property) -> DomeResult<()> {
        let core = self.core()?;
        let (is_position, is_motion, is_speed, is_backlash) = {
            let map = core.properties.read().await;
            (
                map.is_role(PropertyRole::AbsolutePosition, &property.name),
                map.is_role(PropertyRole::Motion, &property.name),
                map.is_role(PropertyRole::Speed, &property.name),
                map.is_role(PropertyRole::Backlash, &property.name),
            )
        };

        if is_position {
            if property.state == PropertyState::Alert {
                self.on_motion_failed(&core).await;
            }
            if let Some(azimuth) = property.first_number() {
                self.on_device_azimuth_update(azimuth).await?;
            }
        } else if is_motion {
            let cw = property.switch(names::DOME_CW) == Some(true);
            let ccw = property.switch(names::DOME_CCW) == Some(true);
            if !cw && !ccw && !property.is_busy() {
                let continuous = self.state.read().await.continuous.is_some();
                if continuous {
                    self.mark_stopped(&core).await;
                }
            }
        } else if is_speed {
            match property.first_number() {
                Some(speed) if speed.is_finite() && speed > 0.0 => {
                    self.state.write().await.rotation_speed = speed;
                }
                Some(speed) => {
                    tracing::warn!("[{}] Ignoring invalid device speed {}", core.device(), speed)
                }
                None => {}
            }
        } else if is_backlash {
            if let Some(backlash) = property.first_number() {
                self.state.write().await.backlash = backlash;
            }
        }
        Ok(())
    }

    /// Authoritative azimuth from the device
    pub async fn on_device_azimuth_update(&self, azimuth: f64) -> DomeResult<()> {
        let core = self.core()?;
        if !azimuth.is_finite() {
            return Err(DomeError::InvalidParameter(format!(
                "device azimuth {} is not a number",
                azimuth
            )));
        }
        let azimuth = normalize_azimuth(azimuth);

        let (event, completed) = {
            let mut state = self.state.write().await;
            let travelled = angular_distance(state.current_azimuth, azimuth);
            if travelled < f64::EPSILON && !state.moving {
                return Ok(());
            }
            state.current_azimuth = azimuth;
            state.stats.total_rotation += travelled;

            let mut completed = false;
            if state.moving
                && state.continuous.is_none()
                && angular_distance(azimuth, state.commanded_azimuth) < state.tolerance
            {
                state.finish_motion();
                completed = true;
            } else if travelled < f64::EPSILON {
                return Ok(());
            }
            (state.event(), completed)
        };

        if completed {
            tracing::info!("[{}] Dome reached {:.2}°", core.device(), azimuth);
        }
        core.emit(DomeEvent::Motion(event)).await;
        Ok(())
    }

    async fn on_motion_failed(&self, core: &DomeCore) {
        let event = {
            let mut state = self.state.write().await;
            if !state.moving {
                return;
            }
            state.finish_motion();
            state.event()
        };
        tracing::error!("[{}] Dome motion failed", core.device());
        core.emit(DomeEvent::Motion(event)).await;
    }
}

/// Overshoot by the backlash in the direction of travel
fn backlash_compensated(state: &MotionState, target: f64) -> f64 {
    if !state.backlash_enabled || state.backlash == 0.0 {
        return target;
    }
    let (_, direction) = shortest_path_with_direction(state.current_azimuth, target);
    match direction {
        RotationDirection::Clockwise => normalize_azimuth(target + state.backlash),
        RotationDirection::CounterClockwise => normalize_azimuth(target - state.backlash),
    }
}
