//! Telescope coordinator
//!
//! Computes the dome azimuth a telescope pointing needs and, while following
//! is enabled, moves the dome when the two drift apart by more than the
//! following threshold.

use crate::angle::{angular_distance, normalize_azimuth};
use crate::config::TelescopeConfig;
use crate::coordinator::DomeCore;
use crate::error::{DomeError, DomeResult};
use crate::events::{DomeEvent, TelescopeEvent};
use crate::link::Property;
use crate::parking::ParkStatus;
use crate::properties::{names, PropertyRole};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Mount position relative to the dome center, in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomeGeometry {
    pub north_offset: f64,
    pub east_offset: f64,
    /// Distance from the mount axes intersection to the optical axis
    pub telescope_radius: f64,
    pub dome_radius: f64,
}

impl Default for DomeGeometry {
    fn default() -> Self {
        Self {
            north_offset: 0.0,
            east_offset: 0.0,
            telescope_radius: 0.0,
            dome_radius: 1.5,
        }
    }
}

impl DomeGeometry {
    pub fn validate(&self) -> DomeResult<()> {
        let finite = [
            self.north_offset,
            self.east_offset,
            self.telescope_radius,
            self.dome_radius,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite || self.dome_radius <= 0.0 {
            return Err(DomeError::InvalidParameter(format!(
                "invalid dome geometry {:?}",
                self
            )));
        }
        Ok(())
    }

    fn has_offsets(&self) -> bool {
        self.north_offset != 0.0 || self.east_offset != 0.0 || self.telescope_radius != 0.0
    }
}

/// Dome azimuth for a telescope pointing.
///
/// The base is the telescope azimuth. With offsets configured a correction
/// is added: the offset component across the line of sight plus the
/// `radius * sin(alt)` height term, seen from the dome radius. This is an
/// approximation, not a full dome parallax solution.
pub fn calculate_dome_azimuth(azimuth: f64, altitude: f64, geometry: &DomeGeometry) -> f64 {
    if !geometry.has_offsets() {
        return normalize_azimuth(azimuth);
    }

    let az = azimuth.to_radians();
    let alt = altitude.to_radians();
    let lateral = geometry.east_offset * az.cos() - geometry.north_offset * az.sin()
        + geometry.telescope_radius * alt.sin();
    let correction = lateral.atan2(geometry.dome_radius).to_degrees();

    normalize_azimuth(azimuth + correction)
}

struct TelescopeState {
    following: bool,
    position: Option<(f64, f64)>,
    geometry: DomeGeometry,
    threshold: f64,
    delay: Duration,
    last_follow_move: Option<Instant>,
}

pub struct TelescopeCoordinator {
    core: Weak<DomeCore>,
    state: RwLock<TelescopeState>,
    /// Serializes follow decisions between callers and the monitor tick
    follow_lock: Mutex<()>,
}

impl TelescopeCoordinator {
    pub(crate) fn new(core: Weak<DomeCore>, config: &TelescopeConfig) -> Self {
        Self {
            core,
            state: RwLock::new(TelescopeState {
                following: config.following_enabled,
                position: None,
                geometry: config.geometry,
                threshold: config.following_threshold_deg,
                delay: config.following_delay(),
                last_follow_move: None,
            }),
            follow_lock: Mutex::new(()),
        }
    }

    fn core(&self) -> DomeResult<Arc<DomeCore>> {
        self.core.upgrade().ok_or(DomeError::CoordinatorDropped)
    }

    pub async fn is_following(&self) -> bool {
        self.state.read().await.following
    }

    /// Enable or disable following. Mirrors the setting to DOME_AUTOSYNC when available.
    pub async fn enable_following(&self, enable: bool) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.set_following(&core, enable).await;
        core.logged(result, "Enable following")
    }

    async fn set_following(&self, core: &DomeCore, enable: bool) -> DomeResult<()> {
        if let Some(autosync) = core.resolved(PropertyRole::AutoSync).await {
            core.ensure_connected().await?;
            let element = if enable {
                names::DOME_AUTOSYNC_ENABLE
            } else {
                names::DOME_AUTOSYNC_DISABLE
            };
            core.send_switch(&autosync.property, element).await?;
        }

        self.state.write().await.following = enable;
        tracing::info!(
            "[{}] Telescope following {}",
            core.device(),
            if enable { "enabled" } else { "disabled" }
        );

        if enable {
            self.update_following().await?;
        }
        Ok(())
    }

    pub async fn following_threshold(&self) -> f64 {
        self.state.read().await.threshold
    }

    pub async fn set_following_threshold(&self, degrees: f64) -> DomeResult<()> {
        if !(0.0..180.0).contains(&degrees) {
            return Err(DomeError::InvalidParameter(format!(
                "following threshold {} must be within [0, 180)",
                degrees
            )));
        }
        self.state.write().await.threshold = degrees;
        Ok(())
    }

    pub async fn following_delay(&self) -> Duration {
        self.state.read().await.delay
    }

    /// Minimum interval between two follow moves
    pub async fn set_following_delay(&self, delay: Duration) {
        self.state.write().await.delay = delay;
    }

    pub async fn geometry(&self) -> DomeGeometry {
        self.state.read().await.geometry
    }

    pub async fn set_geometry(&self, geometry: DomeGeometry) -> DomeResult<()> {
        geometry.validate()?;
        self.state.write().await.geometry = geometry;
        Ok(())
    }

    /// Last reported telescope (azimuth, altitude)
    pub async fn telescope_position(&self) -> Option<(f64, f64)> {
        self.state.read().await.position
    }

    pub async fn calculate_dome_azimuth(&self, azimuth: f64, altitude: f64) -> f64 {
        let geometry = self.geometry().await;
        calculate_dome_azimuth(azimuth, altitude, &geometry)
    }

    /// Dome and required azimuth differ by more than the threshold
    pub async fn should_move_dome(&self, required_azimuth: f64) -> DomeResult<bool> {
        let core = self.core()?;
        let current = core.motion.current_azimuth().await;
        let threshold = self.following_threshold().await;
        Ok(angular_distance(current, required_azimuth) > threshold)
    }

    /// Record a telescope pointing. Returns whether a follow move was issued.
    pub async fn set_telescope_position(&self, azimuth: f64, altitude: f64) -> DomeResult<bool> {
        let core = self.core()?;
        let result = self.record_position(&core, azimuth, altitude).await;
        core.logged(result, "Telescope position")
    }

    async fn record_position(
        &self,
        core: &DomeCore,
        azimuth: f64,
        altitude: f64,
    ) -> DomeResult<bool> {
        if !azimuth.is_finite() || !(-90.0..=90.0).contains(&altitude) {
            return Err(DomeError::InvalidParameter(format!(
                "invalid telescope position az={} alt={}",
                azimuth, altitude
            )));
        }

        let azimuth = normalize_azimuth(azimuth);
        let (required, following) = {
            let mut state = self.state.write().await;
            state.position = Some((azimuth, altitude));
            (
                calculate_dome_azimuth(azimuth, altitude, &state.geometry),
                state.following,
            )
        };

        core.emit(DomeEvent::Telescope(TelescopeEvent {
            telescope_azimuth: azimuth,
            telescope_altitude: altitude,
            dome_azimuth: required,
        }))
        .await;

        if !following {
            return Ok(false);
        }
        self.follow(core, required).await
    }

    /// Re-evaluate following for the last known telescope position
    pub async fn update_following(&self) -> DomeResult<bool> {
        let core = self.core()?;
        let (position, geometry, following) = {
            let state = self.state.read().await;
            (state.position, state.geometry, state.following)
        };
        match position {
            Some((az, alt)) if following => {
                let required = calculate_dome_azimuth(az, alt, &geometry);
                self.follow(&core, required).await
            }
            _ => Ok(false),
        }
    }

    async fn follow(&self, core: &DomeCore, required: f64) -> DomeResult<bool> {
        let _follow = self.follow_lock.lock().await;
        if core.parking.status().await != ParkStatus::Unparked {
            return Ok(false);
        }

        let (threshold, delay, last_move) = {
            let state = self.state.read().await;
            (state.threshold, state.delay, state.last_follow_move)
        };

        let motion = &core.motion;
        if motion.is_moving().await {
            if motion.rotation_direction().await.is_some() {
                return Ok(false);
            }
            // Already slewing close enough to where the telescope needs us
            if angular_distance(motion.target_azimuth().await, required) <= threshold {
                return Ok(false);
            }
        } else if angular_distance(motion.current_azimuth().await, required) <= threshold {
            return Ok(false);
        }

        if last_move.map_or(false, |at| at.elapsed() < delay) {
            return Ok(false);
        }

        tracing::debug!("[{}] Following telescope to {:.2}°", core.device(), required);
        motion.move_to(core, required).await?;
        self.state.write().await.last_follow_move = Some(Instant::now());
        Ok(true)
    }

    /// Apply a device update for a telescope-related property
    pub(crate) async fn handle_property(&self, property: &Property) -> DomeResult<()> {
        let core = self.core()?;
        let (is_params, is_coord, is_autosync) = {
            let map = core.properties.read().await;
            (
                map.is_role(PropertyRole::DomeParams, &property.name),
                map.is_role(PropertyRole::TelescopeCoord, &property.name),
                map.is_role(PropertyRole::AutoSync, &property.name),
            )
        };

        if is_params {
            let updated = {
                let mut state = self.state.write().await;
                let mut geometry = state.geometry;
                if let Some(v) = property.number(names::TELESCOPE_OFFSET_NS) {
                    geometry.north_offset = v;
                }
                if let Some(v) = property.number(names::TELESCOPE_OFFSET_EW) {
                    geometry.east_offset = v;
                }
                if let Some(v) = property.number(names::DOME_RADIUS) {
                    geometry.dome_radius = v;
                }
                match geometry.validate() {
                    Ok(()) => {
                        state.geometry = geometry;
                        true
                    }
                    Err(e) => {
                        e.log(core.device(), "DOME_PARAMS update");
                        false
                    }
                }
            };
            if updated {
                tracing::debug!("[{}] Dome geometry updated from device", core.device());
            }
        } else if is_coord {
            if let (Some(az), Some(alt)) = (property.number(names::AZ), property.number(names::ALT)) {
                self.record_position(&core, az, alt).await?;
            }
        } else if is_autosync {
            if let Some(on) = property.switch(names::DOME_AUTOSYNC_ENABLE) {
                self.state.write().await.following = on;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomeConfig;
    use crate::coordinator::test_support::{connected, device_update};
    use crate::link::PropertyState;

    fn position(azimuth: f64) -> Property {
        Property::numbers(
            names::ABS_DOME_POSITION,
            &[(names::DOME_ABSOLUTE_POSITION, azimuth)],
        )
        .with_state(PropertyState::Ok)
    }

    fn following_config() -> DomeConfig {
        let mut config = DomeConfig::default();
        config.telescope.following_enabled = true;
        config.telescope.following_delay_ms = 0;
        config
    }

    #[test]
    fn test_dome_azimuth_without_offsets() {
        let geometry = DomeGeometry::default();
        assert_eq!(calculate_dome_azimuth(90.0, 45.0, &geometry), 90.0);
        assert_eq!(calculate_dome_azimuth(-30.0, 10.0, &geometry), 330.0);
    }

    #[test]
    fn test_dome_azimuth_height_term() {
        let geometry = DomeGeometry {
            telescope_radius: 1.5,
            ..DomeGeometry::default()
        };
        // atan2(1.5 * sin 90°, 1.5) = 45°
        let az = calculate_dome_azimuth(100.0, 90.0, &geometry);
        assert!((az - 145.0).abs() < 1e-9);
        // Horizon pointing has no height correction
        let az = calculate_dome_azimuth(100.0, 0.0, &geometry);
        assert!((az - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_dome_azimuth_lateral_offset() {
        let geometry = DomeGeometry {
            east_offset: 1.5,
            ..DomeGeometry::default()
        };
        // Pointing north, an east offset is fully across the line of sight
        let az = calculate_dome_azimuth(0.0, 30.0, &geometry);
        assert!((az - 45.0).abs() < 1e-9);
        // Pointing east, it is along the line of sight
        let az = calculate_dome_azimuth(90.0, 30.0, &geometry);
        assert!((az - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_following_threshold_scenario() {
        let (sim, coord) = connected(following_config()).await;
        device_update(&sim, &coord, position(90.5)).await;
        sim.clear_commands().await;

        let moved = coord.telescope().set_telescope_position(90.0, 45.0).await.unwrap();
        assert!(!moved);
        assert!(sim.sent_commands().await.is_empty());

        let moved = coord.telescope().set_telescope_position(95.0, 45.0).await.unwrap();
        assert!(moved);
        assert_eq!(sim.last_number(names::ABS_DOME_POSITION).await, Some(95.0));
    }

    #[tokio::test]
    async fn test_no_duplicate_move_while_slewing() {
        let (sim, coord) = connected(following_config()).await;

        assert!(coord.telescope().set_telescope_position(120.0, 30.0).await.unwrap());
        assert!(!coord.telescope().set_telescope_position(120.4, 30.0).await.unwrap());
        assert!(!coord.telescope().update_following().await.unwrap());
        assert_eq!(sim.count_numbers(names::ABS_DOME_POSITION).await, 1);

        // A large jump retargets the slew
        assert!(coord.telescope().set_telescope_position(200.0, 30.0).await.unwrap());
        assert_eq!(sim.count_numbers(names::ABS_DOME_POSITION).await, 2);
    }

    #[tokio::test]
    async fn test_following_delay() {
        let mut config = following_config();
        config.telescope.following_delay_ms = 60_000;
        let (sim, coord) = connected(config).await;

        assert!(coord.telescope().set_telescope_position(90.0, 30.0).await.unwrap());
        assert!(!coord.telescope().set_telescope_position(250.0, 30.0).await.unwrap());
        assert_eq!(sim.count_numbers(names::ABS_DOME_POSITION).await, 1);
    }

    #[tokio::test]
    async fn test_not_following() {
        let (sim, coord) = connected(DomeConfig::default()).await;
        sim.clear_commands().await;

        let mut events = coord.subscribe();
        assert!(!coord.telescope().set_telescope_position(180.0, 60.0).await.unwrap());
        assert!(sim.sent_commands().await.is_empty());
        assert_eq!(coord.telescope().telescope_position().await, Some((180.0, 60.0)));

        loop {
            if let DomeEvent::Telescope(e) = events.recv().await.unwrap() {
                assert_eq!(e.telescope_azimuth, 180.0);
                assert_eq!(e.dome_azimuth, 180.0);
                break;
            }
        }

        // Enabling picks up the last position
        coord.telescope().enable_following(true).await.unwrap();
        assert_eq!(sim.last_number(names::ABS_DOME_POSITION).await, Some(180.0));
    }

    #[tokio::test]
    async fn test_no_following_while_parked() {
        let (sim, coord) = connected(following_config()).await;
        device_update(
            &sim,
            &coord,
            Property::switches(names::DOME_PARK, &[(names::PARK, true), (names::UNPARK, false)]),
        )
        .await;
        sim.clear_commands().await;

        assert!(!coord.telescope().set_telescope_position(45.0, 30.0).await.unwrap());
        assert!(sim.sent_commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_device_geometry_and_autosync() {
        let (sim, coord) = connected(DomeConfig::default()).await;
        sim.set_property(Property::switches(
            names::DOME_AUTOSYNC,
            &[
                (names::DOME_AUTOSYNC_ENABLE, false),
                (names::DOME_AUTOSYNC_DISABLE, true),
            ],
        ))
        .await;
        coord.resync().await;

        coord.telescope().enable_following(true).await.unwrap();
        assert_eq!(
            sim.count_commands(names::DOME_AUTOSYNC, names::DOME_AUTOSYNC_ENABLE).await,
            1
        );

        device_update(
            &sim,
            &coord,
            Property::numbers(
                names::DOME_PARAMS,
                &[
                    (names::TELESCOPE_OFFSET_NS, 0.2),
                    (names::TELESCOPE_OFFSET_EW, -0.3),
                    (names::DOME_RADIUS, 2.5),
                ],
            ),
        )
        .await;
        let geometry = coord.telescope().geometry().await;
        assert_eq!(geometry.north_offset, 0.2);
        assert_eq!(geometry.east_offset, -0.3);
        assert_eq!(geometry.dome_radius, 2.5);

        // Invalid radius is ignored
        device_update(
            &sim,
            &coord,
            Property::numbers(names::DOME_PARAMS, &[(names::DOME_RADIUS, 0.0)]),
        )
        .await;
        assert_eq!(coord.telescope().geometry().await.dome_radius, 2.5);
    }

    #[tokio::test]
    async fn test_invalid_position() {
        let (_sim, coord) = connected(DomeConfig::default()).await;
        assert!(coord.telescope().set_telescope_position(10.0, 95.0).await.is_err());
        assert!(coord.telescope().set_telescope_position(f64::NAN, 10.0).await.is_err());
        assert!(coord.telescope().set_following_threshold(-1.0).await.is_err());
    }
}
