//! Dome configuration
//!
//! All settings have defaults, so a partial JSON document is enough:
//!
//! ```json
//! { "park_position": 180.0, "weather": { "auto_close": true } }
//! ```

use crate::error::{DomeError, DomeResult};
use crate::telescope::DomeGeometry;
use crate::weather::WeatherLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Complete dome coordination configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomeConfig {
    /// Monitoring tick (default: 100ms)
    pub monitor_interval_ms: u64,
    /// Broadcast buffer for dome events (default: 256)
    pub event_buffer_size: usize,
    /// Close an open shutter before disconnecting (default: true)
    pub close_shutter_on_shutdown: bool,
    /// Azimuth the dome rotates to when parking
    pub park_position: Option<f64>,
    pub motion: MotionConfig,
    pub weather: WeatherConfig,
    pub telescope: TelescopeConfig,
    pub home: HomeConfig,
}

impl Default for DomeConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 100,
            event_buffer_size: crate::events::DEFAULT_EVENT_BUFFER_SIZE,
            close_shutter_on_shutdown: true,
            park_position: None,
            motion: MotionConfig::default(),
            weather: WeatherConfig::default(),
            telescope: TelescopeConfig::default(),
            home: HomeConfig::default(),
        }
    }
}

/// Azimuth window the dome may be commanded into
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AzimuthLimits {
    pub min: f64,
    pub max: f64,
}

impl AzimuthLimits {
    /// Validate `0 <= min < max <= 360`
    pub fn new(min: f64, max: f64) -> DomeResult<Self> {
        if !min.is_finite() || !max.is_finite() {
            return Err(DomeError::InvalidParameter(
                "azimuth limits must be finite".to_string(),
            ));
        }
        if min >= max {
            return Err(DomeError::InvalidParameter(format!(
                "azimuth limit min {:.2}° must be below max {:.2}°",
                min, max
            )));
        }
        if min < 0.0 || max > 360.0 {
            return Err(DomeError::InvalidParameter(format!(
                "azimuth limits [{:.2}°, {:.2}°] outside [0°, 360°]",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Check a normalized azimuth against the window
    pub fn contains(&self, azimuth: f64) -> bool {
        azimuth >= self.min && azimuth <= self.max
    }
}

/// Motion controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Distance to target below which a move counts as complete (default: 1.0°)
    pub tolerance_deg: f64,
    pub azimuth_limits: Option<AzimuthLimits>,
    pub backlash_enabled: bool,
    pub backlash_deg: f64,
    /// Named azimuth slots
    pub presets: BTreeMap<u8, f64>,
    /// Slowest rotation speed accepted by `set_rotation_speed` (default: 0.1)
    pub min_speed: f64,
    /// Fastest rotation speed accepted by `set_rotation_speed` (default: 10.0)
    pub max_speed: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            tolerance_deg: 1.0,
            azimuth_limits: None,
            backlash_enabled: false,
            backlash_deg: 0.0,
            presets: BTreeMap::new(),
            min_speed: 0.1,
            max_speed: 10.0,
        }
    }
}

/// Validate `0 <= min < max`
pub(crate) fn check_speed_limits(min: f64, max: f64) -> DomeResult<()> {
    if !min.is_finite() || !max.is_finite() || min < 0.0 || max <= min {
        return Err(DomeError::InvalidParameter(format!(
            "speed limits [{}, {}] must satisfy 0 <= min < max",
            min, max
        )));
    }
    Ok(())
}

/// Weather monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// Evaluate weather on the monitoring loop (default: true)
    pub enabled: bool,
    /// Close the shutter and stop rotation when weather turns unsafe (default: true)
    pub auto_close: bool,
    /// Weather evaluation interval (default: 5000ms)
    pub check_interval_ms: u64,
    /// Treat a device-reported weather alert as unsafe (default: true)
    pub honor_device_alerts: bool,
    pub limits: WeatherLimits,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_close: true,
            check_interval_ms: 5000,
            honor_device_alerts: true,
            limits: WeatherLimits::default(),
        }
    }
}

/// Telescope following settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelescopeConfig {
    pub following_enabled: bool,
    /// Minimum dome/telescope separation that triggers a move (default: 1.0°)
    pub following_threshold_deg: f64,
    /// Minimum time between follow moves (default: 500ms)
    pub following_delay_ms: u64,
    pub geometry: DomeGeometry,
}

impl Default for TelescopeConfig {
    fn default() -> Self {
        Self {
            following_enabled: false,
            following_threshold_deg: 1.0,
            following_delay_ms: 500,
            geometry: DomeGeometry::default(),
        }
    }
}

impl TelescopeConfig {
    pub fn following_delay(&self) -> Duration {
        Duration::from_millis(self.following_delay_ms)
    }
}

/// Home manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeConfig {
    pub home_position: Option<f64>,
    pub auto_home_enabled: bool,
    /// Run home discovery on connect when no home is known
    pub auto_home_on_startup: bool,
    /// Bound on a home search (default: 120s)
    pub timeout_ms: u64,
    /// Poll interval while waiting for the search to finish (default: 100ms)
    pub poll_interval_ms: u64,
}

impl Default for HomeConfig {
    fn default() -> Self {
        Self {
            home_position: None,
            auto_home_enabled: false,
            auto_home_on_startup: false,
            timeout_ms: 120_000,
            poll_interval_ms: 100,
        }
    }
}

impl HomeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl DomeConfig {
    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> DomeResult<Self> {
        let config: DomeConfig = serde_json::from_str(json)
            .map_err(|e| DomeError::InvalidParameter(format!("invalid dome config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> DomeResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DomeError::InvalidParameter(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Check every setting for consistency
    pub fn validate(&self) -> DomeResult<()> {
        if self.monitor_interval_ms == 0 {
            return Err(DomeError::InvalidParameter(
                "monitor_interval_ms must be positive".to_string(),
            ));
        }
        if !(self.motion.tolerance_deg > 0.0 && self.motion.tolerance_deg < 180.0) {
            return Err(DomeError::InvalidParameter(format!(
                "motion tolerance {}° must be in (0°, 180°)",
                self.motion.tolerance_deg
            )));
        }
        if let Some(limits) = self.motion.azimuth_limits {
            AzimuthLimits::new(limits.min, limits.max)?;
        }
        if !self.motion.backlash_deg.is_finite() || self.motion.backlash_deg.abs() >= 180.0 {
            return Err(DomeError::InvalidParameter(format!(
                "backlash {}° out of range",
                self.motion.backlash_deg
            )));
        }
        check_speed_limits(self.motion.min_speed, self.motion.max_speed)?;
        if let Some((slot, az)) = self.motion.presets.iter().find(|(_, az)| !az.is_finite()) {
            return Err(DomeError::InvalidParameter(format!(
                "preset {} has invalid azimuth {}",
                slot, az
            )));
        }
        for (what, position) in [
            ("park_position", self.park_position),
            ("home_position", self.home.home_position),
        ] {
            if matches!(position, Some(az) if !az.is_finite()) {
                return Err(DomeError::InvalidParameter(format!("{} must be finite", what)));
            }
        }
        self.weather.limits.validate()?;
        if self.weather.check_interval_ms == 0 {
            return Err(DomeError::InvalidParameter(
                "weather check_interval_ms must be positive".to_string(),
            ));
        }
        if !(self.telescope.following_threshold_deg >= 0.0) {
            return Err(DomeError::InvalidParameter(
                "following threshold must be non-negative".to_string(),
            ));
        }
        self.telescope.geometry.validate()?;
        if self.home.timeout_ms == 0 || self.home.poll_interval_ms == 0 {
            return Err(DomeError::InvalidParameter(
                "home timeout and poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn weather_check_interval(&self) -> Duration {
        Duration::from_millis(self.weather.check_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DomeConfig::default();
        assert_eq!(config.monitor_interval_ms, 100);
        assert_eq!(config.motion.tolerance_deg, 1.0);
        assert_eq!(config.telescope.following_threshold_deg, 1.0);
        assert!(config.weather.enabled);
        assert!(config.weather.auto_close);
        assert!(config.close_shutter_on_shutdown);
        assert_eq!(config.park_position, None);
        assert_eq!(config.home.timeout(), Duration::from_secs(120));
        assert_eq!(config.telescope.following_delay(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = DomeConfig::from_json_str(
            r#"{ "park_position": 180.0, "weather": { "auto_close": false }, "motion": { "azimuth_limits": { "min": 0.0, "max": 350.0 } } }"#,
        )
        .unwrap();
        assert_eq!(config.park_position, Some(180.0));
        assert!(!config.weather.auto_close);
        assert!(config.weather.enabled);
        assert_eq!(config.motion.azimuth_limits, Some(AzimuthLimits { min: 0.0, max: 350.0 }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(DomeConfig::from_json_str(r#"{ "monitor_interval_ms": 0 }"#).is_err());
        assert!(DomeConfig::from_json_str(
            r#"{ "motion": { "azimuth_limits": { "min": 200.0, "max": 100.0 } } }"#
        )
        .is_err());
        assert!(DomeConfig::from_json_str(
            r#"{ "weather": { "limits": { "max_humidity": 120.0 } } }"#
        )
        .is_err());
        assert!(DomeConfig::from_json_str(
            r#"{ "motion": { "min_speed": 5.0, "max_speed": 2.0 } }"#
        )
        .is_err());
        assert!(DomeConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_azimuth_limits() {
        assert!(AzimuthLimits::new(10.0, 10.0).is_err());
        assert!(AzimuthLimits::new(-5.0, 10.0).is_err());
        assert!(AzimuthLimits::new(0.0, 361.0).is_err());
        let limits = AzimuthLimits::new(0.0, 350.0).unwrap();
        assert!(limits.contains(350.0));
        assert!(!limits.contains(355.0));
    }

    #[test]
    fn test_serde() -> anyhow::Result<()> {
        let mut config = DomeConfig::default();
        config.motion.presets.insert(1, 45.0);
        config.home.home_position = Some(0.0);
        let json = serde_json::to_string(&config)?;
        let deserialized: DomeConfig = serde_json::from_str(&json)?;
        assert_eq!(config, deserialized);
        Ok(())
    }

    #[test]
    fn test_from_file() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("dome-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "close_shutter_on_shutdown": false }"#)?;
        let config = DomeConfig::from_file(&path)?;
        std::fs::remove_file(&path)?;
        assert!(!config.close_shutter_on_shutdown);

        assert!(DomeConfig::from_file(&path).is_err());
        Ok(())
    }
}
