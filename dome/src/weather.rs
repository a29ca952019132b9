//! Weather monitor
//!
//! Keeps the latest weather readings, evaluates them against the limits and
//! drives the safety cascade (close shutter, stop rotation) when the weather
//! turns unsafe. Events fire only on safe/unsafe transitions.

use crate::coordinator::DomeCore;
use crate::config::WeatherConfig;
use crate::error::{DomeError, DomeResult};
use crate::events::{DomeEvent, WeatherEvent};
use crate::link::{Property, PropertyState, PropertyValue};
use crate::properties::{names, PropertyRole};
use crate::shutter::ShutterState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Limits the weather must stay within
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherLimits {
    /// m/s
    pub max_wind_speed: f64,
    /// °C
    pub min_temperature: f64,
    /// °C
    pub max_temperature: f64,
    /// %
    pub max_humidity: f64,
    pub rain_protection: bool,
}

impl Default for WeatherLimits {
    fn default() -> Self {
        Self {
            max_wind_speed: 15.0,
            min_temperature: -10.0,
            max_temperature: 40.0,
            max_humidity: 85.0,
            rain_protection: true,
        }
    }
}

impl WeatherLimits {
    pub fn validate(&self) -> DomeResult<()> {
        if !(self.max_wind_speed >= 0.0) {
            return Err(DomeError::InvalidParameter(format!(
                "max wind speed {} must be non-negative",
                self.max_wind_speed
            )));
        }
        if !(0.0..=100.0).contains(&self.max_humidity) {
            return Err(DomeError::InvalidParameter(format!(
                "max humidity {} must be within [0, 100]",
                self.max_humidity
            )));
        }
        if !(self.min_temperature < self.max_temperature) {
            return Err(DomeError::InvalidParameter(format!(
                "min temperature {} must be below max temperature {}",
                self.min_temperature, self.max_temperature
            )));
        }
        Ok(())
    }
}

/// Raw readings gathered from the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherReadings {
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub rain_detected: bool,
    /// Weather station reports an alert on its status lights
    pub device_alert: bool,
}

impl Default for WeatherReadings {
    fn default() -> Self {
        Self {
            temperature: 20.0,
            humidity: 50.0,
            wind_speed: 0.0,
            rain_detected: false,
            device_alert: false,
        }
    }
}

/// Evaluated weather snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherCondition {
    pub temperature: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub rain_detected: bool,
    pub safe: bool,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

const SAFE_DETAILS: &str = "Weather conditions are safe";

/// Evaluate readings against limits. Every check must pass for the weather to be safe.
pub fn evaluate(readings: &WeatherReadings, limits: &WeatherLimits) -> WeatherCondition {
    let mut issues = Vec::new();

    if readings.wind_speed > limits.max_wind_speed {
        issues.push(format!(
            "Wind speed too high ({:.1} > {:.1} m/s)",
            readings.wind_speed, limits.max_wind_speed
        ));
    }
    if readings.temperature < limits.min_temperature
        || readings.temperature > limits.max_temperature
    {
        issues.push(format!(
            "Temperature out of range ({:.1}°C not in [{:.1}, {:.1}])",
            readings.temperature, limits.min_temperature, limits.max_temperature
        ));
    }
    if readings.humidity > limits.max_humidity {
        issues.push(format!(
            "Humidity too high ({:.1} > {:.1}%)",
            readings.humidity, limits.max_humidity
        ));
    }
    if limits.rain_protection && readings.rain_detected {
        issues.push("Rain detected".to_string());
    }

    let safe = issues.is_empty();
    WeatherCondition {
        temperature: readings.temperature,
        humidity: readings.humidity,
        wind_speed: readings.wind_speed,
        rain_detected: readings.rain_detected,
        safe,
        details: if safe {
            SAFE_DETAILS.to_string()
        } else {
            issues.join("; ")
        },
        timestamp: Utc::now(),
    }
}

struct WeatherState {
    enabled: bool,
    auto_close: bool,
    honor_device_alerts: bool,
    limits: WeatherLimits,
    readings: WeatherReadings,
    safe: bool,
    condition: WeatherCondition,
    last_check: Option<Instant>,
}

pub struct WeatherMonitor {
    core: Weak<DomeCore>,
    state: RwLock<WeatherState>,
}

impl WeatherMonitor {
    pub(crate) fn new(core: Weak<DomeCore>, config: &WeatherConfig) -> Self {
        let readings = WeatherReadings::default();
        Self {
            core,
            state: RwLock::new(WeatherState {
                enabled: config.enabled,
                auto_close: config.auto_close,
                honor_device_alerts: config.honor_device_alerts,
                limits: config.limits,
                readings,
                safe: true,
                condition: evaluate(&readings, &config.limits),
                last_check: None,
            }),
        }
    }

    fn core(&self) -> DomeResult<Arc<DomeCore>> {
        self.core.upgrade().ok_or(DomeError::CoordinatorDropped)
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.read().await.enabled
    }

    /// Enable or disable monitoring. A disabled monitor reports safe.
    pub async fn enable_monitoring(&self, enable: bool) -> DomeResult<()> {
        let core = self.core()?;
        let became_safe = {
            let mut state = self.state.write().await;
            state.enabled = enable;
            state.last_check = None;
            if !enable && !state.safe {
                state.safe = true;
                true
            } else {
                false
            }
        };
        tracing::info!(
            "[{}] Weather monitoring {}",
            core.device(),
            if enable { "enabled" } else { "disabled" }
        );
        if became_safe {
            core.emit(DomeEvent::Weather(WeatherEvent {
                safe: true,
                details: "Weather monitoring disabled".to_string(),
            }))
            .await;
        }
        Ok(())
    }

    pub async fn is_auto_close_enabled(&self) -> bool {
        self.state.read().await.auto_close
    }

    pub async fn set_auto_close(&self, enable: bool) {
        self.state.write().await.auto_close = enable;
    }

    pub async fn limits(&self) -> WeatherLimits {
        self.state.read().await.limits
    }

    /// Replace the limits. Takes effect on the next check.
    pub async fn set_limits(&self, limits: WeatherLimits) -> DomeResult<()> {
        limits.validate()?;
        self.state.write().await.limits = limits;
        tracing::info!(
            "Weather limits: wind {:.1} m/s, temperature [{:.1}, {:.1}]°C, humidity {:.1}%, rain protection {}",
            limits.max_wind_speed,
            limits.min_temperature,
            limits.max_temperature,
            limits.max_humidity,
            limits.rain_protection
        );
        Ok(())
    }

    pub async fn readings(&self) -> WeatherReadings {
        self.state.read().await.readings
    }

    /// Last evaluated condition
    pub async fn condition(&self) -> WeatherCondition {
        self.state.read().await.condition.clone()
    }

    /// Result of the last check
    pub async fn is_safe(&self) -> bool {
        self.state.read().await.safe
    }

    /// Safe to operate: monitoring disabled or weather safe
    pub async fn is_safe_for_operation(&self) -> bool {
        let state = self.state.read().await;
        !state.enabled || state.safe
    }

    pub(crate) async fn is_check_due(&self, interval: Duration) -> bool {
        let state = self.state.read().await;
        state.enabled && state.last_check.map_or(true, |at| at.elapsed() >= interval)
    }

    /// Refresh readings from the device and evaluate them.
    ///
    /// On a safe/unsafe transition a weather event fires, and on a transition
    /// to unsafe with auto-close enabled the safety cascade runs.
    pub async fn check_weather_status(&self) -> DomeResult<WeatherCondition> {
        let core = self.core()?;
        if !self.is_enabled().await {
            return Ok(self.condition().await);
        }
        core.ensure_connected().await?;

        for role in [
            PropertyRole::WeatherParameters,
            PropertyRole::Rain,
            PropertyRole::WeatherStatus,
        ] {
            if let Some(resolved) = core.resolved(role).await {
                if let Some(property) = core.link.get_property(&resolved.property).await {
                    self.apply_reading(role, &property).await;
                }
            }
        }

        let (condition, transitioned, auto_close) = {
            let mut state = self.state.write().await;
            let mut condition = evaluate(&state.readings, &state.limits);
            if state.honor_device_alerts && state.readings.device_alert {
                condition.details = if condition.safe {
                    "Weather station reports alert".to_string()
                } else {
                    format!("{}; Weather station reports alert", condition.details)
                };
                condition.safe = false;
            }

            let transitioned = state.safe != condition.safe;
            state.safe = condition.safe;
            state.condition = condition.clone();
            state.last_check = Some(Instant::now());
            (condition, transitioned, state.auto_close)
        };

        if transitioned {
            if condition.safe {
                tracing::info!("[{}] Weather conditions are safe", core.device());
            } else {
                tracing::warn!("[{}] Weather unsafe: {}", core.device(), condition.details);
            }
            core.emit(DomeEvent::Weather(WeatherEvent {
                safe: condition.safe,
                details: condition.details.clone(),
            }))
            .await;

            if !condition.safe && auto_close {
                self.perform_safety_checks().await?;
            }
        }

        Ok(condition)
    }

    /// Close the shutter and stop rotation. Each action is attempted on its own.
    pub async fn perform_safety_checks(&self) -> DomeResult<()> {
        let core = self.core()?;

        if !matches!(
            core.shutter.state().await,
            ShutterState::Closed | ShutterState::Closing
        ) {
            tracing::warn!("[{}] Auto-closing shutter due to unsafe weather", core.device());
            if let Err(e) = core.shutter.close(&core).await {
                e.log(core.device(), "Weather auto-close");
            }
        }

        if core.motion.is_moving().await {
            tracing::warn!("[{}] Stopping rotation due to unsafe weather", core.device());
            if let Err(e) = core.motion.stop(&core).await {
                e.log(core.device(), "Weather rotation stop");
            }
        }
        Ok(())
    }

    /// Apply a device update for a weather property
    pub(crate) async fn handle_property(&self, property: &Property) -> DomeResult<()> {
        let core = self.core()?;
        let role = {
            let map = core.properties.read().await;
            [
                PropertyRole::WeatherParameters,
                PropertyRole::Rain,
                PropertyRole::WeatherStatus,
            ]
            .into_iter()
            .find(|role| map.is_role(*role, &property.name))
        };
        if let Some(role) = role {
            self.apply_reading(role, property).await;
        }
        Ok(())
    }

    async fn apply_reading(&self, role: PropertyRole, property: &Property) {
        let mut state = self.state.write().await;
        let readings = &mut state.readings;
        match role {
            PropertyRole::WeatherParameters => {
                let mut wind: Option<f64> = None;
                for element in &property.elements {
                    let PropertyValue::Number(value) = element.value else {
                        continue;
                    };
                    let name = element.name.as_str();
                    if name.contains("TEMP") {
                        readings.temperature = value;
                    } else if name.contains("HUM") {
                        readings.humidity = value;
                    } else if name.contains("WIND") && !name.contains("DIR") {
                        // Gusts count against the wind limit too
                        wind = Some(wind.map_or(value, |w| w.max(value)));
                    }
                }
                if let Some(wind) = wind {
                    readings.wind_speed = wind;
                }
            }
            PropertyRole::Rain => {
                readings.rain_detected = match property.element(names::RAIN_ALERT).map(|e| &e.value) {
                    Some(PropertyValue::Switch(on)) => *on,
                    Some(PropertyValue::Light(light)) => {
                        matches!(light, PropertyState::Busy | PropertyState::Alert)
                    }
                    Some(PropertyValue::Number(value)) => *value > 0.0,
                    _ => readings.rain_detected,
                };
            }
            PropertyRole::WeatherStatus => {
                readings.device_alert = property.state == PropertyState::Alert
                    || property
                        .elements
                        .iter()
                        .any(|e| e.value == PropertyValue::Light(PropertyState::Alert));
            }
            _ => {}
        }
    }
}
