//! In-memory dome device
//!
//! `SimulatedDome` implements [`DeviceLink`] over a property table. Without
//! physics it only records commands, which keeps tests deterministic: the
//! test decides when and how the "device" answers. With physics enabled a
//! background task moves the dome, the shutter and the park/home switches
//! over time, 50ms per cycle, and pushes every change to subscribers.

use crate::angle::{normalize_azimuth, shortest_path, RotationDirection};
use crate::error::{DomeError, DomeResult};
use crate::link::{DeviceLink, Property, PropertyElement, PropertyState, PropertyValue};
use crate::properties::names;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Physical behavior of the simulated dome
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimPhysics {
    /// Simulation cycle
    pub step: Duration,
    /// Degrees per second
    pub slew_rate: f64,
    pub shutter_travel: Duration,
    /// Azimuth the device drives to when parking
    pub park_azimuth: Option<f64>,
    /// Azimuth the device's home sensor sits at
    pub home_azimuth: f64,
}

impl Default for SimPhysics {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(50),
            slew_rate: 6.0,
            shutter_travel: Duration::from_secs(2),
            park_azimuth: None,
            home_azimuth: 0.0,
        }
    }
}

/// A command received by the simulator
#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub property: String,
    pub values: Vec<PropertyElement>,
}

impl SentCommand {
    fn switched_on(&self, element: &str) -> bool {
        self.values
            .iter()
            .any(|v| v.name == element && v.value == PropertyValue::Switch(true))
    }

    fn first_number(&self) -> Option<f64> {
        self.values.iter().find_map(|v| match v.value {
            PropertyValue::Number(n) => Some(n),
            _ => None,
        })
    }
}

#[derive(Debug, Default)]
struct Mechanics {
    goal: Option<f64>,
    rotating: Option<RotationDirection>,
    shutter_started: Option<Instant>,
    parking: bool,
    homing: bool,
}

struct SimInner {
    name: String,
    connected: AtomicBool,
    fail_sends: AtomicBool,
    properties: RwLock<HashMap<String, Property>>,
    updates: broadcast::Sender<Property>,
    sent: RwLock<Vec<SentCommand>>,
    mechanics: Mutex<Mechanics>,
}

pub struct SimulatedDome {
    inner: Arc<SimInner>,
    physics: Option<SimPhysics>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedDome {
    /// A dome exposing the standard INDI dome and weather properties
    pub fn new(name: &str) -> Self {
        let properties = standard_properties()
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        Self::with_properties(name, properties)
    }

    /// A dome with no properties at all
    pub fn bare(name: &str) -> Self {
        Self::with_properties(name, HashMap::new())
    }

    fn with_properties(name: &str, properties: HashMap<String, Property>) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SimInner {
                name: name.to_string(),
                connected: AtomicBool::new(false),
                fail_sends: AtomicBool::new(false),
                properties: RwLock::new(properties),
                updates,
                sent: RwLock::new(Vec::new()),
                mechanics: Mutex::new(Mechanics::default()),
            }),
            physics: None,
            task: Mutex::new(None),
        }
    }

    /// Run the physics task while connected
    pub fn with_physics(mut self, physics: SimPhysics) -> Self {
        self.physics = Some(physics);
        self
    }

    /// Store a property without notifying subscribers
    pub async fn set_property(&self, property: Property) {
        self.inner
            .properties
            .write()
            .await
            .insert(property.name.clone(), property);
    }

    /// Store a property and push it to subscribers
    pub async fn push_property(&self, property: Property) {
        self.inner.update(property).await;
    }

    pub async fn remove_property(&self, name: &str) -> Option<Property> {
        self.inner.properties.write().await.remove(name)
    }

    /// Make every following `send_command` fail
    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub async fn sent_commands(&self) -> Vec<SentCommand> {
        self.inner.sent.read().await.clone()
    }

    pub async fn clear_commands(&self) {
        self.inner.sent.write().await.clear();
    }

    /// Commands to `property` that switched `element` on
    pub async fn count_commands(&self, property: &str, element: &str) -> usize {
        self.inner
            .sent
            .read()
            .await
            .iter()
            .filter(|c| c.property == property && c.switched_on(element))
            .count()
    }

    /// Number commands sent to `property`
    pub async fn count_numbers(&self, property: &str) -> usize {
        self.inner
            .sent
            .read()
            .await
            .iter()
            .filter(|c| c.property == property && c.first_number().is_some())
            .count()
    }

    /// Value of the last number command sent to `property`
    pub async fn last_number(&self, property: &str) -> Option<f64> {
        self.inner
            .sent
            .read()
            .await
            .iter()
            .rev()
            .filter(|c| c.property == property)
            .find_map(|c| c.first_number())
    }

    /// Push new weather readings
    pub async fn set_weather(&self, temperature: f64, humidity: f64, wind_speed: f64) {
        self.push_property(Property::numbers(
            names::WEATHER_PARAMETERS,
            &[
                (names::WEATHER_TEMPERATURE, temperature),
                (names::WEATHER_HUMIDITY, humidity),
                (names::WEATHER_WIND_SPEED, wind_speed),
            ],
        ))
        .await;
    }

    pub async fn set_rain(&self, raining: bool) {
        self.push_property(Property::switches(
            names::WEATHER_RAIN,
            &[(names::RAIN_ALERT, raining)],
        ))
        .await;
    }
}

impl Drop for SimulatedDome {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl DeviceLink for SimulatedDome {
    fn device_name(&self) -> &str {
        &self.inner.name
    }

    async fn connect(&self) -> DomeResult<()> {
        self.inner.connected.store(true, Ordering::SeqCst);
        if let Some(physics) = self.physics {
            let mut task = self.task.lock().await;
            if task.is_none() {
                let inner = self.inner.clone();
                *task = Some(tokio::spawn(run_physics(inner, physics)));
            }
        }
        tracing::info!("[{}] Simulated dome connected", self.inner.name);
        Ok(())
    }

    async fn disconnect(&self) -> DomeResult<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        tracing::info!("[{}] Simulated dome disconnected", self.inner.name);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn send_command(&self, property: &str, values: Vec<PropertyElement>) -> DomeResult<()> {
        if !self.is_connected().await {
            return Err(DomeError::NotConnected);
        }
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(DomeError::SendFailed {
                property: property.to_string(),
                message: "simulated send failure".to_string(),
            });
        }

        let command = SentCommand {
            property: property.to_string(),
            values,
        };
        self.inner.sent.write().await.push(command.clone());

        if let Some(physics) = self.physics {
            self.inner.apply(&command, &physics).await;
        }
        Ok(())
    }

    async fn get_property(&self, name: &str) -> Option<Property> {
        self.inner.properties.read().await.get(name).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<Property> {
        self.inner.updates.subscribe()
    }
}

impl SimInner {
    async fn update(&self, property: Property) {
        self.properties
            .write()
            .await
            .insert(property.name.clone(), property.clone());
        let _ = self.updates.send(property);
    }

    async fn property(&self, name: &str) -> Option<Property> {
        self.properties.read().await.get(name).cloned()
    }

    async fn azimuth(&self) -> f64 {
        self.property(names::ABS_DOME_POSITION)
            .await
            .and_then(|p| p.first_number())
            .unwrap_or(0.0)
    }

    async fn set_switches(&self, name: &str, values: &[(&str, bool)], state: PropertyState) {
        self.update(Property::switches(name, values).with_state(state))
            .await;
    }

    async fn set_azimuth(&self, azimuth: f64, state: PropertyState) {
        self.update(
            Property::numbers(
                names::ABS_DOME_POSITION,
                &[(names::DOME_ABSOLUTE_POSITION, azimuth)],
            )
            .with_state(state),
        )
        .await;
    }

    /// React to a command the way a driver would
    async fn apply(&self, command: &SentCommand, physics: &SimPhysics) {
        let on = |element: &str| command.switched_on(element);
        let mut mech = self.mechanics.lock().await;

        match command.property.as_str() {
            names::ABS_DOME_POSITION => {
                if let Some(goal) = command.first_number() {
                    mech.goal = Some(normalize_azimuth(goal));
                    mech.rotating = None;
                    let azimuth = self.azimuth().await;
                    self.set_azimuth(azimuth, PropertyState::Busy).await;
                }
            }
            names::DOME_MOTION => {
                let direction = if on(names::DOME_CW) {
                    Some(RotationDirection::Clockwise)
                } else if on(names::DOME_CCW) {
                    Some(RotationDirection::CounterClockwise)
                } else {
                    None
                };
                mech.rotating = direction;
                mech.goal = None;
                self.set_switches(
                    names::DOME_MOTION,
                    &[
                        (names::DOME_CW, direction == Some(RotationDirection::Clockwise)),
                        (names::DOME_CCW, direction == Some(RotationDirection::CounterClockwise)),
                    ],
                    if direction.is_some() {
                        PropertyState::Busy
                    } else {
                        PropertyState::Ok
                    },
                )
                .await;
            }
            names::DOME_ABORT_MOTION => {
                mech.goal = None;
                mech.rotating = None;
                mech.homing = false;
                let azimuth = self.azimuth().await;
                self.set_azimuth(azimuth, PropertyState::Ok).await;
                self.set_switches(
                    names::DOME_MOTION,
                    &[(names::DOME_CW, false), (names::DOME_CCW, false)],
                    PropertyState::Ok,
                )
                .await;
            }
            names::DOME_SHUTTER => {
                if on(names::SHUTTER_ABORT) {
                    mech.shutter_started = None;
                    self.set_switches(
                        names::DOME_SHUTTER,
                        &[(names::SHUTTER_OPEN, false), (names::SHUTTER_CLOSE, false)],
                        PropertyState::Idle,
                    )
                    .await;
                } else {
                    let open = on(names::SHUTTER_OPEN);
                    mech.shutter_started = Some(Instant::now());
                    self.set_switches(
                        names::DOME_SHUTTER,
                        &[(names::SHUTTER_OPEN, open), (names::SHUTTER_CLOSE, !open)],
                        PropertyState::Busy,
                    )
                    .await;
                }
            }
            names::DOME_PARK => {
                if on(names::PARK) {
                    mech.parking = true;
                    if let Some(park) = physics.park_azimuth {
                        mech.goal = Some(normalize_azimuth(park));
                    }
                    self.set_switches(
                        names::DOME_PARK,
                        &[(names::PARK, true), (names::UNPARK, false)],
                        PropertyState::Busy,
                    )
                    .await;
                } else if on(names::UNPARK) {
                    mech.parking = false;
                    self.set_switches(
                        names::DOME_PARK,
                        &[(names::PARK, false), (names::UNPARK, true)],
                        PropertyState::Ok,
                    )
                    .await;
                }
            }
            names::DOME_HOME => {
                if on(names::HOME_DISCOVER) || on(names::HOME_GOTO) {
                    mech.homing = true;
                    mech.rotating = None;
                    mech.goal = Some(normalize_azimuth(physics.home_azimuth));
                    self.set_switches(
                        names::DOME_HOME,
                        &[
                            (names::HOME_DISCOVER, on(names::HOME_DISCOVER)),
                            (names::HOME_GOTO, on(names::HOME_GOTO)),
                            (names::HOME_SET, false),
                        ],
                        PropertyState::Busy,
                    )
                    .await;
                }
            }
            names::DOME_SYNC => {
                if let Some(azimuth) = command.first_number() {
                    self.set_azimuth(normalize_azimuth(azimuth), PropertyState::Ok)
                        .await;
                }
            }
            _ => {
                // Plain value store for everything else
                if let Some(mut property) = self.property(&command.property).await {
                    for value in &command.values {
                        property.set(&value.name, value.value.clone());
                    }
                    property.state = PropertyState::Ok;
                    self.update(property).await;
                }
            }
        }
    }

    /// Advance the simulation by one cycle
    async fn step(&self, physics: &SimPhysics) {
        let max_delta = physics.slew_rate * physics.step.as_secs_f64();
        let mut mech = self.mechanics.lock().await;

        if let Some(direction) = mech.rotating {
            let delta = match direction {
                RotationDirection::Clockwise => max_delta,
                RotationDirection::CounterClockwise => -max_delta,
            };
            let azimuth = self.azimuth().await;
            self.set_azimuth(normalize_azimuth(azimuth + delta), PropertyState::Busy)
                .await;
        } else if let Some(goal) = mech.goal {
            let azimuth = self.azimuth().await;
            let delta = shortest_path(azimuth, goal);
            if delta.abs() <= max_delta {
                mech.goal = None;
                self.set_azimuth(goal, PropertyState::Ok).await;
            } else {
                self.set_azimuth(
                    normalize_azimuth(azimuth + max_delta.copysign(delta)),
                    PropertyState::Busy,
                )
                .await;
            }
        }

        let at_rest = mech.goal.is_none() && mech.rotating.is_none();
        if at_rest && mech.parking {
            mech.parking = false;
            self.set_switches(
                names::DOME_PARK,
                &[(names::PARK, true), (names::UNPARK, false)],
                PropertyState::Ok,
            )
            .await;
        }
        if at_rest && mech.homing {
            mech.homing = false;
            self.set_switches(
                names::DOME_HOME,
                &[
                    (names::HOME_DISCOVER, false),
                    (names::HOME_GOTO, false),
                    (names::HOME_SET, false),
                ],
                PropertyState::Ok,
            )
            .await;
        }

        if let Some(started) = mech.shutter_started {
            if started.elapsed() >= physics.shutter_travel {
                mech.shutter_started = None;
                if let Some(mut shutter) = self.property(names::DOME_SHUTTER).await {
                    shutter.state = PropertyState::Ok;
                    self.update(shutter).await;
                }
            }
        }
    }
}

async fn run_physics(inner: Arc<SimInner>, physics: SimPhysics) {
    let mut ticker = tokio::time::interval(physics.step);
    loop {
        ticker.tick().await;
        inner.step(&physics).await;
    }
}

fn standard_properties() -> Vec<Property> {
    vec![
        Property::numbers(
            names::ABS_DOME_POSITION,
            &[(names::DOME_ABSOLUTE_POSITION, 0.0)],
        ),
        Property::switches(
            names::DOME_MOTION,
            &[(names::DOME_CW, false), (names::DOME_CCW, false)],
        )
        .with_state(PropertyState::Idle),
        Property::switches(names::DOME_ABORT_MOTION, &[(names::ABORT, false)])
            .with_state(PropertyState::Idle),
        Property::numbers(names::DOME_SPEED, &[(names::DOME_SPEED_VALUE, 5.0)]),
        Property::numbers(names::DOME_SYNC, &[(names::DOME_SYNC_VALUE, 0.0)])
            .with_state(PropertyState::Idle),
        Property::switches(
            names::DOME_SHUTTER,
            &[(names::SHUTTER_OPEN, false), (names::SHUTTER_CLOSE, true)],
        ),
        Property::switches(names::DOME_PARK, &[(names::PARK, false), (names::UNPARK, true)]),
        Property::switches(
            names::DOME_HOME,
            &[
                (names::HOME_DISCOVER, false),
                (names::HOME_GOTO, false),
                (names::HOME_SET, false),
            ],
        )
        .with_state(PropertyState::Idle),
        Property::numbers(
            names::WEATHER_PARAMETERS,
            &[
                (names::WEATHER_TEMPERATURE, 15.0),
                (names::WEATHER_HUMIDITY, 40.0),
                (names::WEATHER_WIND_SPEED, 2.0),
            ],
        ),
        Property::lights(
            names::WEATHER_STATUS,
            &[
                ("WEATHER_RAIN", PropertyState::Ok),
                ("WEATHER_WIND", PropertyState::Ok),
            ],
        ),
        Property::switches(names::WEATHER_RAIN, &[(names::RAIN_ALERT, false)]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_commands_without_physics() {
        let sim = SimulatedDome::new("Dome Simulator");
        assert_eq!(
            sim.send_command(names::DOME_SHUTTER, vec![PropertyElement::switch(names::SHUTTER_OPEN, true)])
                .await,
            Err(DomeError::NotConnected)
        );

        sim.connect().await.unwrap();
        sim.send_command(names::DOME_SHUTTER, vec![PropertyElement::switch(names::SHUTTER_OPEN, true)])
            .await
            .unwrap();
        assert_eq!(sim.count_commands(names::DOME_SHUTTER, names::SHUTTER_OPEN).await, 1);

        // Device state is untouched
        let shutter = sim.get_property(names::DOME_SHUTTER).await.unwrap();
        assert_eq!(shutter.switch(names::SHUTTER_CLOSE), Some(true));

        sim.fail_sends(true);
        assert!(matches!(
            sim.send_command(names::DOME_SHUTTER, vec![]).await,
            Err(DomeError::SendFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_physics_slew() {
        let sim = SimulatedDome::new("Dome Simulator").with_physics(SimPhysics {
            step: Duration::from_millis(10),
            slew_rate: 1000.0,
            ..SimPhysics::default()
        });
        let mut updates = sim.subscribe();
        sim.connect().await.unwrap();

        sim.send_command(
            names::ABS_DOME_POSITION,
            vec![PropertyElement::number(names::DOME_ABSOLUTE_POSITION, 350.0)],
        )
        .await
        .unwrap();

        let settled = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let p = updates.recv().await.unwrap();
                if p.name == names::ABS_DOME_POSITION && p.state == PropertyState::Ok {
                    return p.first_number();
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(settled, Some(350.0));
        sim.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_physics_shutter_travel() {
        let sim = SimulatedDome::new("Dome Simulator").with_physics(SimPhysics {
            step: Duration::from_millis(10),
            shutter_travel: Duration::from_millis(50),
            ..SimPhysics::default()
        });
        sim.connect().await.unwrap();

        sim.send_command(names::DOME_SHUTTER, vec![PropertyElement::switch(names::SHUTTER_OPEN, true)])
            .await
            .unwrap();
        let shutter = sim.get_property(names::DOME_SHUTTER).await.unwrap();
        assert!(shutter.is_busy());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let shutter = sim.get_property(names::DOME_SHUTTER).await.unwrap();
        assert_eq!(shutter.state, PropertyState::Ok);
        assert_eq!(shutter.switch(names::SHUTTER_OPEN), Some(true));
    }

    #[tokio::test]
    async fn test_weather_helpers_push_updates() {
        let sim = SimulatedDome::new("Dome Simulator");
        let mut updates = sim.subscribe();

        sim.set_weather(5.0, 90.0, 12.0).await;
        sim.set_rain(true).await;

        let params = updates.recv().await.unwrap();
        assert_eq!(params.number(names::WEATHER_HUMIDITY), Some(90.0));
        let rain = updates.recv().await.unwrap();
        assert_eq!(rain.switch(names::RAIN_ALERT), Some(true));
        assert_eq!(
            sim.get_property(names::WEATHER_PARAMETERS).await.unwrap().number(names::WEATHER_WIND_SPEED),
            Some(12.0)
        );
    }
}
