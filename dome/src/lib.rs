//! Dome coordination core
//!
//! Keeps a local model of an observatory dome in step with the device
//! behind a [`DeviceLink`] and issues commands on the caller's behalf.
//!
//! ## Components
//!
//! - [`MotionController`]: azimuth, rotation, limits, backlash, presets
//! - [`ShutterController`]: shutter state machine and open preconditions
//! - [`ParkingController`]: park/unpark and the park position
//! - [`WeatherMonitor`]: weather limits and automatic shutter closing
//! - [`TelescopeCoordinator`]: dome azimuth for a telescope pointing, following
//! - [`HomeManager`]: home discovery and go-to-home
//! - [`DomeCoordinator`]: owns all of the above and runs the monitor task
//!
//! [`SimulatedDome`] is an in-memory link for tests and development.

pub mod angle;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod home;
pub mod link;
pub mod logging;
pub mod motion;
pub mod parking;
pub mod properties;
pub mod shutter;
pub mod sim;
pub mod telescope;
pub mod weather;

pub use angle::{normalize_azimuth, shortest_path, RotationDirection};
pub use config::{AzimuthLimits, DomeConfig, HomeConfig, MotionConfig, TelescopeConfig, WeatherConfig};
pub use coordinator::{DomeCoordinator, DomeStatus};
pub use error::{DomeError, DomeResult, ErrorKind};
pub use events::{
    DomeEvent, HandlerId, HomeEvent, MotionEvent, ParkingEvent, ShutterEvent, TelescopeEvent,
    WeatherEvent,
};
pub use home::HomeManager;
pub use link::{DeviceLink, Property, PropertyElement, PropertyState, PropertyValue};
pub use logging::init_tracing;
pub use motion::{MotionController, MotionStatistics};
pub use parking::{ParkStatus, ParkingController};
pub use shutter::{ShutterController, ShutterState};
pub use sim::{SimPhysics, SimulatedDome};
pub use telescope::{calculate_dome_azimuth, DomeGeometry, TelescopeCoordinator};
pub use weather::{WeatherCondition, WeatherLimits, WeatherMonitor, WeatherReadings};
