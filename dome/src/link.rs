//! Device link abstraction
//!
//! The dome core never speaks a wire protocol itself. It reads cached
//! properties, sends property commands, and receives property updates
//! through a [`DeviceLink`]. INDI, Alpaca or a simulator all fit behind it.

use crate::error::DomeResult;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Property state as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

/// Value of a single property element
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PropertyValue {
    Number(f64),
    Switch(bool),
    Text(String),
    Light(PropertyState),
}

/// A named element inside a property vector
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PropertyElement {
    pub name: String,
    pub value: PropertyValue,
}

impl PropertyElement {
    pub fn number(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value: PropertyValue::Number(value),
        }
    }

    pub fn switch(name: &str, on: bool) -> Self {
        Self {
            name: name.to_string(),
            value: PropertyValue::Switch(on),
        }
    }

    pub fn light(name: &str, state: PropertyState) -> Self {
        Self {
            name: name.to_string(),
            value: PropertyValue::Light(state),
        }
    }
}

/// A device property: a named vector of elements plus its state
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Property {
    pub name: String,
    pub state: PropertyState,
    pub elements: Vec<PropertyElement>,
}

impl Property {
    /// Create an empty property in the `Idle` state
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: PropertyState::Idle,
            elements: Vec::new(),
        }
    }

    /// Build a number vector property
    pub fn numbers(name: &str, values: &[(&str, f64)]) -> Self {
        let mut property = Self::new(name);
        property.state = PropertyState::Ok;
        property.elements = values
            .iter()
            .map(|(element, value)| PropertyElement::number(element, *value))
            .collect();
        property
    }

    /// Build a switch vector property
    pub fn switches(name: &str, values: &[(&str, bool)]) -> Self {
        let mut property = Self::new(name);
        property.state = PropertyState::Ok;
        property.elements = values
            .iter()
            .map(|(element, on)| PropertyElement::switch(element, *on))
            .collect();
        property
    }

    /// Build a light vector property
    pub fn lights(name: &str, values: &[(&str, PropertyState)]) -> Self {
        let mut property = Self::new(name);
        property.state = PropertyState::Ok;
        property.elements = values
            .iter()
            .map(|(element, state)| PropertyElement::light(element, *state))
            .collect();
        property
    }

    /// Replace the property state
    pub fn with_state(mut self, state: PropertyState) -> Self {
        self.state = state;
        self
    }

    pub fn element(&self, name: &str) -> Option<&PropertyElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn has_element(&self, name: &str) -> bool {
        self.element(name).is_some()
    }

    pub fn number(&self, element: &str) -> Option<f64> {
        match self.element(element)?.value {
            PropertyValue::Number(v) => Some(v),
            _ => None,
        }
    }

    /// First number element, for single-value vectors whose element name varies by driver
    pub fn first_number(&self) -> Option<f64> {
        self.elements.iter().find_map(|e| match e.value {
            PropertyValue::Number(v) => Some(v),
            _ => None,
        })
    }

    pub fn switch(&self, element: &str) -> Option<bool> {
        match self.element(element)?.value {
            PropertyValue::Switch(on) => Some(on),
            _ => None,
        }
    }

    pub fn light(&self, element: &str) -> Option<PropertyState> {
        match self.element(element)?.value {
            PropertyValue::Light(state) => Some(state),
            _ => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state == PropertyState::Busy
    }

    /// Set or insert an element value
    pub fn set(&mut self, element: &str, value: PropertyValue) {
        match self.elements.iter_mut().find(|e| e.name == element) {
            Some(existing) => existing.value = value,
            None => self.elements.push(PropertyElement {
                name: element.to_string(),
                value,
            }),
        }
    }
}

/// The narrow interface between the dome core and a device
///
/// Only the coordinator calls `connect`/`disconnect`; controllers only send
/// commands and read properties.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Name of the device behind this link
    fn device_name(&self) -> &str;

    /// Establish the connection
    async fn connect(&self) -> DomeResult<()>;

    /// Tear down the connection
    async fn disconnect(&self) -> DomeResult<()>;

    /// Check if connected
    async fn is_connected(&self) -> bool;

    /// Send new element values for a property.
    ///
    /// Fire-and-forget: `Ok` means the command left, not that the device
    /// reached the requested state. Confirmation arrives as a property update.
    async fn send_command(&self, property: &str, values: Vec<PropertyElement>) -> DomeResult<()>;

    /// Read the current cached value of a property
    async fn get_property(&self, name: &str) -> Option<Property>;

    /// Subscribe to property updates pushed by the device
    fn subscribe(&self) -> broadcast::Receiver<Property>;
}
