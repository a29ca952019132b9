//! Dome events and the single dispatch point
//!
//! Each controller has its own event type. All of them flow through one
//! [`EventDispatcher`] owned by the coordinator, which calls registered
//! handlers and then publishes the event on a broadcast channel for
//! subscribers (UI, logging).
//!
//! Handlers run outside every controller lock. A panicking handler is
//! caught and logged; it never reaches the device-event path.

use crate::shutter::ShutterState;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Default event buffer size for the broadcast channel
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// Motion controller event: position or moving flag changed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    pub current_azimuth: f64,
    pub target_azimuth: f64,
    pub moving: bool,
}

/// Shutter controller event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutterEvent {
    pub state: ShutterState,
}

/// Parking controller event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingEvent {
    pub parked: bool,
    pub parking: bool,
}

/// Weather monitor event, fired only on safe/unsafe transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherEvent {
    pub safe: bool,
    pub details: String,
}

/// Telescope coordinator event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelescopeEvent {
    pub telescope_azimuth: f64,
    pub telescope_altitude: f64,
    pub dome_azimuth: f64,
}

/// Home manager event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomeEvent {
    pub home_found: bool,
    pub home_position: Option<f64>,
}

/// Any event produced by the dome core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomeEvent {
    Connection { connected: bool },
    Motion(MotionEvent),
    Shutter(ShutterEvent),
    Parking(ParkingEvent),
    Weather(WeatherEvent),
    Telescope(TelescopeEvent),
    Home(HomeEvent),
}

/// Identifier returned by [`EventDispatcher::on_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&DomeEvent) + Send + Sync>;

/// Single dispatch point for dome events
pub struct EventDispatcher {
    handlers: RwLock<Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<DomeEvent>,
}

impl EventDispatcher {
    pub fn new(buffer_size: usize) -> Self {
        let (event_tx, _) = broadcast::channel(buffer_size.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Register a handler invoked for every event
    pub async fn on_event<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&DomeEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().await.push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub async fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<DomeEvent> {
        self.event_tx.subscribe()
    }

    /// Dispatch an event to handlers and subscribers
    pub async fn emit(&self, event: DomeEvent) {
        // Snapshot so handlers run without the registry lock held
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .await
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                tracing::error!(
                    "Dome event handler panicked on {:?}: {}",
                    event,
                    panic_message(&payload)
                );
            }
        }

        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
