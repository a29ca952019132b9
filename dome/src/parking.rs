//! Parking controller

use crate::angle::normalize_azimuth;
use crate::coordinator::DomeCore;
use crate::error::{DomeError, DomeResult};
use crate::events::{DomeEvent, ParkingEvent};
use crate::link::{Property, PropertyState};
use crate::properties::{names, PropertyRole};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// Park status. A single value, so the dome can never be parked and parking at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParkStatus {
    #[default]
    Unparked,
    Parking,
    Parked,
}

#[derive(Debug, Default)]
struct ParkState {
    status: ParkStatus,
    park_position: Option<f64>,
}

pub struct ParkingController {
    core: Weak<DomeCore>,
    state: RwLock<ParkState>,
}

impl ParkingController {
    pub(crate) fn new(core: Weak<DomeCore>, park_position: Option<f64>) -> Self {
        Self {
            core,
            state: RwLock::new(ParkState {
                status: ParkStatus::Unparked,
                park_position: park_position.map(normalize_azimuth),
            }),
        }
    }

    fn core(&self) -> DomeResult<Arc<DomeCore>> {
        self.core.upgrade().ok_or(DomeError::CoordinatorDropped)
    }

    pub async fn status(&self) -> ParkStatus {
        self.state.read().await.status
    }

    pub async fn is_parked(&self) -> bool {
        self.status().await == ParkStatus::Parked
    }

    pub async fn is_parking(&self) -> bool {
        self.status().await == ParkStatus::Parking
    }

    pub async fn park_position(&self) -> Option<f64> {
        self.state.read().await.park_position
    }

    pub async fn set_park_position(&self, azimuth: f64) -> DomeResult<()> {
        if !azimuth.is_finite() {
            return Err(DomeError::InvalidParameter(format!(
                "park position {} is not a valid azimuth",
                azimuth
            )));
        }
        let azimuth = normalize_azimuth(azimuth);
        self.state.write().await.park_position = Some(azimuth);
        tracing::info!("Park position set to {:.2}°", azimuth);
        Ok(())
    }

    pub async fn clear_park_position(&self) {
        self.state.write().await.park_position = None;
    }

    /// Park the dome.
    ///
    /// With a park position configured the dome is also sent there; a failed
    /// move is logged and does not fail the park.
    pub async fn park(&self) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.start_park(&core).await;
        core.logged(result, "Park")
    }

    async fn start_park(&self, core: &DomeCore) -> DomeResult<()> {
        core.ensure_connected().await?;

        let status = self.status().await;
        if status != ParkStatus::Unparked {
            tracing::debug!("[{}] Dome already {:?}", core.device(), status);
            return Ok(());
        }

        let park = core.require(PropertyRole::Park).await?;
        let element = park.element.as_deref().unwrap_or(names::PARK);
        tracing::info!("[{}] Parking dome", core.device());
        self.command(core, &park.property, element, ParkStatus::Parking)
            .await?;

        if let Some(position) = self.park_position().await {
            if let Err(e) = core.motion.move_to(core, position).await {
                e.log(core.device(), "Move to park position");
            }
        }
        Ok(())
    }

    /// Unpark the dome. Also cancels a park in progress.
    pub async fn unpark(&self) -> DomeResult<()> {
        let core = self.core()?;
        let result = self.start_unpark(&core).await;
        core.logged(result, "Unpark")
    }

    async fn start_unpark(&self, core: &DomeCore) -> DomeResult<()> {
        core.ensure_connected().await?;

        if self.status().await == ParkStatus::Unparked {
            tracing::debug!("[{}] Dome not parked", core.device());
            return Ok(());
        }

        let park = core.require(PropertyRole::Park).await?;
        tracing::info!("[{}] Unparking dome", core.device());
        self.command(core, &park.property, names::UNPARK, ParkStatus::Unparked)
            .await
    }

    /// Record `expected` and send the command.
    ///
    /// The event fires once the command is out. A failed send quietly
    /// restores the previous status unless a device update replaced it
    /// meanwhile.
    async fn command(
        &self,
        core: &DomeCore,
        property: &str,
        element: &str,
        expected: ParkStatus,
    ) -> DomeResult<()> {
        let previous = std::mem::replace(&mut self.state.write().await.status, expected);

        let sent = core.send_switch(property, element).await;
        let pending = {
            let mut state = self.state.write().await;
            let pending = state.status == expected;
            if pending && sent.is_err() {
                state.status = previous;
            }
            pending
        };
        sent?;

        if pending && previous != expected {
            core.emit(park_event(expected)).await;
        }
        Ok(())
    }

    /// Apply a device update for the park property
    pub(crate) async fn handle_property(&self, property: &Property) -> DomeResult<()> {
        let core = self.core()?;

        if property.state == PropertyState::Alert {
            tracing::warn!("[{}] Park property reported alert", core.device());
            return Ok(());
        }

        let park_element = core
            .properties
            .read()
            .await
            .element_or(PropertyRole::Park, names::PARK)
            .to_string();

        let new_status = if property.switch(&park_element) == Some(true) {
            if property.is_busy() {
                ParkStatus::Parking
            } else {
                ParkStatus::Parked
            }
        } else if property.switch(names::UNPARK) == Some(true) {
            ParkStatus::Unparked
        } else {
            return Ok(());
        };

        self.transition(&core, new_status).await;
        Ok(())
    }

    async fn transition(&self, core: &DomeCore, new_status: ParkStatus) {
        {
            let mut state = self.state.write().await;
            if state.status == new_status {
                return;
            }
            tracing::debug!(
                "[{}] Park {:?} -> {:?}",
                core.device(),
                state.status,
                new_status
            );
            state.status = new_status;
        }
        core.emit(park_event(new_status)).await;
    }
}

fn park_event(status: ParkStatus) -> DomeEvent {
    DomeEvent::Parking(ParkingEvent {
        parked: status == ParkStatus::Parked,
        parking: status == ParkStatus::Parking,
    })
}
