//! Momentary actions.

use std::sync::Arc;

use serde_json::json;

use super::{dispatch_with, display_name, CommandContext, EntityState, Platform, RenderContext, UNKNOWN};
use crate::car::dispatch::{Command, DispatchOutcome, FollowUp, RemoteCall};
use crate::car::error::CommandError;
use crate::car::status::StatusPatch;
use crate::car::task::Coordinator;
use crate::car::RemoteControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonKind {
    FlashBlinkers,
    DisableParkingComfort,
    PollVehicleData,
}

impl ButtonKind {
    pub const ALL: [ButtonKind; 3] = [
        ButtonKind::FlashBlinkers,
        ButtonKind::DisableParkingComfort,
        ButtonKind::PollVehicleData,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ButtonKind::FlashBlinkers => "flash_blinkers",
            ButtonKind::DisableParkingComfort => "disable_parking_comfort",
            ButtonKind::PollVehicleData => "poll_vehicle_data",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ButtonKind::FlashBlinkers => "Flash Blinkers",
            ButtonKind::DisableParkingComfort => "Disable Parking Comfort",
            ButtonKind::PollVehicleData => "Poll Vehicle Data",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }

    /// Buttons have no state of their own; the poll button shows when it was
    /// last pressed.
    pub fn render(&self, ctx: &RenderContext<'_>) -> EntityState {
        let state = match (self, ctx.latest_poll_time) {
            (ButtonKind::PollVehicleData, Some(at)) => json!(at.to_rfc3339()),
            _ => json!(UNKNOWN),
        };
        EntityState::new(
            Platform::Button,
            self.key(),
            display_name(ctx.vin, self.label()),
            state,
        )
    }

    /// `None` for the buttons that do not send anything.
    pub fn command(&self, ctx: &CommandContext<'_>) -> Option<Command> {
        let (control, follow_up) = match self {
            ButtonKind::FlashBlinkers => (
                RemoteControl::start("RHL").param("rhl", "light-flash"),
                FollowUp::None,
            ),
            ButtonKind::DisableParkingComfort => (
                RemoteControl::stop("RSM").param("rsm", "4"),
                FollowUp::RefreshAfter(ctx.config.plan_settle_delay()),
            ),
            ButtonKind::PollVehicleData => return None,
        };
        Some(Command {
            entity: self.key().to_string(),
            call: RemoteCall::Control(control),
            optimistic: StatusPatch::new(),
            follow_up,
        })
    }
}

pub async fn press(
    coordinator: &Arc<Coordinator>,
    vin: &str,
    kind: ButtonKind,
) -> Result<DispatchOutcome, CommandError> {
    if kind == ButtonKind::PollVehicleData {
        if coordinator.get_vehicle(vin).is_none() {
            log::warn!("Ignoring {} for unknown vehicle {}", kind.key(), vin);
            return Ok(DispatchOutcome::Skipped);
        }
        let report = coordinator.request_poll().await?;
        log::info!(
            "Polled vehicle data: {} updated, {} failed",
            report.updated.len(),
            report.failed.len()
        );
        return Ok(DispatchOutcome::Applied);
    }
    dispatch_with(coordinator, vin, |ctx| {
        kind.command(ctx)
            .ok_or_else(|| CommandError::InvalidValue(kind.key().to_string()))
    })
    .await
}
