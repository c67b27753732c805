//! Cabin pre-conditioning, as a climate entity with two modes.

use std::sync::Arc;

use serde_json::json;

use super::{dispatch_with, display_name, CommandContext, EntityState, Platform, RenderContext};
use crate::car::dispatch::{Command, DispatchOutcome, FollowUp, RemoteCall};
use crate::car::error::CommandError;
use crate::car::fields::{paths, read_number};
use crate::car::task::Coordinator;
use crate::car::RemoteControl;

pub const KEY: &str = "climate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacMode {
    HeatCool,
    Off,
}

impl HvacMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HvacMode::HeatCool => "heat_cool",
            HvacMode::Off => "off",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "heat_cool" => Some(HvacMode::HeatCool),
            "off" => Some(HvacMode::Off),
            _ => None,
        }
    }
}

pub fn render(ctx: &RenderContext<'_>) -> EntityState {
    let state = EntityState::from_reading(
        Platform::Climate,
        KEY,
        display_name(ctx.vin, "Climate"),
        ctx.fields.climate.read(ctx.status),
        |active| {
            let mode = if active { HvacMode::HeatCool } else { HvacMode::Off };
            json!(mode.as_str())
        },
    );
    match read_number(ctx.status, &paths::INTERIOR_TEMP.into()).known() {
        Some(temperature) => state.with_attribute("current_temperature", temperature),
        None => state,
    }
}

/// Both modes start the ZAF service; turning off is `AC=false`.
pub fn command(mode: HvacMode, ctx: &CommandContext<'_>) -> Command {
    let active = mode == HvacMode::HeatCool;
    let control = if active {
        RemoteControl::start("ZAF")
            .param("AC", "true")
            .param("AC.duration", ctx.settings.ac_duration.to_string())
    } else {
        RemoteControl::start("ZAF").param("AC", "false")
    };
    Command {
        entity: KEY.to_string(),
        call: RemoteCall::Control(control),
        optimistic: ctx.fields.climate.patch(active),
        follow_up: FollowUp::RefreshAfter(ctx.config.settle_delay()),
    }
}

pub async fn set_mode(
    coordinator: &Arc<Coordinator>,
    vin: &str,
    mode: HvacMode,
) -> Result<DispatchOutcome, CommandError> {
    dispatch_with(coordinator, vin, |ctx| Ok(command(mode, ctx))).await
}
