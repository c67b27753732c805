//! The entities exposed for every vehicle.
//!
//! Each platform module owns a `*Kind` enum listing its entities, how each one
//! renders from a [VehicleStatus], and the command table turning a user action
//! into a [Command] for [Coordinator::dispatch]. Reading never talks to the
//! backend; all state comes from the coordinator's documents.

use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::config::CoordinatorConfig;
use super::dispatch::{Command, DispatchOutcome};
use super::error::CommandError;
use super::fields::{FieldTable, Reading};
use super::status::VehicleStatus;
use super::task::{ActuatorSettings, Coordinator};

pub mod button;
pub mod climate;
pub mod cover;
pub mod number;
pub mod sensor;
pub mod switch;
pub mod time;

pub const UNKNOWN: &str = "unknown";
pub const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Switch,
    Button,
    Cover,
    Climate,
    Time,
    Number,
    Sensor,
}

/// One rendered entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub platform: Platform,
    pub key: &'static str,
    pub name: String,
    pub state: Value,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn new(platform: Platform, key: &'static str, name: String, state: Value) -> Self {
        Self {
            platform,
            key,
            name,
            state,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Render a reading: known values go through `known`, anything else is
    /// `unknown`, keeping the raw value of an unrecognized one around.
    pub fn from_reading<T>(
        platform: Platform,
        key: &'static str,
        name: String,
        reading: Reading<T>,
        known: impl FnOnce(T) -> Value,
    ) -> Self {
        match reading {
            Reading::Known(value) => Self::new(platform, key, name, known(value)),
            Reading::Unrecognized(raw) => {
                Self::new(platform, key, name, json!(UNKNOWN)).with_attribute("raw_value", raw)
            }
            Reading::Missing => Self::new(platform, key, name, json!(UNKNOWN)),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.state == json!(UNKNOWN)
    }
}

/// `on`/`off` for a binary reading.
pub fn on_off(on: bool) -> Value {
    json!(if on { "on" } else { "off" })
}

/// "Zeekr 1234 Charging", named after the last four VIN characters.
pub fn display_name(vin: &str, label: &str) -> String {
    let chars: Vec<char> = vin.chars().collect();
    let suffix: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("Zeekr {} {}", suffix, label)
}

/// Everything the entities of one vehicle render from.
pub struct RenderContext<'a> {
    pub vin: &'a str,
    pub status: &'a VehicleStatus,
    pub fields: &'a FieldTable,
    pub latest_poll_time: Option<DateTime<Utc>>,
}

/// Everything a command table reads to build its [Command].
pub struct CommandContext<'a> {
    pub status: &'a VehicleStatus,
    pub fields: &'a FieldTable,
    pub config: &'a CoordinatorConfig,
    pub settings: ActuatorSettings,
    pub now: DateTime<Local>,
}

/// Render every entity of a vehicle. A vehicle that never reported anything
/// is `unavailable` across the board.
pub fn render_vehicle(ctx: &RenderContext<'_>) -> Vec<EntityState> {
    let mut states: Vec<EntityState> = Vec::new();
    states.extend(switch::SwitchKind::ALL.iter().map(|kind| kind.render(ctx)));
    states.extend(button::ButtonKind::ALL.iter().map(|kind| kind.render(ctx)));
    states.push(cover::render(ctx));
    states.push(climate::render(ctx));
    states.extend(time::TimeKind::ALL.iter().map(|kind| kind.render(ctx)));
    states.extend(sensor::SensorKind::ALL.iter().map(|kind| kind.render(ctx)));

    if ctx.status.is_empty() {
        for state in &mut states {
            state.state = json!(UNAVAILABLE);
        }
    }
    states
}

/// Render a vehicle from the coordinator's current document.
pub async fn render(coordinator: &Coordinator, vin: &str) -> Option<Vec<EntityState>> {
    let status = coordinator.snapshot(vin).await?;
    let ctx = RenderContext {
        vin,
        status: &status,
        fields: coordinator.fields(),
        latest_poll_time: coordinator.latest_poll_time().await,
    };
    Some(render_vehicle(&ctx))
}

/// Build a command from the vehicle's current document and dispatch it.
/// Unknown vehicles are skipped before anything is validated.
pub(crate) async fn dispatch_with<F>(
    coordinator: &Arc<Coordinator>,
    vin: &str,
    build: F,
) -> Result<DispatchOutcome, CommandError>
where
    F: FnOnce(&CommandContext<'_>) -> Result<Command, CommandError>,
{
    let Some(status) = coordinator.snapshot(vin).await else {
        log::warn!("Ignoring command for unknown vehicle {}", vin);
        return Ok(DispatchOutcome::Skipped);
    };
    let ctx = CommandContext {
        status: &status,
        fields: coordinator.fields(),
        config: coordinator.config(),
        settings: coordinator.settings().await,
        now: Local::now(),
    };
    let command = build(&ctx)?;
    coordinator.dispatch(vin, command).await
}
