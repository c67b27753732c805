//! Account-wide duration settings consumed by the climate and steering wheel
//! commands. Setting them is local; nothing is sent to the vehicle. They are
//! saved with the request stats and restored on the next start.

use serde_json::json;

use super::{EntityState, Platform};
use crate::car::config::MAX_OPERATION_MINUTES;
use crate::car::error::CommandError;
use crate::car::task::{ActuatorSettings, ChangeReason, Coordinator, StateChanged};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberKind {
    AcDuration,
    SteeringWheelDuration,
}

impl NumberKind {
    pub const ALL: [NumberKind; 2] = [NumberKind::AcDuration, NumberKind::SteeringWheelDuration];

    pub fn key(&self) -> &'static str {
        match self {
            NumberKind::AcDuration => "ac_duration",
            NumberKind::SteeringWheelDuration => "steering_wheel_duration",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NumberKind::AcDuration => "AC Operation Duration",
            NumberKind::SteeringWheelDuration => "Steering Wheel Heat Duration",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }

    fn get(&self, settings: &ActuatorSettings) -> u8 {
        match self {
            NumberKind::AcDuration => settings.ac_duration,
            NumberKind::SteeringWheelDuration => settings.steering_wheel_duration,
        }
    }

    fn slot<'a>(&self, settings: &'a mut ActuatorSettings) -> &'a mut u8 {
        match self {
            NumberKind::AcDuration => &mut settings.ac_duration,
            NumberKind::SteeringWheelDuration => &mut settings.steering_wheel_duration,
        }
    }

    pub fn render(&self, settings: &ActuatorSettings) -> EntityState {
        EntityState::new(
            Platform::Number,
            self.key(),
            self.label().to_string(),
            json!(self.get(settings)),
        )
        .with_attribute("min", 0)
        .with_attribute("max", MAX_OPERATION_MINUTES)
        .with_attribute("step", 1)
        .with_attribute("unit_of_measurement", "min")
    }
}

/// Whole minutes in `0..=15`.
pub fn validate(value: f64) -> Result<u8, CommandError> {
    if !value.is_finite() || value.fract() != 0.0 || value < 0.0 || value > MAX_OPERATION_MINUTES as f64 {
        return Err(CommandError::InvalidValue(format!(
            "{} is not a whole number of minutes between 0 and {}",
            value, MAX_OPERATION_MINUTES
        )));
    }
    Ok(value as u8)
}

pub async fn render_all(coordinator: &Coordinator) -> Vec<EntityState> {
    let settings = coordinator.settings().await;
    NumberKind::ALL
        .iter()
        .map(|kind| kind.render(&settings))
        .collect()
}

pub async fn set(
    coordinator: &Coordinator,
    kind: NumberKind,
    value: f64,
) -> Result<EntityState, CommandError> {
    let minutes = validate(value)?;
    let settings = coordinator
        .update_settings(|settings| *kind.slot(settings) = minutes)
        .await;
    log::info!("{} set to {} minutes", kind.key(), minutes);
    coordinator.notify(StateChanged::account(kind.key(), ChangeReason::Setting));
    Ok(kind.render(&settings))
}
