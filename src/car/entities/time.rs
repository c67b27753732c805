//! Times of day: the charge plan window and the travel plan departure.

use std::sync::Arc;

use chrono::NaiveTime;
use serde_json::{json, Value};

use super::switch::{charge_plan_request, plan_command, travel_plan_request};
use super::{dispatch_with, display_name, CommandContext, EntityState, Platform, RenderContext};
use crate::car::dispatch::{Command, DispatchOutcome, RemoteCall};
use crate::car::error::CommandError;
use crate::car::fields::{format_time_of_day, parse_time_of_day, paths, read_time, read_travel_departure};
use crate::car::status::{StatusPatch, StatusPath};
use crate::car::task::Coordinator;
use crate::car::CommandVerb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeKind {
    ChargePlanStart,
    ChargePlanEnd,
    TravelDeparture,
}

impl TimeKind {
    pub const ALL: [TimeKind; 3] = [
        TimeKind::ChargePlanStart,
        TimeKind::ChargePlanEnd,
        TimeKind::TravelDeparture,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            TimeKind::ChargePlanStart => "charge_plan_start",
            TimeKind::ChargePlanEnd => "charge_plan_end",
            TimeKind::TravelDeparture => "travel_departure",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeKind::ChargePlanStart => "Charge Plan Start",
            TimeKind::ChargePlanEnd => "Charge Plan End",
            TimeKind::TravelDeparture => "Travel Departure",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> EntityState {
        let reading = match self {
            TimeKind::ChargePlanStart => read_time(ctx.status, &paths::CHARGE_PLAN_START.into()),
            TimeKind::ChargePlanEnd => read_time(ctx.status, &paths::CHARGE_PLAN_END.into()),
            TimeKind::TravelDeparture => read_travel_departure(ctx.status),
        };
        EntityState::from_reading(
            Platform::Time,
            self.key(),
            display_name(ctx.vin, self.label()),
            reading,
            |time| json!(format_time_of_day(&time)),
        )
    }

    /// Only the changed time is patched; the rest of the plan is sent back
    /// as it currently is.
    pub fn command(&self, time: NaiveTime, ctx: &CommandContext<'_>) -> Result<Command, CommandError> {
        let value = format_time_of_day(&time);
        match self {
            TimeKind::ChargePlanStart | TimeKind::ChargePlanEnd => {
                let current = ctx.status.get_str(&paths::CHARGE_PLAN_COMMAND.into());
                let verb = CommandVerb::from_plan_command(current.as_deref());
                let (request, path) = if *self == TimeKind::ChargePlanStart {
                    (
                        charge_plan_request(ctx.status, Some(value.clone()), None, verb),
                        paths::CHARGE_PLAN_START,
                    )
                } else {
                    (
                        charge_plan_request(ctx.status, None, Some(value.clone()), verb),
                        paths::CHARGE_PLAN_END,
                    )
                };
                Ok(plan_command(
                    self.key(),
                    RemoteCall::ChargePlan(request),
                    StatusPatch::new().set(path.into(), value),
                    ctx,
                ))
            }
            TimeKind::TravelDeparture => {
                let current = ctx.status.get_str(&paths::TRAVEL_PLAN_COMMAND.into());
                let verb = CommandVerb::from_plan_command(current.as_deref());
                let mut request = travel_plan_request(ctx.status, verb, &value, &ctx.now)?;
                let mut optimistic =
                    StatusPatch::new().set(paths::TRAVEL_PLAN_START.into(), value.clone());
                if let Some(Value::Object(first)) = request.schedule_list.first_mut() {
                    first.insert("startTime".to_string(), json!(value));
                    optimistic = optimistic.set(
                        StatusPath::parse(paths::TRAVEL_PLAN_SCHEDULE),
                        Value::Array(request.schedule_list.clone()),
                    );
                }
                Ok(plan_command(
                    self.key(),
                    RemoteCall::TravelPlan(request),
                    optimistic,
                    ctx,
                ))
            }
        }
    }
}

pub async fn set(
    coordinator: &Arc<Coordinator>,
    vin: &str,
    kind: TimeKind,
    raw: &str,
) -> Result<DispatchOutcome, CommandError> {
    dispatch_with(coordinator, vin, |ctx| {
        let time = parse_time_of_day(raw)
            .ok_or_else(|| CommandError::InvalidValue(format!("{:?} is not a HH:MM time", raw)))?;
        kind.command(time, ctx)
    })
    .await
}
