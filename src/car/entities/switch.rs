//! On/off actuators, plus the charge and travel plan toggles.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone};
use serde_json::Value;

use super::{dispatch_with, display_name, on_off, CommandContext, EntityState, Platform, RenderContext};
use crate::car::dispatch::{Command, Confirmation, DispatchOutcome, FollowUp, RemoteCall};
use crate::car::error::CommandError;
use crate::car::fields::{paths, parse_time_of_day, read_string, BinaryField, FieldTable};
use crate::car::status::{StatusPatch, StatusPath, VehicleStatus};
use crate::car::task::Coordinator;
use crate::car::{ChargePlanRequest, CommandVerb, RemoteControl, TravelPlanRequest};

pub const DEFAULT_CHARGE_START: &str = "01:15";
pub const DEFAULT_CHARGE_END: &str = "06:45";
pub const DEFAULT_DEPARTURE: &str = "08:00";
const DEFAULT_TIMER_ID: &str = "4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchKind {
    Charging,
    Defrost,
    SteeringWheelHeat,
    SentryMode,
    ChargePlan,
    TravelPlan,
}

impl SwitchKind {
    pub const ALL: [SwitchKind; 6] = [
        SwitchKind::Charging,
        SwitchKind::Defrost,
        SwitchKind::SteeringWheelHeat,
        SwitchKind::SentryMode,
        SwitchKind::ChargePlan,
        SwitchKind::TravelPlan,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            SwitchKind::Charging => "charging",
            SwitchKind::Defrost => "defrost",
            SwitchKind::SteeringWheelHeat => "steering_wheel_heat",
            SwitchKind::SentryMode => "sentry_mode",
            SwitchKind::ChargePlan => "charge_plan",
            SwitchKind::TravelPlan => "travel_plan",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SwitchKind::Charging => "Charging",
            SwitchKind::Defrost => "Defroster",
            SwitchKind::SteeringWheelHeat => "Steering Wheel Heat",
            SwitchKind::SentryMode => "Sentry Mode",
            SwitchKind::ChargePlan => "Charge Plan",
            SwitchKind::TravelPlan => "Travel Plan",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }

    pub fn field<'a>(&self, fields: &'a FieldTable) -> &'a BinaryField {
        match self {
            SwitchKind::Charging => &fields.charging,
            SwitchKind::Defrost => &fields.defrost,
            SwitchKind::SteeringWheelHeat => &fields.steering_wheel_heat,
            SwitchKind::SentryMode => &fields.sentry_mode,
            SwitchKind::ChargePlan => &fields.charge_plan,
            SwitchKind::TravelPlan => &fields.travel_plan,
        }
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> EntityState {
        EntityState::from_reading(
            Platform::Switch,
            self.key(),
            display_name(ctx.vin, self.label()),
            self.field(ctx.fields).read(ctx.status),
            on_off,
        )
    }

    /// The command table.
    pub fn command(&self, on: bool, ctx: &CommandContext<'_>) -> Result<Command, CommandError> {
        let field = self.field(ctx.fields);
        let settle = FollowUp::RefreshAfter(ctx.config.settle_delay());
        let (call, follow_up) = match (self, on) {
            (SwitchKind::Charging, true) => (
                RemoteControl::start("RCS").param("rcs.restart", "1"),
                FollowUp::Confirm(Confirmation {
                    field: StatusPath::parse(paths::CHARGING_STATUS_STATE),
                    accepted: field.on_values.clone(),
                    confirmed: field.patch(true),
                    reverted: field.patch(false),
                }),
            ),
            (SwitchKind::Charging, false) => {
                (RemoteControl::stop("RCS").param("rcs.terminate", "1"), settle)
            }
            (SwitchKind::Defrost, true) => (
                RemoteControl::start("ZAF")
                    .param("DF", "true")
                    .param("DF.level", "2"),
                settle,
            ),
            (SwitchKind::Defrost, false) => (RemoteControl::start("ZAF").param("DF", "false"), settle),
            (SwitchKind::SteeringWheelHeat, true) => (
                RemoteControl::start("ZAF")
                    .param("SW", "true")
                    .param("SW.duration", ctx.settings.steering_wheel_duration.to_string())
                    .param("SW.level", "3"),
                settle,
            ),
            (SwitchKind::SteeringWheelHeat, false) => {
                (RemoteControl::start("ZAF").param("SW", "false"), settle)
            }
            (SwitchKind::SentryMode, _) => (
                RemoteControl::new(verb(on), "RSM").param("rsm", "6"),
                FollowUp::RefreshAfter(ctx.config.sentry_settle_delay()),
            ),
            (SwitchKind::ChargePlan, _) => {
                return Ok(plan_command(
                    self.key(),
                    RemoteCall::ChargePlan(charge_plan_request(ctx.status, None, None, verb(on))),
                    field.patch(on),
                    ctx,
                ))
            }
            (SwitchKind::TravelPlan, _) => {
                let request = if on {
                    let start = read_string(ctx.status, &paths::TRAVEL_PLAN_START.into())
                        .known()
                        .unwrap_or_else(|| DEFAULT_DEPARTURE.to_string());
                    travel_plan_request(ctx.status, CommandVerb::Start, &start, &ctx.now)?
                } else {
                    travel_plan_stop_request(ctx.status)
                };
                return Ok(plan_command(
                    self.key(),
                    RemoteCall::TravelPlan(request),
                    field.patch(on),
                    ctx,
                ));
            }
        };

        Ok(Command {
            entity: self.key().to_string(),
            call: RemoteCall::Control(call),
            optimistic: field.patch(on),
            follow_up,
        })
    }
}

fn verb(on: bool) -> CommandVerb {
    if on {
        CommandVerb::Start
    } else {
        CommandVerb::Stop
    }
}

/// Plan changes refresh a little later, once the backend stored them.
pub(super) fn plan_command(
    entity: &str,
    call: RemoteCall,
    optimistic: StatusPatch,
    ctx: &CommandContext<'_>,
) -> Command {
    Command {
        entity: entity.to_string(),
        call,
        optimistic,
        follow_up: FollowUp::RefreshAfter(ctx.config.plan_settle_delay()),
    }
}

/// The charge plan call, keeping whatever is not overridden from the
/// current plan.
pub(super) fn charge_plan_request(
    status: &VehicleStatus,
    start: Option<String>,
    end: Option<String>,
    command: CommandVerb,
) -> ChargePlanRequest {
    let current = |path: &str, default: &str| {
        read_string(status, &path.into())
            .known()
            .unwrap_or_else(|| default.to_string())
    };
    ChargePlanRequest {
        start_time: start.unwrap_or_else(|| current(paths::CHARGE_PLAN_START, DEFAULT_CHARGE_START)),
        end_time: end.unwrap_or_else(|| current(paths::CHARGE_PLAN_END, DEFAULT_CHARGE_END)),
        command,
    }
}

fn travel_plan_field(key: &str) -> StatusPath {
    StatusPath::parse(&format!("{}.{}", paths::TRAVEL_PLAN, key))
}

fn travel_plan_flags(status: &VehicleStatus) -> (bool, bool, Vec<Value>) {
    let plan_value = |key: &str, default: &str| {
        status
            .get_str(&travel_plan_field(key))
            .unwrap_or_else(|| default.to_string())
    };
    let ac_enabled = plan_value("ac", "true") == "true";
    let steering_wheel_heat_enabled = plan_value("bw", "0") == "1";
    let schedule_list = match status.get(&paths::TRAVEL_PLAN_SCHEDULE.into()) {
        Some(Value::Array(entries)) => entries.clone(),
        _ => Vec::new(),
    };
    (ac_enabled, steering_wheel_heat_enabled, schedule_list)
}

/// A travel plan call departing at `start`, scheduled at its next occurrence.
pub(super) fn travel_plan_request<Tz: TimeZone>(
    status: &VehicleStatus,
    command: CommandVerb,
    start: &str,
    now: &DateTime<Tz>,
) -> Result<TravelPlanRequest, CommandError> {
    let time = parse_time_of_day(start)
        .ok_or_else(|| CommandError::InvalidValue(format!("departure time {:?}", start)))?;
    let scheduled = next_departure_epoch_ms(time, now)
        .ok_or_else(|| CommandError::InvalidValue(format!("departure time {} does not exist today", start)))?;
    let (ac_enabled, steering_wheel_heat_enabled, schedule_list) = travel_plan_flags(status);
    Ok(TravelPlanRequest {
        command,
        start_time: start.to_string(),
        scheduled_time: scheduled.to_string(),
        ac_enabled,
        steering_wheel_heat_enabled,
        schedule_list,
        timer_id: None,
    })
}

fn travel_plan_stop_request(status: &VehicleStatus) -> TravelPlanRequest {
    let (ac_enabled, steering_wheel_heat_enabled, schedule_list) = travel_plan_flags(status);
    let plan_str = |key: &str| status.get_str(&travel_plan_field(key));
    TravelPlanRequest {
        command: CommandVerb::Stop,
        start_time: String::new(),
        scheduled_time: plan_str("scheduledTime").unwrap_or_default(),
        ac_enabled,
        steering_wheel_heat_enabled,
        schedule_list,
        timer_id: Some(plan_str("timerId").unwrap_or_else(|| DEFAULT_TIMER_ID.to_string())),
    }
}

/// Epoch milliseconds of the next `time` strictly after `now`: today if it is
/// still ahead, tomorrow otherwise. `None` when the local time does not exist
/// (skipped by a DST change).
pub fn next_departure_epoch_ms<Tz: TimeZone>(time: NaiveTime, now: &DateTime<Tz>) -> Option<i64> {
    let tz = now.timezone();
    let today = now.date_naive().and_time(time);
    let target = tz.from_local_datetime(&today).earliest()?;
    if target > *now {
        return Some(target.timestamp_millis());
    }
    let tomorrow = today + ChronoDuration::days(1);
    Some(tz.from_local_datetime(&tomorrow).earliest()?.timestamp_millis())
}

pub async fn turn(
    coordinator: &Arc<Coordinator>,
    vin: &str,
    kind: SwitchKind,
    on: bool,
) -> Result<DispatchOutcome, CommandError> {
    dispatch_with(coordinator, vin, |ctx| kind.command(on, ctx)).await
}
