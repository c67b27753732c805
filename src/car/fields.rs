//! Typed accessors over [VehicleStatus] documents.
//!
//! The backend encodes most on/off fields as small integer strings whose
//! meaning differs per field: the charger reports both `"1"` and `"2"` while
//! charging, steering wheel heating uses `"2"` (not `"0"`) for off, and so on.
//! Each field therefore carries its own value tables in a [BinaryField]. The
//! tables in [FieldTable::default] were observed from real traffic and can be
//! overridden from the `zeekr.fields` configuration section.
//!
//! A value that is in neither table is reported as [Reading::Unrecognized]
//! instead of being folded into "off".

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::status::{scalar_to_string, StatusPatch, StatusPath, VehicleStatus};

/// The outcome of reading one logical field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reading<T> {
    Known(T),
    /// The field is present but holds a value outside the known encodings.
    Unrecognized(String),
    Missing,
}

impl<T> Reading<T> {
    pub fn known(self) -> Option<T> {
        match self {
            Reading::Known(value) => Some(value),
            _ => None,
        }
    }
}

/// An on/off field with its own encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryField {
    pub path: StatusPath,
    pub on_values: Vec<String>,
    pub off_values: Vec<String>,
    pub write_on: String,
    pub write_off: String,
}

impl BinaryField {
    fn new(path: &str, on: &[&str], off: &[&str], write_on: &str, write_off: &str) -> Self {
        Self {
            path: StatusPath::parse(path),
            on_values: on.iter().map(|v| v.to_string()).collect(),
            off_values: off.iter().map(|v| v.to_string()).collect(),
            write_on: write_on.to_string(),
            write_off: write_off.to_string(),
        }
    }

    pub fn decode(&self, raw: &str) -> Reading<bool> {
        if self.on_values.iter().any(|v| v == raw) {
            Reading::Known(true)
        } else if self.off_values.iter().any(|v| v == raw) {
            Reading::Known(false)
        } else {
            Reading::Unrecognized(raw.to_string())
        }
    }

    pub fn read(&self, status: &VehicleStatus) -> Reading<bool> {
        match status.get_str(&self.path) {
            Some(raw) => {
                let reading = self.decode(&raw);
                if let Reading::Unrecognized(ref raw) = reading {
                    log::debug!("Unrecognized value {:?} at {}", raw, self.path);
                }
                reading
            }
            None => Reading::Missing,
        }
    }

    pub fn encoded(&self, on: bool) -> &str {
        if on {
            &self.write_on
        } else {
            &self.write_off
        }
    }

    /// The optimistic write for this field.
    pub fn patch(&self, on: bool) -> StatusPatch {
        StatusPatch::new().set(self.path.clone(), self.encoded(on))
    }
}

/// Every field table the entities decode. Missing entries in the
/// configuration fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldTable {
    pub charging: BinaryField,
    pub defrost: BinaryField,
    pub steering_wheel_heat: BinaryField,
    pub sentry_mode: BinaryField,
    pub climate: BinaryField,
    pub sunshade: BinaryField,
    pub charge_plan: BinaryField,
    pub travel_plan: BinaryField,
}

impl Default for FieldTable {
    fn default() -> Self {
        Self {
            charging: BinaryField::new(
                paths::CHARGER_STATE,
                &["1", "2"],
                &["0", "25", "26"],
                "2",
                "25",
            ),
            defrost: BinaryField::new(paths::DEFROST, &["1"], &["0", "2"], "1", "0"),
            steering_wheel_heat: BinaryField::new(
                paths::STEERING_WHEEL_HEAT,
                &["1"],
                &["2"],
                "1",
                "2",
            ),
            sentry_mode: BinaryField::new(
                paths::SENTRY_MODE,
                &["1", "true", "True"],
                &["0", "false", "False"],
                "1",
                "0",
            ),
            climate: BinaryField::new(
                paths::PRE_CLIMATE_ACTIVE,
                &["1", "true"],
                &["0", "false"],
                "1",
                "0",
            ),
            sunshade: BinaryField::new(paths::CURTAIN_OPEN_STATUS, &["2"], &["1"], "2", "1"),
            charge_plan: BinaryField::new(
                paths::CHARGE_PLAN_COMMAND,
                &["start"],
                &["stop"],
                "start",
                "stop",
            ),
            travel_plan: BinaryField::new(
                paths::TRAVEL_PLAN_COMMAND,
                &["start"],
                &["stop"],
                "start",
                "stop",
            ),
        }
    }
}

/// Well-known locations in the status document.
pub mod paths {
    pub const CHARGER_STATE: &str = "additionalVehicleStatus.electricVehicleStatus.chargerState";
    pub const CHARGE_LEVEL: &str = "additionalVehicleStatus.electricVehicleStatus.chargeLevel";
    pub const DISTANCE_TO_EMPTY: &str =
        "additionalVehicleStatus.electricVehicleStatus.distanceToEmptyOnBatteryOnly";
    pub const DEFROST: &str = "additionalVehicleStatus.climateStatus.defrost";
    pub const STEERING_WHEEL_HEAT: &str = "additionalVehicleStatus.climateStatus.steerWhlHeatingSts";
    pub const PRE_CLIMATE_ACTIVE: &str = "additionalVehicleStatus.climateStatus.preClimateActive";
    pub const INTERIOR_TEMP: &str = "additionalVehicleStatus.climateStatus.interiorTemp";
    pub const CURTAIN_OPEN_STATUS: &str = "additionalVehicleStatus.climateStatus.curtainOpenStatus";
    pub const CURTAIN_POS: &str = "additionalVehicleStatus.climateStatus.curtainPos";
    pub const SENTRY_MODE: &str = "additionalVehicleStatus.remoteControlState.vstdModeState";
    pub const ODOMETER: &str = "additionalVehicleStatus.maintenanceStatus.odometer";

    pub const CHARGE_PLAN: &str = "chargePlan";
    pub const CHARGE_PLAN_COMMAND: &str = "chargePlan.command";
    pub const CHARGE_PLAN_START: &str = "chargePlan.startTime";
    pub const CHARGE_PLAN_END: &str = "chargePlan.endTime";

    pub const TRAVEL_PLAN: &str = "travelPlan";
    pub const TRAVEL_PLAN_COMMAND: &str = "travelPlan.command";
    pub const TRAVEL_PLAN_START: &str = "travelPlan.startTime";
    pub const TRAVEL_PLAN_SCHEDULE: &str = "travelPlan.scheduleList";

    /// Key of the charger state inside the charging-status payload.
    pub const CHARGING_STATUS_STATE: &str = "chargerState";
}

/// Read a numeric field, accepting numbers and numeric strings.
pub fn read_number(status: &VehicleStatus, path: &StatusPath) -> Reading<f64> {
    match status.get(path) {
        None | Some(Value::Null) => Reading::Missing,
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Reading::Known)
            .unwrap_or_else(|| Reading::Unrecognized(n.to_string())),
        Some(other) => match scalar_to_string(other) {
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(value) => Reading::Known(value),
                Err(_) => Reading::Unrecognized(raw),
            },
            None => Reading::Unrecognized(other.to_string()),
        },
    }
}

pub fn read_string(status: &VehicleStatus, path: &StatusPath) -> Reading<String> {
    match status.get_str(path) {
        Some(value) => Reading::Known(value),
        None => Reading::Missing,
    }
}

/// Parse an `HH:MM` (or `HH:MM:SS`) time of day.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

pub fn format_time_of_day(time: &NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

pub fn read_time(status: &VehicleStatus, path: &StatusPath) -> Reading<NaiveTime> {
    match status.get_str(path) {
        Some(raw) => match parse_time_of_day(&raw) {
            Some(time) => Reading::Known(time),
            None => Reading::Unrecognized(raw),
        },
        None => Reading::Missing,
    }
}

/// The next departure of the travel plan: the first parseable `startTime`
/// in the schedule list, falling back to the plan's own `startTime`.
pub fn read_travel_departure(status: &VehicleStatus) -> Reading<NaiveTime> {
    let schedule = status.get(&StatusPath::parse(paths::TRAVEL_PLAN_SCHEDULE));
    if let Some(Value::Array(entries)) = schedule {
        let first = entries
            .iter()
            .filter_map(|entry| entry.get("startTime").and_then(Value::as_str))
            .find_map(parse_time_of_day);
        if let Some(time) = first {
            return Reading::Known(time);
        }
    }
    read_time(status, &StatusPath::parse(paths::TRAVEL_PLAN_START))
}
