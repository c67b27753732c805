//! Read-only telemetry.

use serde_json::json;

use super::{display_name, EntityState, Platform, RenderContext};
use crate::car::fields::{paths, read_number};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Battery,
    Range,
    Odometer,
    InteriorTemperature,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Battery,
        SensorKind::Range,
        SensorKind::Odometer,
        SensorKind::InteriorTemperature,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            SensorKind::Battery => "battery",
            SensorKind::Range => "range",
            SensorKind::Odometer => "odometer",
            SensorKind::InteriorTemperature => "interior_temperature",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SensorKind::Battery => "Battery",
            SensorKind::Range => "Range",
            SensorKind::Odometer => "Odometer",
            SensorKind::InteriorTemperature => "Interior Temperature",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            SensorKind::Battery => paths::CHARGE_LEVEL,
            SensorKind::Range => paths::DISTANCE_TO_EMPTY,
            SensorKind::Odometer => paths::ODOMETER,
            SensorKind::InteriorTemperature => paths::INTERIOR_TEMP,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Battery => "%",
            SensorKind::Range | SensorKind::Odometer => "km",
            SensorKind::InteriorTemperature => "°C",
        }
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> EntityState {
        EntityState::from_reading(
            Platform::Sensor,
            self.key(),
            display_name(ctx.vin, self.label()),
            read_number(ctx.status, &self.path().into()),
            |value| json!(value),
        )
        .with_attribute("unit_of_measurement", self.unit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::fields::FieldTable;
    use crate::car::mock::status;

    #[test]
    fn reads_telemetry_numbers() {
        let fields = FieldTable::default();
        let s = status(json!({"additionalVehicleStatus": {
            "electricVehicleStatus": {"chargeLevel": "80", "distanceToEmptyOnBatteryOnly": 412},
            "climateStatus": {"interiorTemp": "21.5"},
            "maintenanceStatus": {"odometer": "n/a"}
        }}));
        let ctx = RenderContext {
            vin: "VIN1",
            status: &s,
            fields: &fields,
            latest_poll_time: None,
        };
        assert_eq!(SensorKind::Battery.render(&ctx).state, json!(80.0));
        assert_eq!(SensorKind::Range.render(&ctx).state, json!(412.0));
        assert_eq!(SensorKind::InteriorTemperature.render(&ctx).state, json!(21.5));

        let odometer = SensorKind::Odometer.render(&ctx);
        assert!(odometer.is_unknown());
        assert_eq!(odometer.attributes.get("raw_value"), Some(&json!("n/a")));
        assert_eq!(odometer.attributes.get("unit_of_measurement"), Some(&json!("km")));
    }
}
