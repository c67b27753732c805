//! The sunshade cover.

use std::sync::Arc;

use serde_json::json;

use super::{dispatch_with, display_name, CommandContext, EntityState, Platform, RenderContext};
use crate::car::dispatch::{Command, DispatchOutcome, FollowUp, RemoteCall};
use crate::car::error::CommandError;
use crate::car::fields::{paths, read_number};
use crate::car::task::Coordinator;
use crate::car::{CommandVerb, RemoteControl};

pub const KEY: &str = "sunshade";

pub fn render(ctx: &RenderContext<'_>) -> EntityState {
    let state = EntityState::from_reading(
        Platform::Cover,
        KEY,
        display_name(ctx.vin, "Sunshade"),
        ctx.fields.sunshade.read(ctx.status),
        |open| json!(if open { "open" } else { "closed" }),
    );
    match read_number(ctx.status, &paths::CURTAIN_POS.into()).known() {
        Some(position) => state.with_attribute("current_position", position),
        None => state,
    }
}

pub fn command(open: bool, ctx: &CommandContext<'_>) -> Command {
    let verb = if open {
        CommandVerb::Start
    } else {
        CommandVerb::Stop
    };
    let position = if open { 100 } else { 0 };
    Command {
        entity: KEY.to_string(),
        call: RemoteCall::Control(RemoteControl::new(verb, "RWS").param("target", "sunshade")),
        optimistic: ctx
            .fields
            .sunshade
            .patch(open)
            .set(paths::CURTAIN_POS.into(), position),
        follow_up: FollowUp::RefreshAfter(ctx.config.settle_delay()),
    }
}

pub async fn set(
    coordinator: &Arc<Coordinator>,
    vin: &str,
    open: bool,
) -> Result<DispatchOutcome, CommandError> {
    dispatch_with(coordinator, vin, |ctx| Ok(command(open, ctx))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::entities::testing::coordinator;
    use crate::car::fields::FieldTable;
    use crate::car::mock::{status, MockService};

    fn closed() -> crate::car::status::VehicleStatus {
        status(json!({"additionalVehicleStatus": {"climateStatus": {
            "curtainOpenStatus": "1",
            "curtainPos": 0
        }}}))
    }

    #[test]
    fn renders_position_as_attribute() {
        let fields = FieldTable::default();
        let s = closed();
        let state = render(&RenderContext {
            vin: "VIN1",
            status: &s,
            fields: &fields,
            latest_poll_time: None,
        });
        assert_eq!(state.state, json!("closed"));
        assert_eq!(state.attributes.get("current_position"), Some(&json!(0.0)));
    }

    #[rocket::async_test]
    async fn open_then_close_patches_status_and_position() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        mock.set_status("VIN1", closed());
        let coordinator = coordinator(&mock).await;
        let open_status = crate::car::status::StatusPath::parse(paths::CURTAIN_OPEN_STATUS);
        let position = crate::car::status::StatusPath::parse(paths::CURTAIN_POS);

        set(&coordinator, "VIN1", true).await.unwrap();
        let snapshot = coordinator.snapshot("VIN1").await.unwrap();
        assert_eq!(snapshot.get_str(&open_status), Some("2".to_string()));
        assert_eq!(snapshot.get(&position), Some(&json!(100)));

        set(&coordinator, "VIN1", false).await.unwrap();
        let snapshot = coordinator.snapshot("VIN1").await.unwrap();
        assert_eq!(snapshot.get_str(&open_status), Some("1".to_string()));
        assert_eq!(snapshot.get(&position), Some(&json!(0)));

        let controls = mock.controls();
        assert_eq!(controls[0].1.command, CommandVerb::Start);
        assert_eq!(controls[1].1.command, CommandVerb::Stop);
        assert_eq!(controls[1].1.service_id, "RWS");
    }
}
