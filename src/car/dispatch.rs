//! The command protocol shared by every actuator.
//!
//! An entity describes what it wants as a [Command]: the remote call, the
//! values it expects the vehicle to report once the call took effect, and
//! what to do afterwards. [Coordinator::dispatch] then runs the same steps
//! for all of them:
//!
//! 1. resolve the vehicle (unknown VINs are skipped, not errors)
//! 2. count the invoke
//! 3. issue the remote call, propagating a rejection untouched
//! 4. patch the status document and record the pending values
//! 5. notify listeners
//! 6. run the follow-up
//!
//! Commands are never retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rocket::tokio::sync::oneshot;
use serde::Serialize;
use serde_json::Value;

use super::confirm::confirm;
use super::error::{CommandError, ServiceError};
use super::status::{StatusPatch, StatusPath};
use super::task::{live, ChangeReason, Coordinator, StateChanged};
use super::{ChargePlanRequest, RemoteControl, TravelPlanRequest, VehicleHandle};

/// The remote side of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Control(RemoteControl),
    ChargePlan(ChargePlanRequest),
    TravelPlan(TravelPlanRequest),
}

impl RemoteCall {
    async fn execute(&self, vehicle: &VehicleHandle) -> Result<(), ServiceError> {
        match self {
            RemoteCall::Control(request) => vehicle.do_remote_control(request).await,
            RemoteCall::ChargePlan(request) => vehicle.set_charge_plan(request).await,
            RemoteCall::TravelPlan(request) => vehicle.set_travel_plan(request).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            RemoteCall::Control(request) => {
                format!("{} {}", request.command, request.service_id)
            }
            RemoteCall::ChargePlan(request) => format!(
                "charge plan {} {}-{}",
                request.command, request.start_time, request.end_time
            ),
            RemoteCall::TravelPlan(request) => {
                format!("travel plan {} {}", request.command, request.start_time)
            }
        }
    }
}

/// Polls the charging status until `field` holds one of `accepted`.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    /// Path inside the charging-status payload.
    pub field: StatusPath,
    pub accepted: Vec<String>,
    /// Written when confirmed. Usually the optimistic values again, in case a
    /// refresh in between brought back the old state.
    pub confirmed: StatusPatch,
    /// Written when the timeout is spent.
    pub reverted: StatusPatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    None,
    RefreshAfter(Duration),
    Confirm(Confirmation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// The entity key, e.g. `charging` or `charge_plan_start`.
    pub entity: String,
    pub call: RemoteCall,
    pub optimistic: StatusPatch,
    pub follow_up: FollowUp,
}

/// Resolves to whether a confirmation succeeded.
#[derive(Debug)]
pub struct ConfirmationHandle {
    receiver: oneshot::Receiver<bool>,
}

impl ConfirmationHandle {
    /// `None` when the confirmation was cancelled by a teardown.
    pub async fn wait(self) -> Option<bool> {
        self.receiver.await.ok()
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The VIN is not registered, nothing was sent.
    Skipped,
    Applied,
    AwaitingConfirmation(ConfirmationHandle),
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Skipped => "skipped",
            DispatchOutcome::Applied => "applied",
            DispatchOutcome::AwaitingConfirmation(_) => "awaiting_confirmation",
        }
    }
}

/// A value written optimistically that no refresh has overwritten yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingCommand {
    pub vin: String,
    pub entity: String,
    pub path: StatusPath,
    pub expected: Value,
    pub issued_at: DateTime<Utc>,
    pub awaiting_confirmation: bool,
}

impl Coordinator {
    pub async fn dispatch(
        self: &Arc<Self>,
        vin: &str,
        command: Command,
    ) -> Result<DispatchOutcome, CommandError> {
        let Some(vehicle) = self.get_vehicle(vin) else {
            log::warn!("Ignoring {} for unknown vehicle {}", command.entity, vin);
            return Ok(DispatchOutcome::Skipped);
        };
        if self.is_shut_down() {
            return Err(CommandError::ShutDown);
        }

        let Command {
            entity,
            call,
            optimistic,
            follow_up,
        } = command;

        self.stats.inc_invoke().await;
        log::info!("Sending {} to {} for {}", call.describe(), vin, entity);
        if let Err(e) = call.execute(vehicle).await {
            log::error!("{} for {} failed: {}", entity, vin, e);
            return Err(e.into());
        }

        let awaiting = matches!(follow_up, FollowUp::Confirm(_));
        if !optimistic.is_empty() {
            self.store.apply_patch(vin, &optimistic).await;
            self.track_pending(vin, &entity, &optimistic, awaiting).await;
        }
        self.notify(StateChanged::entity(vin, &entity, ChangeReason::Optimistic));

        match follow_up {
            FollowUp::None => Ok(DispatchOutcome::Applied),
            FollowUp::RefreshAfter(delay) => {
                self.schedule_refresh(delay).await;
                Ok(DispatchOutcome::Applied)
            }
            FollowUp::Confirm(confirmation) => {
                let handle = self
                    .spawn_confirmation(vehicle.clone(), entity, confirmation)
                    .await;
                Ok(DispatchOutcome::AwaitingConfirmation(handle))
            }
        }
    }

    async fn track_pending(&self, vin: &str, entity: &str, patch: &StatusPatch, awaiting: bool) {
        let issued_at = Utc::now();
        let mut pending = self.pending.lock().await;
        // A newer command for the same entity supersedes the older one.
        pending.retain(|p| p.vin != vin || p.entity != entity);
        pending.extend(patch.writes().iter().map(|(path, value)| PendingCommand {
            vin: vin.to_string(),
            entity: entity.to_string(),
            path: path.clone(),
            expected: value.clone(),
            issued_at,
            awaiting_confirmation: awaiting,
        }));
    }

    async fn spawn_confirmation(
        self: &Arc<Self>,
        vehicle: VehicleHandle,
        entity: String,
        confirmation: Confirmation,
    ) -> ConfirmationHandle {
        let (sender, receiver) = oneshot::channel();
        let weak = Arc::downgrade(self);
        let timeout = self.config.confirm_timeout();
        let interval = self.config.confirm_interval();

        self.spawn_owned(async move {
            let Confirmation {
                field,
                accepted,
                confirmed,
                reverted,
            } = confirmation;

            let fetch = || {
                let weak = weak.clone();
                let vehicle = vehicle.clone();
                let field = field.clone();
                async move {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.stats.inc_request().await;
                    }
                    vehicle
                        .get_charging_status()
                        .await
                        .map(|status| status.get_str(&field))
                }
            };
            let ok = confirm(fetch, &accepted, timeout, interval).await;

            let Some(coordinator) = live(&weak) else {
                return;
            };
            let vin = vehicle.vin();
            let (patch, reason) = if ok {
                log::info!("{} confirmed for {}", entity, vin);
                (confirmed, ChangeReason::Confirmed)
            } else {
                log::warn!("{} not confirmed for {}, reverting", entity, vin);
                (reverted, ChangeReason::Reverted)
            };
            coordinator.store.apply_patch(vin, &patch).await;
            coordinator
                .pending
                .lock()
                .await
                .retain(|p| p.vin != vin || p.entity != entity);
            coordinator.notify(StateChanged::entity(vin, &entity, reason));
            let _ = sender.send(ok);
        })
        .await;

        ConfirmationHandle { receiver }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::config::CoordinatorConfig;
    use crate::car::fields::paths;
    use crate::car::mock::{charger_status, MockService};
    use crate::car::status::VehicleStatus;
    use serde_json::json;

    async fn coordinator(mock: &Arc<MockService>) -> Arc<Coordinator> {
        let config = CoordinatorConfig {
            polling_interval_secs: 3600.0,
            confirm_timeout_secs: 0.03,
            confirm_interval_secs: 0.01,
            ..Default::default()
        };
        Coordinator::setup(mock.clone(), config).await.unwrap()
    }

    fn defrost_on() -> Command {
        Command {
            entity: "defrost".to_string(),
            call: RemoteCall::Control(
                RemoteControl::start("ZAF")
                    .param("DF", "true")
                    .param("DF.level", "2"),
            ),
            optimistic: StatusPatch::new().set(paths::DEFROST.into(), "1"),
            follow_up: FollowUp::None,
        }
    }

    fn defrost(status: &VehicleStatus) -> Option<String> {
        status.get_str(&paths::DEFROST.into())
    }

    #[rocket::async_test]
    async fn success_patches_immediately() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        let coordinator = coordinator(&mock).await;

        let outcome = coordinator.dispatch("VIN1", defrost_on()).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Applied));

        let snapshot = coordinator.snapshot("VIN1").await.unwrap();
        assert_eq!(defrost(&snapshot), Some("1".to_string()));
        assert_eq!(mock.controls().len(), 1);
        assert_eq!(coordinator.stats().await.invokes_total, 1);

        let pending = coordinator.pending_commands("VIN1").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].expected, json!("1"));
    }

    #[rocket::async_test]
    async fn rejection_leaves_the_document_alone() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        let coordinator = coordinator(&mock).await;
        let before = coordinator.snapshot("VIN1").await.unwrap();

        mock.reject_commands();
        let result = coordinator.dispatch("VIN1", defrost_on()).await;

        assert!(matches!(result, Err(CommandError::Remote(_))));
        assert_eq!(coordinator.snapshot("VIN1").await.unwrap(), before);
        assert!(coordinator.pending_commands("VIN1").await.is_empty());
        // the attempt is still an invoke
        assert_eq!(coordinator.stats().await.invokes_total, 1);
    }

    #[rocket::async_test]
    async fn unknown_vehicle_is_skipped() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        let coordinator = coordinator(&mock).await;

        let outcome = coordinator.dispatch("NOPE", defrost_on()).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Skipped));
        assert!(mock.controls().is_empty());
        assert_eq!(coordinator.stats().await.invokes_total, 0);
    }

    #[rocket::async_test]
    async fn refresh_resolves_pending_commands() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        let coordinator = coordinator(&mock).await;

        coordinator.dispatch("VIN1", defrost_on()).await.unwrap();
        coordinator.refresh().await.unwrap();

        assert!(coordinator.pending_commands("VIN1").await.is_empty());
        // the backend never reported defrost, so the optimistic value is gone
        assert_eq!(defrost(&coordinator.snapshot("VIN1").await.unwrap()), None);
    }

    #[rocket::async_test]
    async fn confirmation_reverts_on_timeout() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        mock.set_status("VIN1", charger_status("25"));
        mock.set_charging_status("VIN1", json!({"chargerState": "25"}));
        let coordinator = coordinator(&mock).await;

        let path = StatusPath::parse(paths::CHARGER_STATE);
        let command = Command {
            entity: "charging".to_string(),
            call: RemoteCall::Control(RemoteControl::start("RCS").param("rcs.restart", "1")),
            optimistic: StatusPatch::new().set(path.clone(), "2"),
            follow_up: FollowUp::Confirm(Confirmation {
                field: StatusPath::parse(paths::CHARGING_STATUS_STATE),
                accepted: vec!["1".to_string(), "2".to_string()],
                confirmed: StatusPatch::new().set(path.clone(), "2"),
                reverted: StatusPatch::new().set(path.clone(), "25"),
            }),
        };

        let outcome = coordinator.dispatch("VIN1", command).await.unwrap();
        let DispatchOutcome::AwaitingConfirmation(handle) = outcome else {
            panic!("expected a confirmation");
        };
        assert!(coordinator.pending_commands("VIN1").await[0].awaiting_confirmation);

        assert_eq!(handle.wait().await, Some(false));
        let snapshot = coordinator.snapshot("VIN1").await.unwrap();
        assert_eq!(snapshot.get_str(&path), Some("25".to_string()));
        assert!(coordinator.pending_commands("VIN1").await.is_empty());
    }

    #[rocket::async_test]
    async fn teardown_cancels_confirmations() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        mock.set_charging_status("VIN1", json!({"chargerState": "2"}));
        let coordinator = coordinator(&mock).await;

        let command = Command {
            entity: "charging".to_string(),
            call: RemoteCall::Control(RemoteControl::start("RCS")),
            optimistic: StatusPatch::new(),
            follow_up: FollowUp::Confirm(Confirmation {
                field: StatusPath::parse(paths::CHARGING_STATUS_STATE),
                accepted: vec!["2".to_string()],
                confirmed: StatusPatch::new().set(paths::CHARGER_STATE.into(), "2"),
                reverted: StatusPatch::new(),
            }),
        };
        let DispatchOutcome::AwaitingConfirmation(handle) =
            coordinator.dispatch("VIN1", command).await.unwrap()
        else {
            panic!("expected a confirmation");
        };
        coordinator.shutdown().await;

        assert_eq!(handle.wait().await, None);
        let snapshot = coordinator.snapshot("VIN1").await.unwrap();
        assert_eq!(snapshot.get_str(&paths::CHARGER_STATE.into()), None);
    }

    #[rocket::async_test]
    async fn commands_after_teardown_fail() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        let coordinator = coordinator(&mock).await;
        coordinator.shutdown().await;
        assert!(matches!(
            coordinator.dispatch("VIN1", defrost_on()).await,
            Err(CommandError::ShutDown)
        ));
    }
}
