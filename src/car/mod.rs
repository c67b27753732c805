//! This module contains the vehicle-facing side of the backend.
//!
//! The vendor cloud API is reached through the [RemoteVehicleService] trait.
//! Two implementations exist, and one of them is picked once at startup from
//! the `zeekr.backend` configuration:
//!
//! - [gateway_api::GatewayApiHandler] talks to a JSON gateway over HTTP.
//! - [fixture::FixtureService] replays status documents from a local file and
//!   accepts every command, which is handy to develop the presentation layer
//!   without a car.
//!
//! On top of the service sits the poll coordinator ([task::Coordinator]). It
//! keeps the last known status document of every vehicle, refreshes them on
//! an interval, and lets the entities in [entities] overlay optimistic values
//! right after a command succeeds, until the next refresh brings back the
//! authoritative state.
//!
//! The Rocket integration lives in [fairing].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod confirm;
pub mod dispatch;
pub mod entities;
pub mod error;
pub mod fairing;
pub mod fields;
pub mod fixture;
pub mod gateway_api;
pub mod stats;
pub mod status;
pub mod task;

#[cfg(test)]
pub mod mock;

use error::ServiceError;
use status::VehicleStatus;

/// A vehicle as listed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub vin: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// The verb of a remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandVerb {
    Start,
    Stop,
}

impl CommandVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandVerb::Start => "start",
            CommandVerb::Stop => "stop",
        }
    }

    pub fn from_plan_command(raw: Option<&str>) -> Self {
        match raw {
            Some("start") => CommandVerb::Start,
            _ => CommandVerb::Stop,
        }
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParameter {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSetting {
    pub service_parameters: Vec<ServiceParameter>,
}

/// A remote-control invocation: which subsystem (`service_id`) and with
/// which parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteControl {
    pub command: CommandVerb,
    pub service_id: String,
    pub setting: ServiceSetting,
}

impl RemoteControl {
    pub fn new(command: CommandVerb, service_id: &str) -> Self {
        Self {
            command,
            service_id: service_id.to_string(),
            setting: ServiceSetting::default(),
        }
    }

    pub fn start(service_id: &str) -> Self {
        Self::new(CommandVerb::Start, service_id)
    }

    pub fn stop(service_id: &str) -> Self {
        Self::new(CommandVerb::Stop, service_id)
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.setting.service_parameters.push(ServiceParameter {
            key: key.to_string(),
            value: value.into(),
        });
        self
    }
}

/// Arguments of the scheduled charging window call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargePlanRequest {
    pub start_time: String,
    pub end_time: String,
    pub command: CommandVerb,
}

/// Arguments of the travel (pre-conditioning) plan call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TravelPlanRequest {
    pub command: CommandVerb,
    pub start_time: String,
    /// Departure as epoch milliseconds, sent as a string.
    pub scheduled_time: String,
    pub ac_enabled: bool,
    pub steering_wheel_heat_enabled: bool,
    pub schedule_list: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_id: Option<String>,
}

/// The vendor cloud API, as consumed by the coordinator.
///
/// If you want to add another backend, implement this trait and add a
/// variant to [config::BackendConfig] so it can be selected at startup.
#[rocket::async_trait]
pub trait RemoteVehicleService: Send + Sync + 'static {
    fn get_name(&self) -> &'static str;

    async fn login(&self) -> Result<(), ServiceError>;

    async fn list_vehicles(&self) -> Result<Vec<VehicleInfo>, ServiceError>;

    async fn get_status(&self, vin: &str) -> Result<VehicleStatus, ServiceError>;

    /// The lighter charging-status payload, used to confirm charging starts.
    async fn get_charging_status(&self, vin: &str) -> Result<VehicleStatus, ServiceError>;

    /// `Ok(None)` when the vehicle has no charge plan.
    async fn get_charge_plan(&self, vin: &str) -> Result<Option<serde_json::Value>, ServiceError>;

    /// `Ok(None)` when the vehicle has no travel plan.
    async fn get_travel_plan(&self, vin: &str) -> Result<Option<serde_json::Value>, ServiceError>;

    async fn do_remote_control(
        &self,
        vin: &str,
        request: &RemoteControl,
    ) -> Result<(), ServiceError>;

    async fn set_charge_plan(
        &self,
        vin: &str,
        request: &ChargePlanRequest,
    ) -> Result<(), ServiceError>;

    async fn set_travel_plan(
        &self,
        vin: &str,
        request: &TravelPlanRequest,
    ) -> Result<(), ServiceError>;

    async fn get_trip_trackpoints(
        &self,
        vin: &str,
        report_time: u64,
        trip_id: u64,
    ) -> Result<Vec<serde_json::Value>, ServiceError>;
}

/// A registered vehicle, able to issue commands for its VIN.
#[derive(Clone)]
pub struct VehicleHandle {
    info: VehicleInfo,
    service: Arc<dyn RemoteVehicleService>,
}

impl fmt::Debug for VehicleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VehicleHandle")
            .field("info", &self.info)
            .field("service", &self.service.get_name())
            .finish()
    }
}

impl VehicleHandle {
    pub fn new(info: VehicleInfo, service: Arc<dyn RemoteVehicleService>) -> Self {
        Self { info, service }
    }

    pub fn vin(&self) -> &str {
        &self.info.vin
    }

    pub fn info(&self) -> &VehicleInfo {
        &self.info
    }

    pub async fn do_remote_control(&self, request: &RemoteControl) -> Result<(), ServiceError> {
        self.service.do_remote_control(&self.info.vin, request).await
    }

    pub async fn set_charge_plan(&self, request: &ChargePlanRequest) -> Result<(), ServiceError> {
        self.service.set_charge_plan(&self.info.vin, request).await
    }

    pub async fn set_travel_plan(&self, request: &TravelPlanRequest) -> Result<(), ServiceError> {
        self.service.set_travel_plan(&self.info.vin, request).await
    }

    pub async fn get_charging_status(&self) -> Result<VehicleStatus, ServiceError> {
        self.service.get_charging_status(&self.info.vin).await
    }

    pub async fn get_trip_trackpoints(
        &self,
        report_time: u64,
        trip_id: u64,
    ) -> Result<Vec<serde_json::Value>, ServiceError> {
        self.service
            .get_trip_trackpoints(&self.info.vin, report_time, trip_id)
            .await
    }
}
