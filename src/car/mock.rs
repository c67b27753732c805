//! A scripted [RemoteVehicleService] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use super::error::ServiceError;
use super::status::VehicleStatus;
use super::{
    ChargePlanRequest, RemoteControl, RemoteVehicleService, TravelPlanRequest, VehicleInfo,
};

/// A status document with only the charger state set.
pub fn charger_status(state: &str) -> VehicleStatus {
    status(json!({
        "additionalVehicleStatus": {"electricVehicleStatus": {"chargerState": state}}
    }))
}

pub fn status(value: Value) -> VehicleStatus {
    VehicleStatus::try_from(value).expect("status fixtures are objects")
}

#[derive(Default)]
struct Script {
    vehicles: Vec<VehicleInfo>,
    statuses: HashMap<String, VehicleStatus>,
    charging_statuses: HashMap<String, Vec<Value>>,
    charge_plans: HashMap<String, Value>,
    travel_plans: HashMap<String, Value>,
    trackpoints: Vec<Value>,
    failing_status: HashSet<String>,
    failing_plans: HashSet<String>,
    fail_login: bool,
    fail_list: bool,
    reject_commands: bool,
    fetch_delay: Option<Duration>,
    controls: Vec<(String, RemoteControl)>,
    charge_plan_calls: Vec<(String, ChargePlanRequest)>,
    travel_plan_calls: Vec<(String, TravelPlanRequest)>,
}

#[derive(Default)]
pub struct MockService {
    script: Mutex<Script>,
    status_fetches: AtomicUsize,
    charging_fetches: AtomicUsize,
}

impl MockService {
    pub fn with_vehicles(vins: &[&str]) -> Arc<Self> {
        let mock = Self::default();
        mock.script.lock().unwrap().vehicles = vins
            .iter()
            .map(|vin| VehicleInfo {
                vin: vin.to_string(),
                model: Some("001".to_string()),
            })
            .collect();
        Arc::new(mock)
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn set_status(&self, vin: &str, status: VehicleStatus) {
        let mut script = self.script();
        script.failing_status.remove(vin);
        script.statuses.insert(vin.to_string(), status);
    }

    /// Charging-status payloads, returned in order. The last one repeats.
    pub fn set_charging_statuses(&self, vin: &str, payloads: Vec<Value>) {
        self.script()
            .charging_statuses
            .insert(vin.to_string(), payloads);
    }

    pub fn set_charging_status(&self, vin: &str, payload: Value) {
        self.set_charging_statuses(vin, vec![payload]);
    }

    pub fn set_charge_plan(&self, vin: &str, plan: Value) {
        self.script().charge_plans.insert(vin.to_string(), plan);
    }

    pub fn set_travel_plan(&self, vin: &str, plan: Value) {
        self.script().travel_plans.insert(vin.to_string(), plan);
    }

    pub fn set_trackpoints(&self, trackpoints: Vec<Value>) {
        self.script().trackpoints = trackpoints;
    }

    pub fn fail_status(&self, vin: &str) {
        self.script().failing_status.insert(vin.to_string());
    }

    pub fn fail_plans(&self, vin: &str) {
        self.script().failing_plans.insert(vin.to_string());
    }

    pub fn fail_login(&self) {
        self.script().fail_login = true;
    }

    pub fn fail_list_vehicles(&self) {
        self.script().fail_list = true;
    }

    pub fn reject_commands(&self) {
        self.script().reject_commands = true;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.script().fetch_delay = Some(delay);
    }

    pub fn status_fetches(&self) -> usize {
        self.status_fetches.load(Ordering::SeqCst)
    }

    pub fn charging_fetches(&self) -> usize {
        self.charging_fetches.load(Ordering::SeqCst)
    }

    pub fn controls(&self) -> Vec<(String, RemoteControl)> {
        self.script().controls.clone()
    }

    pub fn charge_plan_calls(&self) -> Vec<(String, ChargePlanRequest)> {
        self.script().charge_plan_calls.clone()
    }

    pub fn travel_plan_calls(&self) -> Vec<(String, TravelPlanRequest)> {
        self.script().travel_plan_calls.clone()
    }

    fn rejection(&self, vin: &str, service_id: &str) -> Result<(), ServiceError> {
        if self.script().reject_commands {
            return Err(ServiceError::RemoteCommand {
                vin: vin.to_string(),
                service_id: service_id.to_string(),
                reason: "rejected by mock".to_string(),
            });
        }
        Ok(())
    }

    fn plan(&self, vin: &str, plans: fn(&Script) -> &HashMap<String, Value>) -> Result<Option<Value>, ServiceError> {
        let script = self.script();
        if script.failing_plans.contains(vin) {
            return Err(ServiceError::Fetch {
                vin: vin.to_string(),
                reason: "plan unavailable".to_string(),
            });
        }
        Ok(plans(&script).get(vin).cloned())
    }
}

#[rocket::async_trait]
impl RemoteVehicleService for MockService {
    fn get_name(&self) -> &'static str {
        "mock"
    }

    async fn login(&self) -> Result<(), ServiceError> {
        if self.script().fail_login {
            return Err(ServiceError::Auth("bad credentials".to_string()));
        }
        Ok(())
    }

    async fn list_vehicles(&self) -> Result<Vec<VehicleInfo>, ServiceError> {
        let script = self.script();
        if script.fail_list {
            return Err(ServiceError::Decode("vehicle list unavailable".to_string()));
        }
        Ok(script.vehicles.clone())
    }

    async fn get_status(&self, vin: &str) -> Result<VehicleStatus, ServiceError> {
        let delay = self.script().fetch_delay;
        if let Some(delay) = delay {
            rocket::tokio::time::sleep(delay).await;
        }
        self.status_fetches.fetch_add(1, Ordering::SeqCst);
        let script = self.script();
        if script.failing_status.contains(vin) {
            return Err(ServiceError::Fetch {
                vin: vin.to_string(),
                reason: "vehicle offline".to_string(),
            });
        }
        Ok(script.statuses.get(vin).cloned().unwrap_or_default())
    }

    async fn get_charging_status(&self, vin: &str) -> Result<VehicleStatus, ServiceError> {
        let call = self.charging_fetches.fetch_add(1, Ordering::SeqCst);
        let script = self.script();
        let payload = script
            .charging_statuses
            .get(vin)
            .and_then(|payloads| payloads.get(call).or_else(|| payloads.last()))
            .cloned()
            .unwrap_or_else(|| json!({}));
        Ok(status(payload))
    }

    async fn get_charge_plan(&self, vin: &str) -> Result<Option<Value>, ServiceError> {
        self.plan(vin, |script| &script.charge_plans)
    }

    async fn get_travel_plan(&self, vin: &str) -> Result<Option<Value>, ServiceError> {
        self.plan(vin, |script| &script.travel_plans)
    }

    async fn do_remote_control(
        &self,
        vin: &str,
        request: &RemoteControl,
    ) -> Result<(), ServiceError> {
        self.rejection(vin, &request.service_id)?;
        self.script()
            .controls
            .push((vin.to_string(), request.clone()));
        Ok(())
    }

    async fn set_charge_plan(
        &self,
        vin: &str,
        request: &ChargePlanRequest,
    ) -> Result<(), ServiceError> {
        self.rejection(vin, "chargePlan")?;
        self.script()
            .charge_plan_calls
            .push((vin.to_string(), request.clone()));
        Ok(())
    }

    async fn set_travel_plan(
        &self,
        vin: &str,
        request: &TravelPlanRequest,
    ) -> Result<(), ServiceError> {
        self.rejection(vin, "travelPlan")?;
        self.script()
            .travel_plan_calls
            .push((vin.to_string(), request.clone()));
        Ok(())
    }

    async fn get_trip_trackpoints(
        &self,
        _vin: &str,
        _report_time: u64,
        _trip_id: u64,
    ) -> Result<Vec<Value>, ServiceError> {
        Ok(self.script().trackpoints.clone())
    }
}
