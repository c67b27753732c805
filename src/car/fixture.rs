//! An offline [RemoteVehicleService] replaying status documents from a JSON
//! file.
//!
//! The file looks like this:
//!
//! ```json
//! {
//!   "vehicles": [{"vin": "L6T000000000TEST1", "model": "001"}],
//!   "statuses": {"L6T000000000TEST1": {"additionalVehicleStatus": {}}},
//!   "charge_plans": {"L6T000000000TEST1": {"command": "stop", "startTime": "01:15", "endTime": "06:45"}},
//!   "travel_plans": {},
//!   "trackpoints": [{"latitude": 52.1, "longitude": 4.3}]
//! }
//! ```
//!
//! Every command is accepted. Plan changes are stored, so the next refresh
//! reports them, and starting or stopping a charge moves the charger state.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use rocket::tokio::{fs, sync::Mutex};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ServiceError;
use super::fields::paths;
use super::status::{StatusPath, VehicleStatus};
use super::{
    ChargePlanRequest, CommandVerb, RemoteControl, RemoteVehicleService, TravelPlanRequest,
    VehicleInfo,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FixtureData {
    vehicles: Vec<VehicleInfo>,
    statuses: HashMap<String, VehicleStatus>,
    charge_plans: HashMap<String, Value>,
    travel_plans: HashMap<String, Value>,
    trackpoints: Vec<Value>,
}

pub struct FixtureService {
    data: Mutex<FixtureData>,
}

impl FixtureService {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let service = Self::from_json(&content)
            .with_context(|| format!("Failed to parse fixture {}", path.display()))?;
        log::info!(
            "Loaded fixture {} with {} vehicle(s)",
            path.display(),
            service.data.lock().await.vehicles.len()
        );
        Ok(service)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let data: FixtureData = serde_json::from_str(content)?;
        for vehicle in &data.vehicles {
            if !data.statuses.contains_key(&vehicle.vin) {
                log::warn!("Fixture has no status for {}", vehicle.vin);
            }
        }
        Ok(Self {
            data: Mutex::new(data),
        })
    }

    async fn known(&self, vin: &str) -> Result<(), ServiceError> {
        if self.data.lock().await.vehicles.iter().any(|v| v.vin == vin) {
            Ok(())
        } else {
            Err(ServiceError::Fetch {
                vin: vin.to_string(),
                reason: "not in fixture".to_string(),
            })
        }
    }
}

#[rocket::async_trait]
impl RemoteVehicleService for FixtureService {
    fn get_name(&self) -> &'static str {
        "fixture"
    }

    async fn login(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn list_vehicles(&self) -> Result<Vec<VehicleInfo>, ServiceError> {
        Ok(self.data.lock().await.vehicles.clone())
    }

    async fn get_status(&self, vin: &str) -> Result<VehicleStatus, ServiceError> {
        self.known(vin).await?;
        Ok(self
            .data
            .lock()
            .await
            .statuses
            .get(vin)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_charging_status(&self, vin: &str) -> Result<VehicleStatus, ServiceError> {
        let status = self.get_status(vin).await?;
        let mut charging = VehicleStatus::new();
        if let Some(state) = status.get(&StatusPath::parse(paths::CHARGER_STATE)) {
            charging.insert(paths::CHARGING_STATUS_STATE, state.clone());
        }
        Ok(charging)
    }

    async fn get_charge_plan(&self, vin: &str) -> Result<Option<Value>, ServiceError> {
        Ok(self.data.lock().await.charge_plans.get(vin).cloned())
    }

    async fn get_travel_plan(&self, vin: &str) -> Result<Option<Value>, ServiceError> {
        Ok(self.data.lock().await.travel_plans.get(vin).cloned())
    }

    async fn do_remote_control(
        &self,
        vin: &str,
        request: &RemoteControl,
    ) -> Result<(), ServiceError> {
        self.known(vin).await?;
        log::info!(
            "Fixture: accepted {} {} for {}",
            request.command,
            request.service_id,
            vin
        );
        if request.service_id == "RCS" {
            let state = match request.command {
                CommandVerb::Start => "2",
                CommandVerb::Stop => "25",
            };
            let mut data = self.data.lock().await;
            data.statuses
                .entry(vin.to_string())
                .or_default()
                .set(&StatusPath::parse(paths::CHARGER_STATE), json!(state));
        }
        Ok(())
    }

    async fn set_charge_plan(
        &self,
        vin: &str,
        request: &ChargePlanRequest,
    ) -> Result<(), ServiceError> {
        self.known(vin).await?;
        let plan = serde_json::to_value(request)
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        self.data
            .lock()
            .await
            .charge_plans
            .insert(vin.to_string(), plan);
        Ok(())
    }

    async fn set_travel_plan(
        &self,
        vin: &str,
        request: &TravelPlanRequest,
    ) -> Result<(), ServiceError> {
        self.known(vin).await?;
        let plan = serde_json::to_value(request)
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        self.data
            .lock()
            .await
            .travel_plans
            .insert(vin.to_string(), plan);
        Ok(())
    }

    async fn get_trip_trackpoints(
        &self,
        vin: &str,
        _report_time: u64,
        _trip_id: u64,
    ) -> Result<Vec<Value>, ServiceError> {
        self.known(vin).await?;
        Ok(self.data.lock().await.trackpoints.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "vehicles": [{"vin": "VIN1", "model": "001"}],
        "statuses": {"VIN1": {"additionalVehicleStatus": {"electricVehicleStatus": {"chargerState": "25"}}}},
        "charge_plans": {"VIN1": {"command": "stop", "startTime": "01:15", "endTime": "06:45"}}
    }"#;

    #[rocket::async_test]
    async fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        std::fs::write(&path, FIXTURE).unwrap();

        let service = FixtureService::load(&path).await.unwrap();
        let vehicles = service.list_vehicles().await.unwrap();
        assert_eq!(vehicles[0].vin, "VIN1");
        assert!(service.get_status("VIN2").await.is_err());

        assert!(FixtureService::load(&dir.path().join("missing.json")).await.is_err());
    }

    #[rocket::async_test]
    async fn charging_commands_move_the_charger_state() {
        let service = FixtureService::from_json(FIXTURE).unwrap();
        service
            .do_remote_control("VIN1", &RemoteControl::start("RCS").param("rcs.restart", "1"))
            .await
            .unwrap();
        let charging = service.get_charging_status("VIN1").await.unwrap();
        assert_eq!(
            charging.get_str(&StatusPath::parse(paths::CHARGING_STATUS_STATE)),
            Some("2".to_string())
        );
    }

    #[rocket::async_test]
    async fn plan_changes_are_reported_back() {
        let service = FixtureService::from_json(FIXTURE).unwrap();
        service
            .set_charge_plan(
                "VIN1",
                &ChargePlanRequest {
                    start_time: "02:00".to_string(),
                    end_time: "06:45".to_string(),
                    command: CommandVerb::Start,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            service.get_charge_plan("VIN1").await.unwrap(),
            Some(json!({"startTime": "02:00", "endTime": "06:45", "command": "start"}))
        );
    }
}
