//! Rocket integration of the coordinator.
//!
//! The fairing builds the [RemoteVehicleService] picked in `zeekr.backend`,
//! runs [Coordinator::setup] when the app ignites and makes the coordinator
//! available to the routes as managed state (`&State<Arc<Coordinator>>`).
//! A failed setup aborts the launch. On shutdown the coordinator is torn
//! down, which cancels every background task and persists the stats.

use std::sync::Arc;

use rocket::tokio::sync::Mutex;

use super::config::{BackendConfig, CoordinatorConfig};
use super::fixture::FixtureService;
use super::gateway_api::GatewayApiHandler;
use super::task::Coordinator;
use super::RemoteVehicleService;

pub struct VehicleFairing {
    service: Option<Arc<dyn RemoteVehicleService>>,
    coordinator: Arc<Mutex<Option<Arc<Coordinator>>>>,
}

impl VehicleFairing {
    /// Build the service from the configuration on ignite.
    pub fn new() -> Self {
        Self {
            service: None,
            coordinator: Arc::new(Mutex::new(None)),
        }
    }

    /// Use `service` instead of the configured backend.
    pub fn with_service(service: Arc<dyn RemoteVehicleService>) -> Self {
        Self {
            service: Some(service),
            coordinator: Arc::new(Mutex::new(None)),
        }
    }

    async fn build_service(
        figment: &rocket::figment::Figment,
    ) -> anyhow::Result<Arc<dyn RemoteVehicleService>> {
        let service: Arc<dyn RemoteVehicleService> = match BackendConfig::from_figment(figment)? {
            BackendConfig::Gateway(config) => Arc::new(GatewayApiHandler::new(config)?),
            BackendConfig::Fixture { path } => Arc::new(FixtureService::load(&path).await?),
        };
        Ok(service)
    }

    async fn setup(&self, figment: &rocket::figment::Figment) -> anyhow::Result<Arc<Coordinator>> {
        let config = CoordinatorConfig::from_figment(figment)?;
        let service = match &self.service {
            Some(service) => service.clone(),
            None => Self::build_service(figment).await?,
        };
        let coordinator = Coordinator::setup(service, config).await?;
        coordinator.start().await;
        Ok(coordinator)
    }
}

impl Default for VehicleFairing {
    fn default() -> Self {
        Self::new()
    }
}

#[rocket::async_trait]
impl rocket::fairing::Fairing for VehicleFairing {
    fn info(&self) -> rocket::fairing::Info {
        rocket::fairing::Info {
            name: "Vehicle coordinator",
            kind: rocket::fairing::Kind::Ignite | rocket::fairing::Kind::Shutdown,
        }
    }

    async fn on_ignite(
        &self,
        rocket: rocket::Rocket<rocket::Build>,
    ) -> rocket::fairing::Result<rocket::Rocket<rocket::Build>> {
        match self.setup(rocket.figment()).await {
            Ok(coordinator) => {
                *self.coordinator.lock().await = Some(coordinator.clone());
                Ok(rocket.manage(coordinator))
            }
            Err(e) => {
                log::error!("Vehicle coordinator setup failed: {:#}", e);
                Err(rocket)
            }
        }
    }

    async fn on_shutdown(&self, _rocket: &rocket::Rocket<rocket::Orbit>) {
        if let Some(coordinator) = self.coordinator.lock().await.take() {
            coordinator.shutdown().await;
        }
    }
}
