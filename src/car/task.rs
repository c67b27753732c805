//! The poll coordinator
//!
//! This module contains the [Coordinator], which owns the status document of
//! every vehicle in the account and keeps it fresh by polling the
//! [RemoteVehicleService] on a fixed interval.
//!
//! Entities never talk to the service on their own for reads: they render
//! from [Coordinator::snapshot]. For writes they go through
//! [Coordinator::dispatch](super::dispatch), which applies an optimistic patch
//! to the same document once the backend accepted the command. The next
//! refresh then replaces the document wholesale, so whatever the backend
//! reports last wins.
//!
//! Background work (the refresh loop, the stats flush loop, delayed refreshes
//! after commands, charging confirmations) is spawned through
//! [Coordinator::spawn_owned], so [Coordinator::shutdown] can abort all of it.
//! The tasks only keep a weak reference to the coordinator and give up once
//! it is gone or shut down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rocket::futures::future::join_all;
use rocket::tokio::sync::{broadcast, Mutex, RwLock};
use rocket::tokio::task::JoinHandle;
use rocket::tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::{CoordinatorConfig, MAX_OPERATION_MINUTES};
use super::dispatch::PendingCommand;
use super::error::{CommandError, ServiceError, SetupError};
use super::fields::{paths, FieldTable};
use super::stats::{RequestStats, StatsSnapshot};
use super::status::{StatusStore, VehicleStatus};
use super::{RemoteVehicleService, VehicleHandle, VehicleInfo};

const NOTIFY_CAPACITY: usize = 64;

/// Why an entity (or a whole vehicle) changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    Refresh,
    Optimistic,
    Confirmed,
    Reverted,
    Setting,
    Poll,
}

/// The "state changed, re-render" notification.
///
/// `vin` is `None` for account-wide changes (settings), `entity` is `None`
/// when the whole vehicle document changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChanged {
    pub vin: Option<String>,
    pub entity: Option<String>,
    pub reason: ChangeReason,
}

impl StateChanged {
    pub fn vehicle(vin: &str, reason: ChangeReason) -> Self {
        Self {
            vin: Some(vin.to_string()),
            entity: None,
            reason,
        }
    }

    pub fn entity(vin: &str, entity: &str, reason: ChangeReason) -> Self {
        Self {
            vin: Some(vin.to_string()),
            entity: Some(entity.to_string()),
            reason,
        }
    }

    pub fn account(entity: &str, reason: ChangeReason) -> Self {
        Self {
            vin: None,
            entity: Some(entity.to_string()),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshFailure {
    pub vin: String,
    pub reason: String,
}

/// What one refresh did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub updated: Vec<String>,
    pub failed: Vec<RefreshFailure>,
    /// The caller joined a refresh that was already running.
    pub coalesced: bool,
    pub finished_at: DateTime<Utc>,
}

/// Numeric settings used by the command tables, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorSettings {
    pub ac_duration: u8,
    pub steering_wheel_duration: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripTrackpoints {
    pub vin: String,
    pub trip_id: u64,
    pub trip_report_time: u64,
    pub count: usize,
    pub trackpoints: Vec<Value>,
}

/// The poll coordinator.
///
/// The vehicle registry is filled once from the service's vehicle list during
/// [Coordinator::setup] and never changes afterwards; the status store has one
/// document per registered VIN for the same reason.
///
/// Refreshes are serialized by `refresh_lock`. A caller that had to wait for
/// the lock while another refresh was running returns that refresh's report
/// instead of fetching again, which is how concurrent requests (the interval
/// tick, a delayed refresh after a command, the poll button) coalesce.
pub struct Coordinator {
    service: Arc<dyn RemoteVehicleService>,
    pub(super) registry: HashMap<String, VehicleHandle>,
    order: Vec<String>,
    pub(super) store: StatusStore,
    pub(super) config: CoordinatorConfig,
    pub(super) stats: RequestStats,
    settings: RwLock<ActuatorSettings>,
    refresh_lock: Mutex<()>,
    refresh_generation: AtomicU64,
    last_report: Mutex<Option<RefreshReport>>,
    latest_poll_time: Mutex<Option<DateTime<Utc>>>,
    pub(super) pending: Mutex<Vec<PendingCommand>>,
    notifier: broadcast::Sender<StateChanged>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Coordinator {
    fn new(
        service: Arc<dyn RemoteVehicleService>,
        vehicles: Vec<VehicleInfo>,
        config: CoordinatorConfig,
        stats: RequestStats,
        settings: ActuatorSettings,
    ) -> Self {
        let mut order = Vec::with_capacity(vehicles.len());
        let mut registry = HashMap::with_capacity(vehicles.len());
        for info in vehicles {
            if registry.contains_key(&info.vin) {
                log::warn!("Vehicle {} listed twice, keeping the first entry", info.vin);
                continue;
            }
            order.push(info.vin.clone());
            registry.insert(info.vin.clone(), VehicleHandle::new(info, service.clone()));
        }
        let store = StatusStore::new(order.iter().cloned());
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);

        Self {
            service,
            registry,
            order,
            store,
            config,
            stats,
            settings: RwLock::new(settings),
            refresh_lock: Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
            last_report: Mutex::new(None),
            latest_poll_time: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            notifier,
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Log in, register the account's vehicles and run the first refresh.
    ///
    /// Any failure here is fatal: without a first successful fetch there is
    /// nothing to derive the entities from. Background loops are not started;
    /// call [Coordinator::start] for that.
    pub async fn setup(
        service: Arc<dyn RemoteVehicleService>,
        config: CoordinatorConfig,
    ) -> Result<Arc<Self>, SetupError> {
        let stats = match config.stats_path.as_deref() {
            Some(path) => RequestStats::load(path).await,
            None => RequestStats::in_memory(),
        };

        log::info!("Logging in to {}", service.get_name());
        stats.inc_request().await;
        service.login().await.map_err(SetupError::Login)?;

        stats.inc_request().await;
        let vehicles = service
            .list_vehicles()
            .await
            .map_err(SetupError::ListVehicles)?;
        if vehicles.is_empty() {
            log::warn!("No vehicles found in account");
        } else {
            log::info!(
                "Found {} vehicle(s): {}",
                vehicles.len(),
                vehicles
                    .iter()
                    .map(|v| v.vin.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let settings = restore_settings(&stats, &config).await;
        let coordinator = Arc::new(Self::new(service, vehicles, config, stats, settings));
        let report = coordinator.refresh_all().await;
        if report.updated.is_empty() && !report.failed.is_empty() {
            return Err(SetupError::FirstRefresh {
                failures: report.failed.len(),
            });
        }
        Ok(coordinator)
    }

    /// Start the refresh loop and the stats flush loop.
    pub async fn start(self: &Arc<Self>) {
        let polling_interval = self.config.polling_interval();
        self.spawn_periodic(polling_interval, |coordinator| async move {
            let Ok(report) = coordinator.refresh().await else {
                return;
            };
            for failure in &report.failed {
                log::warn!(
                    "Scheduled refresh failed for {}, keeping stale data: {}",
                    failure.vin,
                    failure.reason
                );
            }
        })
        .await;

        let flush_interval = self.config.stats_flush_interval();
        self.spawn_periodic(flush_interval, |coordinator| async move {
            if let Err(e) = coordinator.stats.flush().await {
                log::error!("Failed to persist request stats: {:#}", e);
            }
        })
        .await;

        log::info!(
            "Coordinator started, polling every {:?}",
            polling_interval
        );
    }

    async fn spawn_periodic<F, Fut>(self: &Arc<Self>, period: Duration, mut job: F)
    where
        F: FnMut(Arc<Coordinator>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        self.spawn_owned(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(coordinator) = live(&weak) else {
                    break;
                };
                job(coordinator).await;
            }
        })
        .await;
    }

    /// Spawn a task whose lifetime is bound to this coordinator.
    pub(super) async fn spawn_owned<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return;
        }
        let handle = rocket::tokio::spawn(task);
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        if self.is_shut_down() {
            handle.abort();
            return;
        }
        tasks.push(handle);
    }

    /// Refresh after `delay`, unless the coordinator is torn down first.
    pub async fn schedule_refresh(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.spawn_owned(async move {
            sleep(delay).await;
            if let Some(coordinator) = live(&weak) {
                if let Err(e) = coordinator.refresh().await {
                    log::debug!("Delayed refresh dropped: {}", e);
                }
            }
        })
        .await;
    }

    /// Fetch every vehicle and replace its document.
    ///
    /// A vehicle whose fetch fails keeps its previous document. When another
    /// refresh is in flight this waits for it and returns its report, marked
    /// as coalesced. Refused once the coordinator is torn down.
    pub async fn refresh(&self) -> Result<RefreshReport, CommandError> {
        if self.is_shut_down() {
            return Err(CommandError::ShutDown);
        }
        Ok(self.refresh_all().await)
    }

    async fn refresh_all(&self) -> RefreshReport {
        let observed = self.refresh_generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.refresh_generation.load(Ordering::Acquire) != observed {
            if let Some(report) = self.last_report.lock().await.clone() {
                log::debug!("Refresh request coalesced into the one that just finished");
                return RefreshReport {
                    coalesced: true,
                    ..report
                };
            }
        }

        let results = join_all(self.order.iter().map(|vin| async move {
            (vin.clone(), self.refresh_vehicle(vin).await)
        }))
        .await;

        let mut report = RefreshReport {
            updated: Vec::new(),
            failed: Vec::new(),
            coalesced: false,
            finished_at: Utc::now(),
        };
        for (vin, result) in results {
            match result {
                Ok(()) => report.updated.push(vin),
                Err(e) => {
                    log::warn!("Could not refresh {}: {}", vin, e);
                    report.failed.push(RefreshFailure {
                        vin,
                        reason: e.to_string(),
                    });
                }
            }
        }

        *self.last_report.lock().await = Some(report.clone());
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        report
    }

    async fn refresh_vehicle(&self, vin: &str) -> Result<(), ServiceError> {
        self.stats.inc_request().await;
        let status = self.service.get_status(vin).await?;
        let charge_plan = self.fetch_plan(vin, paths::CHARGE_PLAN).await;
        let travel_plan = self.fetch_plan(vin, paths::TRAVEL_PLAN).await;

        self.store
            .replace_with(vin, |previous| {
                let mut next = status;
                merge_plan(&mut next, previous, paths::CHARGE_PLAN, charge_plan);
                merge_plan(&mut next, previous, paths::TRAVEL_PLAN, travel_plan);
                next
            })
            .await;

        self.pending
            .lock()
            .await
            .retain(|p| p.vin != vin || p.awaiting_confirmation);
        self.notify(StateChanged::vehicle(vin, ChangeReason::Refresh));
        Ok(())
    }

    async fn fetch_plan(&self, vin: &str, key: &str) -> Result<Option<Value>, ServiceError> {
        self.stats.inc_request().await;
        let result = match key {
            paths::CHARGE_PLAN => self.service.get_charge_plan(vin).await,
            _ => self.service.get_travel_plan(vin).await,
        };
        if let Err(ref e) = result {
            log::info!("Could not fetch {} for {}, keeping the previous one: {}", key, vin, e);
        }
        result
    }

    /// "Poll vehicle data": remember when it was asked for and refresh now.
    pub async fn request_poll(&self) -> Result<RefreshReport, CommandError> {
        if self.is_shut_down() {
            return Err(CommandError::ShutDown);
        }
        let now = Utc::now();
        *self.latest_poll_time.lock().await = Some(now);
        for vin in &self.order {
            self.notify(StateChanged::entity(vin, "poll_vehicle_data", ChangeReason::Poll));
        }
        self.refresh().await
    }

    pub async fn get_trip_trackpoints(
        &self,
        vin: &str,
        report_time: u64,
        trip_id: u64,
    ) -> Result<TripTrackpoints, CommandError> {
        let vehicle = self
            .get_vehicle(vin)
            .ok_or_else(|| CommandError::NotFound(vin.to_string()))?;
        self.stats.inc_request().await;
        let trackpoints = vehicle.get_trip_trackpoints(report_time, trip_id).await?;
        log::debug!("Fetched {} trackpoints for trip {}", trackpoints.len(), trip_id);
        Ok(TripTrackpoints {
            vin: vin.to_string(),
            trip_id,
            trip_report_time: report_time,
            count: trackpoints.len(),
            trackpoints,
        })
    }

    /// Tear down: stop every owned task and persist the stats.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        log::info!("Shutting down coordinator, aborting {} task(s)", tasks.len());
        for task in tasks {
            task.abort();
        }
        if let Err(e) = self.stats.flush().await {
            log::error!("Failed to persist request stats on shutdown: {:#}", e);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn get_vehicle(&self, vin: &str) -> Option<&VehicleHandle> {
        self.registry.get(vin)
    }

    pub fn vehicles(&self) -> Vec<VehicleInfo> {
        self.order
            .iter()
            .filter_map(|vin| self.registry.get(vin))
            .map(|handle| handle.info().clone())
            .collect()
    }

    pub async fn snapshot(&self, vin: &str) -> Option<VehicleStatus> {
        self.store.get_snapshot(vin).await
    }

    pub fn fields(&self) -> &FieldTable {
        &self.config.fields
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn settings(&self) -> ActuatorSettings {
        *self.settings.read().await
    }

    pub(super) async fn update_settings<F>(&self, update: F) -> ActuatorSettings
    where
        F: FnOnce(&mut ActuatorSettings),
    {
        let updated = {
            let mut settings = self.settings.write().await;
            update(&mut settings);
            *settings
        };
        self.stats.save_settings(updated).await;
        updated
    }

    pub async fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot().await
    }

    pub async fn latest_poll_time(&self) -> Option<DateTime<Utc>> {
        *self.latest_poll_time.lock().await
    }

    pub async fn last_report(&self) -> Option<RefreshReport> {
        self.last_report.lock().await.clone()
    }

    pub async fn pending_commands(&self, vin: &str) -> Vec<PendingCommand> {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|p| p.vin == vin)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChanged> {
        self.notifier.subscribe()
    }

    pub(super) fn notify(&self, change: StateChanged) {
        // Nobody listening is fine.
        let _ = self.notifier.send(change);
    }
}

/// The settings saved by a previous run, or the configured defaults.
async fn restore_settings(stats: &RequestStats, config: &CoordinatorConfig) -> ActuatorSettings {
    let defaults = ActuatorSettings {
        ac_duration: config.ac_duration,
        steering_wheel_duration: config.steering_wheel_duration,
    };
    match stats.saved_settings().await {
        Some(saved)
            if saved.ac_duration <= MAX_OPERATION_MINUTES
                && saved.steering_wheel_duration <= MAX_OPERATION_MINUTES =>
        {
            log::info!("Restored settings from the previous run: {:?}", saved);
            saved
        }
        Some(saved) => {
            log::warn!("Ignoring out of range saved settings {:?}", saved);
            defaults
        }
        None => defaults,
    }
}

/// Upgrade a task's weak reference, unless the coordinator is gone or torn down.
pub(super) fn live(weak: &Weak<Coordinator>) -> Option<Arc<Coordinator>> {
    weak.upgrade().filter(|c| !c.is_shut_down())
}

/// Put the freshly fetched plan under `key`. A failed plan fetch carries the
/// previous subtree over; a plan that does not exist leaves whatever the
/// status payload had.
fn merge_plan(
    next: &mut VehicleStatus,
    previous: &VehicleStatus,
    key: &str,
    fetched: Result<Option<Value>, ServiceError>,
) {
    match fetched {
        Ok(Some(plan)) => next.insert(key, plan),
        Ok(None) => {}
        Err(_) => {
            if let Some(plan) = previous.as_map().get(key) {
                next.insert(key, plan.clone());
            }
        }
    }
}
