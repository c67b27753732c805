use std::sync::Arc;

use governor::Quota;
use rocket::figment::Figment;
use rocket::http::Status;
use rocket::response::stream::{Event, EventStream};
use rocket::response::Responder;
use rocket::serde::json::{json, Json};
use rocket::serde::{Deserialize, Serialize};
use rocket::tokio::select;
use rocket::tokio::sync::broadcast::error::RecvError;
use rocket::{catchers, get, launch, post, put, routes, Build, Rocket, Shutdown, State};
use rocket_governor::{rocket_governor_catcher, RocketGovernable, RocketGovernor};

mod car;

use car::dispatch::{DispatchOutcome, PendingCommand};
use car::entities::button::ButtonKind;
use car::entities::climate::HvacMode;
use car::entities::number::NumberKind;
use car::entities::switch::SwitchKind;
use car::entities::time::TimeKind;
use car::entities::{self, EntityState};
use car::error::CommandError;
use car::fairing::VehicleFairing;
use car::stats::StatsSnapshot;
use car::status::VehicleStatus;
use car::task::{Coordinator, RefreshReport, TripTrackpoints};
use car::VehicleInfo;

pub struct RateLimitGuard;

impl<'r> RocketGovernable<'r> for RateLimitGuard {
    fn quota(_method: rocket_governor::Method, _route_name: &str) -> governor::Quota {
        Quota::per_second(Self::nonzero(2u32))
    }
}

type Coord = State<Arc<Coordinator>>;

/// How a failed request is reported.
#[derive(Debug)]
enum ApiError {
    Command(CommandError),
    UnknownEntity(String),
}

impl From<CommandError> for ApiError {
    fn from(error: CommandError) -> Self {
        ApiError::Command(error)
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let (status, message) = match &self {
            ApiError::Command(error) => {
                let status = match error {
                    CommandError::Remote(_) => Status::BadGateway,
                    CommandError::InvalidValue(_) => Status::UnprocessableEntity,
                    CommandError::NotFound(_) => Status::NotFound,
                    CommandError::ShutDown => Status::ServiceUnavailable,
                };
                (status, error.to_string())
            }
            ApiError::UnknownEntity(key) => (Status::NotFound, format!("no entity {:?}", key)),
        };
        log::warn!("{} {} failed: {}", request.method(), request.uri(), message);
        (status, Json(json!({ "error": message }))).respond_to(request)
    }
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct CommandResponse {
    vin: String,
    entity: String,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    confirmed: Option<bool>,
}

impl CommandResponse {
    /// With `wait`, hold the response until a pending confirmation resolves.
    async fn new(vin: &str, entity: &str, outcome: DispatchOutcome, wait: bool) -> Self {
        let label = outcome.label();
        let confirmed = match outcome {
            DispatchOutcome::AwaitingConfirmation(handle) if wait => handle.wait().await,
            _ => None,
        };
        Self {
            vin: vin.to_string(),
            entity: entity.to_string(),
            outcome: label,
            confirmed,
        }
    }
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct TimeValue {
    value: String,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct NumberValue {
    value: f64,
}

fn parse_on_off(raw: &str) -> Result<bool, ApiError> {
    match raw {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(ApiError::Command(CommandError::InvalidValue(format!(
            "{:?} is neither on nor off",
            other
        )))),
    }
}

/************************* ROUTES *************************/

#[get("/")]
async fn index(_ratelimit: RocketGovernor<'_, RateLimitGuard>) -> String {
    log::info!("Got to index!");
    "PONG".to_string()
}

#[get("/vehicles")]
fn list_vehicles(coordinator: &Coord) -> Json<Vec<VehicleInfo>> {
    Json(coordinator.vehicles())
}

#[get("/vehicles/<vin>/status")]
async fn vehicle_status(coordinator: &Coord, vin: &str) -> Option<Json<VehicleStatus>> {
    coordinator.snapshot(vin).await.map(Json)
}

#[get("/vehicles/<vin>/entities")]
async fn vehicle_entities(coordinator: &Coord, vin: &str) -> Option<Json<Vec<EntityState>>> {
    entities::render(coordinator, vin).await.map(Json)
}

#[get("/vehicles/<vin>/pending")]
async fn vehicle_pending(coordinator: &Coord, vin: &str) -> Option<Json<Vec<PendingCommand>>> {
    coordinator.get_vehicle(vin)?;
    Some(Json(coordinator.pending_commands(vin).await))
}

#[post("/vehicles/<vin>/switch/<kind>/<state>?<wait>")]
async fn switch_command(
    coordinator: &Coord,
    vin: &str,
    kind: &str,
    state: &str,
    wait: Option<bool>,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
) -> Result<Json<CommandResponse>, ApiError> {
    let switch = SwitchKind::from_key(kind).ok_or_else(|| ApiError::UnknownEntity(kind.to_string()))?;
    let on = parse_on_off(state)?;
    let outcome = entities::switch::turn(coordinator, vin, switch, on).await?;
    Ok(Json(
        CommandResponse::new(vin, switch.key(), outcome, wait.unwrap_or(false)).await,
    ))
}

#[post("/vehicles/<vin>/button/<kind>")]
async fn button_press(
    coordinator: &Coord,
    vin: &str,
    kind: &str,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
) -> Result<Json<CommandResponse>, ApiError> {
    let button = ButtonKind::from_key(kind).ok_or_else(|| ApiError::UnknownEntity(kind.to_string()))?;
    let outcome = entities::button::press(coordinator, vin, button).await?;
    Ok(Json(CommandResponse::new(vin, button.key(), outcome, false).await))
}

#[post("/vehicles/<vin>/sunshade/<action>")]
async fn sunshade_command(
    coordinator: &Coord,
    vin: &str,
    action: &str,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
) -> Result<Json<CommandResponse>, ApiError> {
    let open = match action {
        "open" => true,
        "close" => false,
        other => return Err(ApiError::UnknownEntity(other.to_string())),
    };
    let outcome = entities::cover::set(coordinator, vin, open).await?;
    Ok(Json(
        CommandResponse::new(vin, entities::cover::KEY, outcome, false).await,
    ))
}

#[post("/vehicles/<vin>/climate/<mode>")]
async fn climate_command(
    coordinator: &Coord,
    vin: &str,
    mode: &str,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
) -> Result<Json<CommandResponse>, ApiError> {
    let mode = HvacMode::from_key(mode).ok_or_else(|| ApiError::UnknownEntity(mode.to_string()))?;
    let outcome = entities::climate::set_mode(coordinator, vin, mode).await?;
    Ok(Json(
        CommandResponse::new(vin, entities::climate::KEY, outcome, false).await,
    ))
}

#[put("/vehicles/<vin>/time/<kind>", data = "<time>")]
async fn set_time(
    coordinator: &Coord,
    vin: &str,
    kind: &str,
    time: Json<TimeValue>,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
) -> Result<Json<CommandResponse>, ApiError> {
    let kind = TimeKind::from_key(kind).ok_or_else(|| ApiError::UnknownEntity(kind.to_string()))?;
    let outcome = entities::time::set(coordinator, vin, kind, &time.value).await?;
    Ok(Json(CommandResponse::new(vin, kind.key(), outcome, false).await))
}

#[get("/vehicles/<vin>/trips/<trip_id>/trackpoints?<report_time>")]
async fn trip_trackpoints(
    coordinator: &Coord,
    vin: &str,
    trip_id: u64,
    report_time: u64,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
) -> Result<Json<TripTrackpoints>, ApiError> {
    Ok(Json(
        coordinator
            .get_trip_trackpoints(vin, report_time, trip_id)
            .await?,
    ))
}

#[get("/numbers")]
async fn list_numbers(coordinator: &Coord) -> Json<Vec<EntityState>> {
    Json(entities::number::render_all(coordinator).await)
}

#[put("/numbers/<kind>", data = "<number>")]
async fn set_number(
    coordinator: &Coord,
    kind: &str,
    number: Json<NumberValue>,
) -> Result<Json<EntityState>, ApiError> {
    let kind = NumberKind::from_key(kind).ok_or_else(|| ApiError::UnknownEntity(kind.to_string()))?;
    Ok(Json(
        entities::number::set(coordinator, kind, number.value).await?,
    ))
}

#[post("/refresh")]
async fn refresh(
    coordinator: &Coord,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
) -> Result<Json<RefreshReport>, ApiError> {
    Ok(Json(coordinator.refresh().await?))
}

#[get("/refresh")]
async fn last_refresh(coordinator: &Coord) -> Option<Json<RefreshReport>> {
    coordinator.last_report().await.map(Json)
}

#[get("/stats")]
async fn stats(coordinator: &Coord) -> Json<StatsSnapshot> {
    Json(coordinator.stats().await)
}

/// Server-sent events, one per state change, until the client or the server
/// goes away.
#[get("/events")]
fn events(coordinator: &Coord, mut end: Shutdown) -> EventStream![] {
    let mut changes = coordinator.subscribe();
    EventStream! {
        loop {
            let change = select! {
                received = changes.recv() => match received {
                    Ok(change) => change,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Event stream lagged, skipped {} change(s)", skipped);
                        continue;
                    }
                },
                _ = &mut end => break,
            };
            yield Event::json(&change).event("state_changed");
        }
    }
}

fn build(figment: Figment, fairing: VehicleFairing) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(fairing)
        .mount(
            "/",
            routes![
                index,
                list_vehicles,
                vehicle_status,
                vehicle_entities,
                vehicle_pending,
                switch_command,
                button_press,
                sunshade_command,
                climate_command,
                set_time,
                trip_trackpoints,
                list_numbers,
                set_number,
                refresh,
                last_refresh,
                stats,
                events
            ],
        )
        .register("/", catchers![rocket_governor_catcher])
}

#[launch]
async fn rocket() -> _ {
    build(rocket::Config::figment(), VehicleFairing::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use car::mock::{charger_status, MockService};
    use rocket::http::ContentType;
    use rocket::local::asynchronous::{Client, LocalRequest};
    use rocket::serde::json::Value;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicU16, Ordering};

    fn figment() -> Figment {
        Figment::from(rocket::Config::debug_default())
            .merge(("log_level", "off"))
            .merge(("zeekr.polling_interval_secs", 3600.0))
            .merge(("zeekr.settle_delay_secs", 3600.0))
            .merge(("zeekr.sentry_settle_delay_secs", 3600.0))
            .merge(("zeekr.plan_settle_delay_secs", 3600.0))
            .merge(("zeekr.confirm_timeout_secs", 0.05))
            .merge(("zeekr.confirm_interval_secs", 0.01))
    }

    async fn client(mock: &Arc<MockService>) -> Client {
        Client::tracked(build(figment(), VehicleFairing::with_service(mock.clone())))
            .await
            .unwrap()
    }

    /// Give every governed request its own address so the per-client quota
    /// never kicks in across tests.
    fn governed(request: LocalRequest<'_>) -> LocalRequest<'_> {
        static NEXT: AtomicU16 = AtomicU16::new(1);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, (n >> 8) as u8, (n & 0xff) as u8));
        request.remote(SocketAddr::new(ip, 8000))
    }

    fn entity<'a>(entities: &'a Value, key: &str) -> &'a Value {
        entities
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["key"] == key)
            .unwrap()
    }

    #[rocket::async_test]
    async fn index_answers_pong() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        let client = client(&mock).await;
        let response = governed(client.get("/")).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_string().await.unwrap(), "PONG");
    }

    #[rocket::async_test]
    async fn setup_failure_aborts_launch() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        mock.fail_login();
        let result =
            Client::tracked(build(figment(), VehicleFairing::with_service(mock.clone()))).await;
        assert!(result.is_err());
        // rocket::Error panics on drop unless inspected; mark it handled.
        if let Err(e) = &result {
            let _ = e.kind();
        }
    }

    #[rocket::async_test]
    async fn lists_vehicles_and_their_documents() {
        let mock = MockService::with_vehicles(&["VIN1", "VIN2"]);
        mock.set_status("VIN1", charger_status("2"));
        let client = client(&mock).await;

        let vehicles: Value = client.get("/vehicles").dispatch().await.into_json().await.unwrap();
        assert_eq!(vehicles[0]["vin"], "VIN1");
        assert_eq!(vehicles[1]["vin"], "VIN2");

        let status: Value = client
            .get("/vehicles/VIN1/status")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(
            status["additionalVehicleStatus"]["electricVehicleStatus"]["chargerState"],
            "2"
        );

        let entities: Value = client
            .get("/vehicles/VIN1/entities")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(entity(&entities, "charging")["state"], "on");

        let empty: Value = client
            .get("/vehicles/VIN2/entities")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(entity(&empty, "charging")["state"], "unavailable");

        for uri in ["/vehicles/NOPE/status", "/vehicles/NOPE/entities", "/vehicles/NOPE/pending"] {
            assert_eq!(client.get(uri).dispatch().await.status(), Status::NotFound);
        }
    }

    #[rocket::async_test]
    async fn switch_command_is_visible_right_away() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        mock.set_status("VIN1", charger_status("25"));
        let client = client(&mock).await;

        let response = governed(client.post("/vehicles/VIN1/switch/defrost/on"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body["outcome"], "applied");
        assert_eq!(body["entity"], "defrost");
        assert_eq!(mock.controls().len(), 1);

        let entities: Value = client
            .get("/vehicles/VIN1/entities")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(entity(&entities, "defrost")["state"], "on");

        let pending: Value = client
            .get("/vehicles/VIN1/pending")
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(pending[0]["entity"], "defrost");
    }

    #[rocket::async_test]
    async fn charging_can_wait_for_its_confirmation() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        mock.set_status("VIN1", charger_status("25"));
        mock.set_charging_status("VIN1", json!({"chargerState": "2"}));
        let client = client(&mock).await;

        let body: Value = governed(client.post("/vehicles/VIN1/switch/charging/on?wait=true"))
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(body["outcome"], "awaiting_confirmation");
        assert_eq!(body["confirmed"], true);
    }

    #[rocket::async_test]
    async fn command_failures_map_to_statuses() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        mock.set_status("VIN1", charger_status("25"));
        let client = client(&mock).await;

        let unknown_kind = governed(client.post("/vehicles/VIN1/switch/warp_drive/on"))
            .dispatch()
            .await;
        assert_eq!(unknown_kind.status(), Status::NotFound);

        let bad_state = governed(client.post("/vehicles/VIN1/switch/defrost/maybe"))
            .dispatch()
            .await;
        assert_eq!(bad_state.status(), Status::UnprocessableEntity);

        let bad_time = governed(client.put("/vehicles/VIN1/time/charge_plan_start"))
            .header(ContentType::JSON)
            .body(r#"{"value": "25:99"}"#)
            .dispatch()
            .await;
        assert_eq!(bad_time.status(), Status::UnprocessableEntity);

        let unknown_vin: Value = governed(client.post("/vehicles/NOPE/sunshade/open"))
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(unknown_vin["outcome"], "skipped");

        mock.reject_commands();
        let rejected = governed(client.post("/vehicles/VIN1/climate/heat_cool"))
            .dispatch()
            .await;
        assert_eq!(rejected.status(), Status::BadGateway);
        let body: Value = rejected.into_json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("ZAF"));
    }

    #[rocket::async_test]
    async fn numbers_are_validated() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        let client = client(&mock).await;

        let too_long = client
            .put("/numbers/ac_duration")
            .header(ContentType::JSON)
            .body(r#"{"value": 16}"#)
            .dispatch()
            .await;
        assert_eq!(too_long.status(), Status::UnprocessableEntity);

        let set: Value = client
            .put("/numbers/ac_duration")
            .header(ContentType::JSON)
            .body(r#"{"value": 8}"#)
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(set["state"], 8);

        let numbers: Value = client.get("/numbers").dispatch().await.into_json().await.unwrap();
        assert_eq!(entity(&numbers, "ac_duration")["state"], 8);
    }

    #[rocket::async_test]
    async fn refresh_reports_and_counts_requests() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        let client = client(&mock).await;

        let report: Value = governed(client.post("/refresh"))
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(report["updated"], json!(["VIN1"]));
        assert_eq!(report["coalesced"], false);

        let last: Value = client.get("/refresh").dispatch().await.into_json().await.unwrap();
        assert_eq!(last["finished_at"], report["finished_at"]);

        let stats: Value = client.get("/stats").dispatch().await.into_json().await.unwrap();
        assert!(stats["requests_total"].as_u64().unwrap() > 0);

        let coordinator = client.rocket().state::<Arc<Coordinator>>().unwrap();
        coordinator.shutdown().await;
        let refused = governed(client.post("/refresh")).dispatch().await;
        assert_eq!(refused.status(), Status::ServiceUnavailable);
    }

    #[rocket::async_test]
    async fn trackpoints_for_a_trip() {
        let mock = MockService::with_vehicles(&["VIN1"]);
        mock.set_trackpoints(vec![json!({"latitude": 52.1, "longitude": 4.3})]);
        let client = client(&mock).await;

        let trip: Value = governed(client.get("/vehicles/VIN1/trips/42/trackpoints?report_time=1700000000"))
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap();
        assert_eq!(trip["trip_id"], 42);
        assert_eq!(trip["count"], 1);

        let missing = governed(client.get("/vehicles/NOPE/trips/42/trackpoints?report_time=1"))
            .dispatch()
            .await;
        assert_eq!(missing.status(), Status::NotFound);
    }
}
