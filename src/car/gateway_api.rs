use std::future::Future;

use reqwest::StatusCode;
use rocket::tokio::sync::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::GatewayConfig;
use super::error::ServiceError;
use super::status::VehicleStatus;
use super::{
    ChargePlanRequest, RemoteControl, RemoteVehicleService, TravelPlanRequest, VehicleInfo,
};

/// Every gateway response is wrapped in this envelope.
#[derive(Deserialize, Debug)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default = "Option::default")]
    data: Option<T>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    country_code: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
struct LoginData {
    token: String,
}

/// Unwrap an envelope, turning `success: false` into the gateway's message.
fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<Option<T>, ServiceError> {
    let envelope: Envelope<T> = serde_json::from_str(body)
        .map_err(|e| ServiceError::Decode(format!("Failed to parse response: {}", e)))?;
    if envelope.success {
        return Ok(envelope.data);
    }
    let code = envelope
        .code
        .map(|code| match code {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .unwrap_or_else(|| "?".to_string());
    Err(ServiceError::Decode(format!(
        "gateway error {}: {}",
        code,
        envelope.msg.unwrap_or_else(|| "no message".to_string())
    )))
}

/// Attach a JSON body with an explicit content length, which the gateway
/// requires on every POST.
fn json_body(builder: reqwest::RequestBuilder, body: String) -> reqwest::RequestBuilder {
    builder
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(reqwest::header::CONTENT_LENGTH, body.len())
        .body(body)
}

#[derive(Debug, Default)]
struct Session {
    token: Option<String>,
    /// Bumped on every login.
    generation: u64,
}

/// The bearer token, shared by every request of the handler.
#[derive(Debug, Default)]
struct TokenCache(RwLock<Session>);

impl TokenCache {
    async fn current(&self) -> (Option<String>, u64) {
        let session = self.0.read().await;
        (session.token.clone(), session.generation)
    }

    /// Log in again, unless the token issued as `seen` was already replaced.
    ///
    /// The write lock is held across the login, so callers rejected with the
    /// same token queue up behind the first one and reuse its token. `None`
    /// always logs in.
    async fn renew<F, Fut>(&self, seen: Option<u64>, authenticate: F) -> Result<String, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ServiceError>>,
    {
        let mut session = self.0.write().await;
        if let (Some(seen), Some(token)) = (seen, session.token.as_ref()) {
            if session.generation != seen {
                return Ok(token.clone());
            }
        }
        session.token = None;
        let token = authenticate().await?;
        session.token = Some(token.clone());
        session.generation += 1;
        Ok(token)
    }
}

/// The API handler for the JSON gateway in front of the vendor cloud.
///
/// The gateway takes care of the vendor's request signing and region
/// routing; this side only needs a bearer token, obtained from `auth/login`.
/// Reads renew an expired token once on HTTP 401. Commands never retry, so a
/// command is never sent twice.
pub struct GatewayApiHandler {
    config: GatewayConfig,
    base_url: String,
    client: reqwest::Client,
    tokens: TokenCache,
}

impl GatewayApiHandler {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs_f64(config.request_timeout_secs))
            .build()?;
        let base_url = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };
        Ok(Self {
            config,
            base_url,
            client,
            tokens: TokenCache::default(),
        })
    }

    /// A GET for `endpoint`, or a POST when there is a body.
    fn build_request(
        &self,
        endpoint: &str,
        token: Option<&str>,
        body: Option<String>,
    ) -> Result<reqwest::Request, reqwest::Error> {
        let url = format!("{}{}", self.base_url, endpoint);
        let method = match body {
            Some(_) => reqwest::Method::POST,
            None => reqwest::Method::GET,
        };
        let mut builder = self
            .client
            .request(method, &url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = json_body(builder, body);
        }
        builder.build()
    }

    async fn send(
        &self,
        endpoint: &str,
        token: Option<&str>,
        body: Option<String>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let request = self.build_request(endpoint, token, body)?;
        self.client.execute(request).await
    }

    /// POST the credentials and return the issued token.
    async fn authenticate(&self) -> Result<String, ServiceError> {
        let body = serde_json::to_string(&LoginRequest {
            username: &self.config.username,
            password: &self.config.password,
            country_code: self.config.country_code.as_deref(),
        })
        .map_err(|e| ServiceError::Decode(format!("Failed to encode login: {}", e)))?;
        let response = self.send("auth/login", None, Some(body)).await?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(ServiceError::Auth(format!("HTTP {}", response.status())));
        }
        let content = response.error_for_status()?.text().await?;
        let data: Option<LoginData> = decode_envelope(&content).map_err(|e| match e {
            ServiceError::Decode(reason) => ServiceError::Auth(reason),
            other => other,
        })?;
        let token = data
            .map(|d| d.token)
            .ok_or_else(|| ServiceError::Auth("login returned no token".to_string()))?;
        log::info!("Gateway: logged in as {}", self.config.username);
        Ok(token)
    }

    /// GET `endpoint`, logging in again once if the token expired.
    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Option<T>, ServiceError> {
        let (token, generation) = self.tokens.current().await;
        let mut response = self.send(endpoint, token.as_deref(), None).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            log::info!("Gateway: token rejected on {}, renewing", endpoint);
            let token = self
                .tokens
                .renew(Some(generation), || self.authenticate())
                .await?;
            response = self.send(endpoint, Some(&token), None).await?;
        }
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ServiceError::Auth("token rejected after re-login".to_string()));
        }
        let content = response.error_for_status()?.text().await?;
        decode_envelope(&content)
    }

    async fn fetch_status(&self, vin: &str, endpoint: &str) -> Result<VehicleStatus, ServiceError> {
        let data: Option<Value> = self.get(endpoint).await.map_err(|e| fetch_error(vin, e))?;
        match data {
            Some(value) => VehicleStatus::try_from(value).map_err(|other| ServiceError::Fetch {
                vin: vin.to_string(),
                reason: format!("expected an object, got {}", other),
            }),
            None => Ok(VehicleStatus::new()),
        }
    }

    async fn command<B: Serialize>(
        &self,
        vin: &str,
        service_id: &str,
        endpoint: &str,
        body: &B,
    ) -> Result<(), ServiceError> {
        let body = serde_json::to_string(body)
            .map_err(|e| ServiceError::Decode(format!("Failed to encode request: {}", e)))?;
        log::info!("Gateway: Sending {} to {}", service_id, endpoint);
        let (token, _) = self.tokens.current().await;
        let response = self.send(endpoint, token.as_deref(), Some(body)).await?;
        let status = response.status();
        let content = response.text().await?;
        log::debug!("Gateway: Received response: {}", content);
        let rejected = |reason: String| ServiceError::RemoteCommand {
            vin: vin.to_string(),
            service_id: service_id.to_string(),
            reason,
        };
        if !status.is_success() {
            return Err(rejected(format!("HTTP {}", status)));
        }
        decode_envelope::<Value>(&content)
            .map(|_| ())
            .map_err(|e| rejected(e.to_string()))
    }
}

fn fetch_error(vin: &str, error: ServiceError) -> ServiceError {
    match error {
        ServiceError::Decode(reason) => ServiceError::Fetch {
            vin: vin.to_string(),
            reason,
        },
        other => other,
    }
}

#[rocket::async_trait]
impl RemoteVehicleService for GatewayApiHandler {
    fn get_name(&self) -> &'static str {
        "gateway"
    }

    async fn login(&self) -> Result<(), ServiceError> {
        self.tokens
            .renew(None, || self.authenticate())
            .await
            .map(|_| ())
    }

    async fn list_vehicles(&self) -> Result<Vec<VehicleInfo>, ServiceError> {
        Ok(self.get("vehicles").await?.unwrap_or_default())
    }

    async fn get_status(&self, vin: &str) -> Result<VehicleStatus, ServiceError> {
        self.fetch_status(vin, &format!("vehicles/{}/status", vin))
            .await
    }

    async fn get_charging_status(&self, vin: &str) -> Result<VehicleStatus, ServiceError> {
        self.fetch_status(vin, &format!("vehicles/{}/charging-status", vin))
            .await
    }

    async fn get_charge_plan(&self, vin: &str) -> Result<Option<Value>, ServiceError> {
        self.get(&format!("vehicles/{}/charge-plan", vin))
            .await
            .map_err(|e| fetch_error(vin, e))
    }

    async fn get_travel_plan(&self, vin: &str) -> Result<Option<Value>, ServiceError> {
        self.get(&format!("vehicles/{}/travel-plan", vin))
            .await
            .map_err(|e| fetch_error(vin, e))
    }

    async fn do_remote_control(
        &self,
        vin: &str,
        request: &RemoteControl,
    ) -> Result<(), ServiceError> {
        self.command(
            vin,
            &request.service_id,
            &format!("vehicles/{}/remote-control", vin),
            request,
        )
        .await
    }

    async fn set_charge_plan(
        &self,
        vin: &str,
        request: &ChargePlanRequest,
    ) -> Result<(), ServiceError> {
        self.command(vin, "chargePlan", &format!("vehicles/{}/charge-plan", vin), request)
            .await
    }

    async fn set_travel_plan(
        &self,
        vin: &str,
        request: &TravelPlanRequest,
    ) -> Result<(), ServiceError> {
        self.command(vin, "travelPlan", &format!("vehicles/{}/travel-plan", vin), request)
            .await
    }

    async fn get_trip_trackpoints(
        &self,
        vin: &str,
        report_time: u64,
        trip_id: u64,
    ) -> Result<Vec<Value>, ServiceError> {
        let endpoint = format!(
            "vehicles/{}/trips/{}/trackpoints?reportTime={}",
            vin, trip_id, report_time
        );
        Ok(self
            .get(&endpoint)
            .await
            .map_err(|e| fetch_error(vin, e))?
            .unwrap_or_default())
    }
}
