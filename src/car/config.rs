//! Configuration of the coordinator, read from the Rocket figment (the
//! `zeekr` section of `Rocket.toml`, or `ROCKET_ZEEKR` environment values).

use std::path::PathBuf;
use std::time::Duration;

use rocket::figment::Figment;
use serde::Deserialize;

use super::fields::FieldTable;

/// The upper bound of the AC and steering wheel durations, in minutes.
pub const MAX_OPERATION_MINUTES: u8 = 15;

/// Which [RemoteVehicleService](super::RemoteVehicleService) to build.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Gateway(GatewayConfig),
    Fixture { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,
}

fn default_request_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub polling_interval_secs: f64,
    pub settle_delay_secs: f64,
    pub sentry_settle_delay_secs: f64,
    pub plan_settle_delay_secs: f64,
    pub confirm_timeout_secs: f64,
    pub confirm_interval_secs: f64,
    pub stats_path: Option<PathBuf>,
    pub stats_flush_interval_secs: f64,
    pub ac_duration: u8,
    pub steering_wheel_duration: u8,
    pub fields: FieldTable,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 300.0,
            settle_delay_secs: 5.0,
            sentry_settle_delay_secs: 10.0,
            plan_settle_delay_secs: 2.0,
            confirm_timeout_secs: 30.0,
            confirm_interval_secs: 2.0,
            stats_path: None,
            stats_flush_interval_secs: 300.0,
            ac_duration: MAX_OPERATION_MINUTES,
            steering_wheel_duration: MAX_OPERATION_MINUTES,
            fields: FieldTable::default(),
        }
    }
}

impl BackendConfig {
    pub fn from_figment(figment: &Figment) -> anyhow::Result<Self> {
        figment
            .extract_inner("zeekr.backend")
            .map_err(|e| anyhow::anyhow!("Invalid zeekr.backend configuration: {}", e))
    }
}

impl CoordinatorConfig {
    /// Extract and validate the `zeekr` section. Without one, the defaults
    /// apply.
    pub fn from_figment(figment: &Figment) -> anyhow::Result<Self> {
        if figment.find_value("zeekr").is_err() {
            return Ok(Self::default());
        }
        let config: Self = figment
            .extract_inner("zeekr")
            .map_err(|e| anyhow::anyhow!("Invalid zeekr configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let intervals = [
            ("polling_interval_secs", self.polling_interval_secs),
            ("settle_delay_secs", self.settle_delay_secs),
            ("sentry_settle_delay_secs", self.sentry_settle_delay_secs),
            ("plan_settle_delay_secs", self.plan_settle_delay_secs),
            ("confirm_timeout_secs", self.confirm_timeout_secs),
            ("confirm_interval_secs", self.confirm_interval_secs),
            ("stats_flush_interval_secs", self.stats_flush_interval_secs),
        ];
        for (name, value) in intervals {
            if !value.is_finite() || value <= 0.0 {
                anyhow::bail!("{} must be a positive number of seconds, got {}", name, value);
            }
        }
        for (name, value) in [
            ("ac_duration", self.ac_duration),
            ("steering_wheel_duration", self.steering_wheel_duration),
        ] {
            if value > MAX_OPERATION_MINUTES {
                anyhow::bail!(
                    "{} must be at most {} minutes, got {}",
                    name,
                    MAX_OPERATION_MINUTES,
                    value
                );
            }
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs_f64(self.polling_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.settle_delay_secs)
    }

    pub fn sentry_settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.sentry_settle_delay_secs)
    }

    pub fn plan_settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.plan_settle_delay_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.confirm_timeout_secs)
    }

    pub fn confirm_interval(&self) -> Duration {
        Duration::from_secs_f64(self.confirm_interval_secs)
    }

    pub fn stats_flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.stats_flush_interval_secs)
    }
}
