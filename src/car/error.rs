//! Error taxonomy for the remote vehicle service and the coordinator.
//!
//! Fetch failures stay inside the refresh loop (they are recorded per vehicle
//! and never abort the other vehicles), command failures travel back to the
//! caller that issued the command, and setup failures abort the launch.

use thiserror::Error;

/// Errors reported by a [RemoteVehicleService](super::RemoteVehicleService)
/// implementation.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Bad credentials or an expired session that could not be renewed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A status read for one vehicle failed.
    #[error("status fetch for {vin} failed: {reason}")]
    Fetch { vin: String, reason: String },

    /// The backend refused a remote command.
    #[error("remote command {service_id} rejected for {vin}: {reason}")]
    RemoteCommand {
        vin: String,
        service_id: String,
        reason: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Fatal errors while setting up the coordinator.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("could not log in: {0}")]
    Login(#[source] ServiceError),

    #[error("could not list vehicles: {0}")]
    ListVehicles(#[source] ServiceError),

    /// Every registered vehicle failed its first status fetch.
    #[error("first refresh failed for every vehicle ({failures} failures)")]
    FirstRefresh { failures: usize },
}

/// Errors surfaced to whoever issued a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Remote(#[from] ServiceError),

    #[error("vehicle {0} not found")]
    NotFound(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("coordinator has been shut down")]
    ShutDown,
}
