//! Bounded polling of a status field after a command with a delayed effect.
//!
//! Starting a charge is accepted by the backend long before the charger
//! actually reports it, so the switch polls the charging status until the
//! charger state shows up in the accepted set, or gives up once the timeout
//! is spent.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rocket::tokio::time::sleep;

/// Poll `fetch` until it yields one of `accepted`.
///
/// Each attempt first waits `interval` and adds it to the elapsed time, then
/// fetches. A fetch confirming on call N therefore returns `true` only when
/// `N * interval <= timeout`. Failed attempts are logged and polling goes on.
/// A zero interval means a single immediate attempt.
pub async fn confirm<F, Fut, E>(
    mut fetch: F,
    accepted: &[String],
    timeout: Duration,
    interval: Duration,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>, E>>,
    E: Display,
{
    if interval.is_zero() {
        return attempt(&mut fetch, accepted, 1).await;
    }

    let mut waited = Duration::ZERO;
    let mut attempts = 0;
    while waited + interval <= timeout {
        sleep(interval).await;
        waited += interval;
        attempts += 1;
        if attempt(&mut fetch, accepted, attempts).await {
            log::info!("Confirmed after {} attempt(s), {:?}", attempts, waited);
            return true;
        }
    }
    log::info!(
        "Not confirmed after {} attempt(s) within {:?}",
        attempts,
        timeout
    );
    false
}

async fn attempt<F, Fut, E>(fetch: &mut F, accepted: &[String], n: usize) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>, E>>,
    E: Display,
{
    match fetch().await {
        Ok(Some(value)) => {
            log::debug!("Confirmation attempt {}: observed {:?}", n, value);
            accepted.iter().any(|a| *a == value)
        }
        Ok(None) => {
            log::debug!("Confirmation attempt {}: field missing", n);
            false
        }
        Err(e) => {
            log::info!("Confirmation attempt {} failed: {}", n, e);
            false
        }
    }
}
