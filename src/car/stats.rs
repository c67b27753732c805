//! Request statistics.
//!
//! Every call to the vendor backend counts as a request and every command
//! issued by an entity counts as an invoke. The counters are kept in memory,
//! flushed to a JSON file on an interval and on shutdown, and reloaded on the
//! next start so the daily totals survive restarts. The same file keeps the
//! last duration settings, which are restored the same way.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use chrono::{DateTime, Local, NaiveDate, Utc};
use rocket::tokio::{fs, sync::Mutex};
use serde::{Deserialize, Serialize};

use super::task::ActuatorSettings;

/// The persisted counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub invokes_total: u64,
    pub requests_today: u64,
    pub invokes_today: u64,
    /// The local day `requests_today` and `invokes_today` belong to.
    pub day: Option<NaiveDate>,
    pub last_flushed: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    fn roll_over(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.requests_today = 0;
            self.invokes_today = 0;
            self.day = Some(today);
        }
    }
}

/// The file layout: the counters at the top level, so the report tool can
/// read them directly, and the settings next to them.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StatsFile {
    #[serde(flatten)]
    counters: StatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    settings: Option<ActuatorSettings>,
}

pub struct RequestStats {
    path: Option<PathBuf>,
    counters: Mutex<StatsSnapshot>,
    settings: Mutex<Option<ActuatorSettings>>,
    dirty: AtomicBool,
}

impl RequestStats {
    /// Counters that are never written anywhere.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            counters: Mutex::new(StatsSnapshot::default()),
            settings: Mutex::new(None),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the counters from `path`. A missing file starts from zero; an
    /// unreadable one is logged and also starts from zero.
    pub async fn load(path: &Path) -> Self {
        let file = match read_file(path).await {
            Ok(Some(file)) => {
                log::info!(
                    "Loaded request stats from {}: {} requests, {} invokes",
                    path.display(),
                    file.counters.requests_total,
                    file.counters.invokes_total
                );
                file
            }
            Ok(None) => StatsFile::default(),
            Err(e) => {
                log::error!("Ignoring unreadable request stats: {:#}", e);
                StatsFile::default()
            }
        };
        Self {
            path: Some(path.to_path_buf()),
            counters: Mutex::new(file.counters),
            settings: Mutex::new(file.settings),
            dirty: AtomicBool::new(false),
        }
    }

    pub async fn inc_request(&self) {
        self.inc_request_on(Local::now().date_naive()).await
    }

    pub async fn inc_invoke(&self) {
        self.inc_invoke_on(Local::now().date_naive()).await
    }

    async fn inc_request_on(&self, today: NaiveDate) {
        let mut counters = self.counters.lock().await;
        counters.roll_over(today);
        counters.requests_total += 1;
        counters.requests_today += 1;
        self.dirty.store(true, Ordering::Release);
    }

    async fn inc_invoke_on(&self, today: NaiveDate) {
        let mut counters = self.counters.lock().await;
        counters.roll_over(today);
        counters.invokes_total += 1;
        counters.invokes_today += 1;
        self.dirty.store(true, Ordering::Release);
    }

    /// The settings found in the file, or last saved.
    pub async fn saved_settings(&self) -> Option<ActuatorSettings> {
        *self.settings.lock().await
    }

    pub async fn save_settings(&self, settings: ActuatorSettings) {
        *self.settings.lock().await = Some(settings);
        self.dirty.store(true, Ordering::Release);
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let mut counters = self.counters.lock().await.clone();
        counters.roll_over(Local::now().date_naive());
        counters
    }

    /// Write the counters if anything changed since the last flush.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let settings = *self.settings.lock().await;
        let counters = {
            let mut counters = self.counters.lock().await;
            counters.last_flushed = Some(Utc::now());
            counters.clone()
        };
        let content = serde_json::to_string_pretty(&StatsFile { counters, settings })?;

        let result = write_atomically(path, content.as_bytes()).await;
        if result.is_err() {
            // Try again on the next flush.
            self.dirty.store(true, Ordering::Release);
        }
        result
    }
}

async fn read_file(path: &Path) -> anyhow::Result<Option<StatsFile>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let file = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(file))
}

async fn write_atomically(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[rocket::async_test]
    async fn daily_counters_reset_on_a_new_day() {
        let stats = RequestStats::in_memory();
        stats.inc_request_on(day(1)).await;
        stats.inc_request_on(day(1)).await;
        stats.inc_invoke_on(day(1)).await;
        stats.inc_request_on(day(2)).await;

        let counters = stats.counters.lock().await.clone();
        assert_eq!(counters.requests_total, 3);
        assert_eq!(counters.invokes_total, 1);
        assert_eq!(counters.requests_today, 1);
        assert_eq!(counters.invokes_today, 0);
        assert_eq!(counters.day, Some(day(2)));
    }

    #[rocket::async_test]
    async fn counters_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let stats = RequestStats::load(&path).await;
        stats.inc_request().await;
        stats.inc_invoke().await;
        stats.inc_invoke().await;
        stats.flush().await.unwrap();

        let reloaded = RequestStats::load(&path).await.snapshot().await;
        assert_eq!(reloaded.requests_total, 1);
        assert_eq!(reloaded.invokes_total, 2);
        assert_eq!(reloaded.invokes_today, 2);
        assert!(reloaded.last_flushed.is_some());
    }

    #[rocket::async_test]
    async fn settings_share_the_file_with_the_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let stats = RequestStats::load(&path).await;
        assert_eq!(stats.saved_settings().await, None);
        stats.inc_request().await;
        stats
            .save_settings(ActuatorSettings {
                ac_duration: 8,
                steering_wheel_duration: 3,
            })
            .await;
        stats.flush().await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["requests_total"], 1);
        assert_eq!(
            written["settings"],
            serde_json::json!({"ac_duration": 8, "steering_wheel_duration": 3})
        );

        let reloaded = RequestStats::load(&path).await;
        assert_eq!(reloaded.snapshot().await.requests_total, 1);
        assert_eq!(
            reloaded.saved_settings().await,
            Some(ActuatorSettings {
                ac_duration: 8,
                steering_wheel_duration: 3,
            })
        );
    }

    #[rocket::async_test]
    async fn unreadable_file_starts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(&path, "not json").unwrap();

        let stats = RequestStats::load(&path).await;
        assert_eq!(stats.snapshot().await.requests_total, 0);

        // Clean flushes are skipped, the broken file stays untouched.
        stats.flush().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json");
    }
}
