use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

/// The request counters as the backend persists them.
///
/// With the implementations of `AddAssign` and `Sum`, the counters of several
/// installations (several accounts, each with its own stats file) can be
/// folded into one report.
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(super) struct StatsFile {
    pub requests_total: u64,
    pub invokes_total: u64,
    pub requests_today: u64,
    pub invokes_today: u64,
    pub day: Option<NaiveDate>,
    pub last_flushed: Option<DateTime<Utc>>,
}

impl std::ops::AddAssign for StatsFile {
    /// Totals always add up. Daily counters only add up for the same day;
    /// otherwise the most recent day wins.
    fn add_assign(&mut self, other: Self) {
        self.requests_total += other.requests_total;
        self.invokes_total += other.invokes_total;
        if self.day == other.day {
            self.requests_today += other.requests_today;
            self.invokes_today += other.invokes_today;
        } else if other.day > self.day {
            self.requests_today = other.requests_today;
            self.invokes_today = other.invokes_today;
            self.day = other.day;
        }
        self.last_flushed = self.last_flushed.max(other.last_flushed);
    }
}

impl std::iter::Sum for StatsFile {
    /// An empty file carries no day, so the first real file always wins it.
    fn sum<I: Iterator<Item = Self>>(files: I) -> Self {
        files.fold(Self::default(), |mut combined, file| {
            combined += file;
            combined
        })
    }
}

impl StatsFile {
    /// The daily counters as of `today`: a file last written on an earlier
    /// day has made no requests today.
    pub fn today(&self, today: NaiveDate) -> (u64, u64) {
        if self.day == Some(today) {
            (self.requests_today, self.invokes_today)
        } else {
            (0, 0)
        }
    }
}
