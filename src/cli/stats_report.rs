// Reads one or more request stats files written by the backend and prints
// the combined counters.

use anyhow::Context;
use std::env;
use std::path::Path;
use std::process;
use types::StatsFile;
mod types;

/// Print the request statistics persisted by the backend.
///
/// The backend keeps its counters in the file named by `zeekr.stats_path` and
/// rewrites it on an interval and on shutdown. This reads one or more such
/// files and prints their sum, so the vendor's daily request budget can be
/// checked without going through the HTTP API.
///
/// # Usage
///
/// ```sh
/// cargo run --bin zeekr-ev-stats <stats file> [<stats file>...]
/// ```
fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <stats file> [<stats file>...]", args[0]);
        process::exit(1);
    }

    let mut files = Vec::new();
    for arg in &args[1..] {
        match read_stats(Path::new(arg)) {
            Ok(stats) => files.push(stats),
            Err(e) => {
                eprintln!("Error: {:#}", e);
                process::exit(1);
            }
        }
    }

    let file_count = files.len();
    let combined: StatsFile = files.into_iter().sum();
    print!(
        "{}",
        render_report(&combined, file_count, chrono::Local::now().date_naive())
    );
}

fn read_stats(path: &Path) -> anyhow::Result<StatsFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn render_report(stats: &StatsFile, file_count: usize, today: chrono::NaiveDate) -> String {
    let (requests_today, invokes_today) = stats.today(today);
    let last_flushed = stats
        .last_flushed
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "Files:           {}\n\
         Requests today:  {}\n\
         Invokes today:   {}\n\
         Requests total:  {}\n\
         Invokes total:   {}\n\
         Last flushed:    {}\n",
        file_count,
        requests_today,
        invokes_today,
        stats.requests_total,
        stats.invokes_total,
        last_flushed
    )
}
