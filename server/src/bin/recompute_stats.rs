//! One-shot offline recompute of every rollup.
//!
//! Usage:
//!   cargo run -p server --bin recompute-stats [-- [--dry-run] [--list]]
//!
//! Connects to the KeyDB named by `BENCH_KEYDB_URL` (a `.env` file is read if
//! present), runs the aggregator once and prints a summary. `--dry-run`
//! computes and prints the rollups without writing them. `--list` prints the
//! stored rollup table afterwards.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use bench_core::StatSummary;
use log::LevelFilter;
use server::aggregator::{AggregationReport, Aggregator};
use server::clock::SystemClock;
use server::config::ServerConfig;
use server::keydb_store::KeyDbStore;
use server::rollups::list_rollups;

fn usage() -> ! {
    eprintln!("Usage: recompute-stats [--dry-run] [--list]");
    std::process::exit(1);
}

fn render(stat: Option<u64>) -> String {
    stat.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn print_summary(label: &str, stats: &StatSummary) {
    println!(
        "  {label:<48} min {:>6}  max {:>6}  avg {:>6}  p95 {:>6}",
        render(stats.min),
        render(stats.max),
        render(stats.average),
        render(stats.p95)
    );
}

fn print_report(report: &AggregationReport) {
    println!(
        "{} measurements, {} rollups ({:.2?})",
        report.measurements,
        report.rollups.len(),
        report.elapsed
    );
    for (region, runs) in &report.region_runs {
        println!("  {region}: {runs} runs");
    }
    for (key, stats) in &report.rollups {
        print_summary(&key.composite(), stats);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut dry_run = false;
    let mut list = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "--list" => list = true,
            _ => usage(),
        }
    }

    let _ = dotenvy::dotenv();
    let level = env::var("API_LOG_LEVEL")
        .ok()
        .as_deref()
        .and_then(bench_core::parse_log_level)
        .unwrap_or(LevelFilter::Info);
    bench_core::initialize_logger(level, None)?;

    let config = ServerConfig::from_env()?;
    let store = KeyDbStore::connect(
        &config.keydb_url,
        config.keydb_replica_url.as_deref(),
        config.queue,
        Arc::new(SystemClock),
    )
    .await
    .with_context(|| format!("connecting to {}", config.keydb_url))?;
    let store = Arc::new(store);
    let aggregator = Aggregator::new(store.clone());

    let report = if dry_run {
        println!("Dry run: nothing will be written.");
        aggregator.compute().await?
    } else {
        aggregator.run().await?
    };
    print_report(&report);

    if list {
        let rows = list_rollups(store.as_ref()).await?;
        println!("Stored rollups ({}):", rows.len());
        for row in rows {
            print_summary(
                &format!("{}.{}.{}", row.region, row.database, row.operation),
                &row.stats,
            );
        }
    }

    Ok(())
}
