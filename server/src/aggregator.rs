use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bench_core::constants::REFERENCE_DATABASE;
use bench_core::{compute_stats, Latency, Operation, RawMeasurement, StatSummary};
use log::{debug, info, warn};

use crate::kv::{KvStore, StoreError};
use crate::measurements::{self, ScanError};
use crate::rollups::{write_rollups, RollupKey};

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("failed to write rollups: {0}")]
    Write(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationReport {
    /// Raw records read from the log.
    pub measurements: usize,
    pub rollups: BTreeMap<RollupKey, StatSummary>,
    /// Page loads per region, counted from the reference database's records.
    pub region_runs: BTreeMap<String, u64>,
    pub elapsed: Duration,
}

/// Groups every operation's latency by rollup key.
///
/// Records without a region are bucketed under `unknown`. A region
/// containing `.` cannot be recovered from the composite key, so it is
/// written as-is and warned about once per run.
pub fn bucket_measurements(records: &[RawMeasurement]) -> BTreeMap<RollupKey, Vec<Latency>> {
    let mut buckets: BTreeMap<RollupKey, Vec<Latency>> = BTreeMap::new();
    let mut dotted = BTreeSet::new();
    for record in records {
        let region = record.region();
        if region.contains('.') && dotted.insert(region) {
            warn!("Region '{region}' contains '.'; its rollups will not list correctly");
        }
        let database = record.canonical_database_name();
        for operation in Operation::ALL {
            buckets
                .entry(RollupKey::new(region, &database, operation))
                .or_default()
                .push(record.latency(operation));
        }
    }
    buckets
}

pub fn summarize(buckets: &BTreeMap<RollupKey, Vec<Latency>>) -> BTreeMap<RollupKey, StatSummary> {
    buckets
        .iter()
        .map(|(key, samples)| (key.clone(), compute_stats(samples)))
        .collect()
}

fn count_region_runs(records: &[RawMeasurement]) -> BTreeMap<String, u64> {
    let mut runs = BTreeMap::new();
    for record in records {
        if record.canonical_database_name() == REFERENCE_DATABASE {
            *runs.entry(record.region().to_string()).or_insert(0) += 1;
        }
    }
    runs
}

/// Recomputes every rollup from the full measurement log.
///
/// A run reads everything first and writes all rollups in one commit, so a
/// failed run leaves the previous rollups untouched and rerunning over the
/// same log produces identical output.
pub struct Aggregator {
    store: Arc<dyn KvStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Aggregator { store }
    }

    /// Scans and summarizes without writing anything.
    pub async fn compute(&self) -> Result<AggregationReport, AggregateError> {
        let started = Instant::now();
        let records = measurements::scan(self.store.as_ref()).await?;
        let rollups = summarize(&bucket_measurements(&records));
        let region_runs = count_region_runs(&records);
        debug!("Runs per region: {region_runs:?}");

        Ok(AggregationReport {
            measurements: records.len(),
            rollups,
            region_runs,
            elapsed: started.elapsed(),
        })
    }

    pub async fn run(&self) -> Result<AggregationReport, AggregateError> {
        let started = Instant::now();
        let mut report = self.compute().await?;
        write_rollups(self.store.as_ref(), &report.rollups)
            .await
            .map_err(AggregateError::Write)?;
        report.elapsed = started.elapsed();

        info!(
            "Computed {} rollups from {} measurements in {}ms",
            report.rollups.len(),
            report.measurements,
            report.elapsed.as_millis()
        );
        Ok(report)
    }
}
