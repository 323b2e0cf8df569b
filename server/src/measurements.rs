//! The raw measurement log: append-only records under `["dbPerfRun", <ms>]`.

use bench_core::constants::{MEASUREMENT_PREFIX, RECORD_ATTEMPTS};
use bench_core::RawMeasurement;
use log::{debug, warn};

use crate::clock::Clock;
use crate::kv::{AtomicOperation, CommitResult, Consistency, KvKey, KvStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(KvKey),
    /// Every candidate key was already taken.
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to scan the measurement log: {0}")]
    Store(#[from] StoreError),
    #[error("undecodable measurement at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn measurement_key(timestamp_ms: u64) -> KvKey {
    KvKey::pair(MEASUREMENT_PREFIX, timestamp_ms)
}

/// Appends one measurement under a fresh timestamp key.
///
/// Each attempt takes a new clock reading; when the clock has not moved past
/// the previous attempt the timestamp is bumped by one so no key is tried
/// twice. After [`RECORD_ATTEMPTS`] collisions the measurement is dropped and
/// logged.
pub async fn record_timing(
    store: &dyn KvStore,
    clock: &dyn Clock,
    measurement: &RawMeasurement,
) -> Result<RecordOutcome, StoreError> {
    let value = serde_json::to_string(measurement)?;
    let mut previous: Option<u64> = None;

    for attempt in 1..=RECORD_ATTEMPTS {
        let now_ms = clock.now_ms();
        let timestamp = match previous {
            Some(prev) if now_ms <= prev => prev + 1,
            _ => now_ms,
        };
        previous = Some(timestamp);

        let key = measurement_key(timestamp);
        let op = AtomicOperation::new()
            .check(key.clone(), None)
            .set(key.clone(), value.clone());
        match store.commit(op).await? {
            CommitResult::Committed(_) => return Ok(RecordOutcome::Recorded(key)),
            CommitResult::CheckFailed => {
                debug!("Measurement key {key} taken (attempt {attempt}/{RECORD_ATTEMPTS})");
            }
        }
    }

    warn!(
        "Failed to persist measurement for {} after {} attempts, giving up",
        measurement.database_name, RECORD_ATTEMPTS
    );
    Ok(RecordOutcome::Dropped)
}

/// Reads the whole log in key order. Any record that fails to decode fails
/// the scan.
pub async fn scan(store: &dyn KvStore) -> Result<Vec<RawMeasurement>, ScanError> {
    let entries = store
        .list(&KvKey::prefix(MEASUREMENT_PREFIX), Consistency::Eventual)
        .await?;
    entries
        .iter()
        .map(|entry| {
            entry.decode().map_err(|source| ScanError::Decode {
                key: entry.key.to_string(),
                source,
            })
        })
        .collect()
}
