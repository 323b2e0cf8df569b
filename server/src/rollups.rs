//! Rollup storage: one `StatSummary` per (region, database, operation)
//! under `["stats", "<region>.<database>.<operation>"]`.

use std::collections::BTreeMap;
use std::fmt;

use bench_core::constants::STATS_PREFIX;
use bench_core::{Operation, StatSummary};
use log::warn;
use serde::Serialize;

use crate::kv::{AtomicOperation, CommitResult, Consistency, KvKey, KvStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RollupKey {
    pub region: String,
    pub database: String,
    pub operation: Operation,
}

impl RollupKey {
    pub fn new(region: &str, database: &str, operation: Operation) -> Self {
        RollupKey {
            region: region.to_string(),
            database: database.to_string(),
            operation,
        }
    }

    /// `"<region>.<database>.<operation>"`.
    pub fn composite(&self) -> String {
        format!("{}.{}.{}", self.region, self.database, self.operation)
    }

    /// Splits on the first and last `.`; anything in between is the
    /// database name.
    pub fn parse(composite: &str) -> Option<Self> {
        let (region, rest) = composite.split_once('.')?;
        let (database, operation) = rest.rsplit_once('.')?;
        if region.is_empty() || database.is_empty() {
            return None;
        }
        Some(RollupKey::new(region, database, operation.parse().ok()?))
    }

    pub fn store_key(&self) -> KvKey {
        KvKey::pair(STATS_PREFIX, self.composite())
    }
}

impl fmt::Display for RollupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.composite())
    }
}

/// One row of the rollup table as served to readers.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollupRow {
    pub region: String,
    pub database: String,
    pub operation: Operation,
    #[serde(flatten)]
    pub stats: StatSummary,
}

/// Overwrites every given rollup in a single atomic commit.
pub(crate) async fn write_rollups(
    store: &dyn KvStore,
    rollups: &BTreeMap<RollupKey, StatSummary>,
) -> Result<(), StoreError> {
    let mut op = AtomicOperation::new();
    for (key, stats) in rollups {
        op = op.set_json(key.store_key(), stats)?;
    }
    match store.commit(op).await? {
        CommitResult::Committed(_) => Ok(()),
        CommitResult::CheckFailed => Err(StoreError::Rejected(KvKey::prefix(STATS_PREFIX).to_string())),
    }
}

pub async fn list_rollups(store: &dyn KvStore) -> Result<Vec<RollupRow>, StoreError> {
    let entries = store
        .list(&KvKey::prefix(STATS_PREFIX), Consistency::Eventual)
        .await?;

    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(key) = entry.key.last_str().and_then(RollupKey::parse) else {
            warn!("Skipping rollup with unrecognised key {}", entry.key);
            continue;
        };
        let stats = match entry.decode::<StatSummary>() {
            Ok(stats) => stats,
            Err(err) => {
                warn!("Skipping undecodable rollup {}: {}", entry.key, err);
                continue;
            }
        };
        rows.push(RollupRow {
            region: key.region,
            database: key.database,
            operation: key.operation,
            stats,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::QueuePolicy;
    use crate::memory::MemoryStore;

    #[test]
    fn composite_key_round_trips() {
        let key = RollupKey::new("us-east4", "Upstash Redis", Operation::AtomicWrite);
        assert_eq!(key.composite(), "us-east4.Upstash Redis.atomicWrite");
        assert_eq!(RollupKey::parse(&key.composite()), Some(key));
    }

    #[test]
    fn malformed_composites_are_rejected() {
        assert_eq!(RollupKey::parse("us-east4.Fauna"), None);
        assert_eq!(RollupKey::parse("us-east4.Fauna.read"), None);
        assert_eq!(RollupKey::parse("nodots"), None);
        assert_eq!(RollupKey::parse(".Fauna.write"), None);
    }

    #[test]
    fn row_serializes_flat() {
        let row = RollupRow {
            region: "eu".to_string(),
            database: "Fauna".to_string(),
            operation: Operation::StrongRead,
            stats: StatSummary::UNDEFINED,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["operation"], "strongRead");
        assert_eq!(json["p95"], -1);
    }

    #[tokio::test]
    async fn listing_skips_unrecognised_keys() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(0)), QueuePolicy::default());
        let mut rollups = BTreeMap::new();
        rollups.insert(
            RollupKey::new("eu", "Fauna", Operation::Write),
            StatSummary {
                min: Some(1),
                max: Some(2),
                average: Some(2),
                p95: None,
            },
        );
        write_rollups(&store, &rollups).await.unwrap();
        store
            .set(&KvKey::pair(STATS_PREFIX, "garbage"), "{}".to_string())
            .await
            .unwrap();

        let rows = list_rollups(&store).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].database, "Fauna");
        assert_eq!(rows[0].stats.max, Some(2));
    }
}
