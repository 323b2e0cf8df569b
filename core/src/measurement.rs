use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::UNKNOWN_REGION;
use crate::database::canonical_database_name;
use crate::latency::Latency;

/// The four operations timed against every database.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Write,
    AtomicWrite,
    EventualRead,
    StrongRead,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Write,
        Operation::AtomicWrite,
        Operation::EventualRead,
        Operation::StrongRead,
    ];

    /// Name used as the last segment of a rollup key.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Write => "write",
            Operation::AtomicWrite => "atomicWrite",
            Operation::EventualRead => "eventualRead",
            Operation::StrongRead => "strongRead",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == value)
            .ok_or_else(|| format!("unknown operation '{value}'"))
    }
}

/// One page load's worth of timings for one database, as persisted in the
/// measurement log.
///
/// Older records used `dbName` and `*Performance` field names; both spellings
/// are accepted when reading.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawMeasurement {
    #[serde(alias = "dbName")]
    pub database_name: String,
    #[serde(default = "unknown_region")]
    pub region_id: String,
    #[serde(rename = "writeLatencyMs", alias = "writePerformance")]
    pub write: Latency,
    #[serde(rename = "atomicWriteLatencyMs", alias = "atomicWritePerformance")]
    pub atomic_write: Latency,
    #[serde(rename = "eventualReadLatencyMs", alias = "eventualReadPerformance")]
    pub eventual_read: Latency,
    #[serde(rename = "strongReadLatencyMs", alias = "strongReadPerformance")]
    pub strong_read: Latency,
}

impl RawMeasurement {
    /// Placeholder for a database that was skipped in this region.
    pub fn unmeasured(database_name: &str, region_id: &str) -> Self {
        Self::filled(database_name, region_id, Latency::Unmeasured)
    }

    /// Placeholder for a database whose measurement failed.
    pub fn errored(database_name: &str, region_id: &str) -> Self {
        Self::filled(database_name, region_id, Latency::Errored)
    }

    fn filled(database_name: &str, region_id: &str, latency: Latency) -> Self {
        RawMeasurement {
            database_name: database_name.to_string(),
            region_id: region_id.to_string(),
            write: latency,
            atomic_write: latency,
            eventual_read: latency,
            strong_read: latency,
        }
    }

    pub fn latency(&self, operation: Operation) -> Latency {
        match operation {
            Operation::Write => self.write,
            Operation::AtomicWrite => self.atomic_write,
            Operation::EventualRead => self.eventual_read,
            Operation::StrongRead => self.strong_read,
        }
    }

    pub fn canonical_database_name(&self) -> String {
        canonical_database_name(&self.database_name)
    }

    /// Region the record is bucketed under; blank regions count as unknown.
    pub fn region(&self) -> &str {
        match self.region_id.trim() {
            "" => UNKNOWN_REGION,
            region => region,
        }
    }
}

fn unknown_region() -> String {
    UNKNOWN_REGION.to_string()
}
