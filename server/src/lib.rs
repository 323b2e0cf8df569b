//! Statistics aggregation core for the edge latency benchmark.
//!
//! The `api` binary and the `recompute-stats` tool both build on this crate:
//! the key-value store abstraction and its KeyDB backing, the measurement
//! log, the aggregator that turns it into rollups, and the fleet-wide
//! schedule that reruns the aggregator.

/// Aggregator: scans the measurement log, buckets it, writes rollups.
pub mod aggregator;

/// Wall-clock abstraction so queue timing can be driven in tests.
pub mod clock;

/// Environment configuration ([`config::ServerConfig::from_env`]).
pub mod config;

/// KeyDB connection helpers.
///
/// Provides [`keydb::connect_with_retry`] for opening the async multiplexed
/// connection used by [`keydb_store::KeyDbStore`].
pub mod keydb;

/// KeyDB-backed [`kv::KvStore`]; every multi-key write is a Lua script.
pub mod keydb_store;

/// The [`kv::KvStore`] contract: keys, versionstamps, atomic operations and
/// the durable delayed queue.
pub mod kv;

/// Queue listener task feeding deliveries to the scheduler.
pub mod listener;

/// Raw measurement log: [`measurements::record_timing`] and the full scan.
pub mod measurements;

/// In-process [`kv::KvStore`] used by tests.
pub mod memory;

/// Rollup keys, rows and the rollup read path.
pub mod rollups;

/// Singleton schedule: lock claim, failure recovery, re-arming.
pub mod scheduler;
