//! Store key schema and fixed tunables shared by the server and API crates.

/// First key segment of every raw measurement: `["dbPerfRun", <timestamp ms>]`.
pub const MEASUREMENT_PREFIX: &str = "dbPerfRun";

/// First key segment of every rollup: `["stats", "<region>.<db>.<op>"]`.
pub const STATS_PREFIX: &str = "stats";

/// Queue topic for the recurring statistics job.
pub const COMPUTE_STATS_TOPIC: &str = "computeStats";

/// `[topic, LOCK]`: present once some instance owns the recurring schedule.
pub const LOCK: &str = "lock";

/// `[topic, NEXT_UPDATE]`: delivery time (ms since epoch) of the next run.
pub const NEXT_UPDATE: &str = "nextUpdate";

/// `[topic, LAST_MESSAGE_DELIVERY]`: when a listener last received the topic.
pub const LAST_MESSAGE_DELIVERY: &str = "lastMessageDelivery";

/// `[topic, DELIVERY_FAILED]`: written by the queue when a message is dead-lettered.
pub const DELIVERY_FAILED: &str = "deliveryFailed";

/// Wire value for "this database has no such operation".
pub const UNMEASURED_SENTINEL: i64 = -1;

/// Wire value for "the measurement threw".
pub const ERRORED_SENTINEL: i64 = -99;

/// Wire value for an undefined statistic.
pub const UNDEFINED_STAT: i64 = -1;

/// p95 is only reported for buckets with strictly more samples than this.
pub const P95_MIN_SAMPLES: usize = 10;

/// Attempts made to find a free timestamp key before a measurement is dropped.
pub const RECORD_ATTEMPTS: u64 = 10;

/// Default spacing between two aggregation runs: 24 hours.
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Per-region run counts are tallied against this database, since it is
/// measured on every page load.
pub const REFERENCE_DATABASE: &str = "Deno KV";

/// Region id stamped on measurements when the serving region is unknown.
pub const UNKNOWN_REGION: &str = "unknown";
