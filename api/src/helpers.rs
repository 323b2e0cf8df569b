use bench_core::constants::UNKNOWN_REGION;
use bench_core::RawMeasurement;
use lazy_limit::{Duration, LimiterConfig, RuleConfig};
use subtle::ConstantTimeEq;

use crate::routes::RECOMPUTE_ROUTE;

/// Per-client limits: `per_sec` on every route, 1 req/s on the recompute
/// route. Producers post one record per database per page load.
pub(crate) fn limiter_config(per_sec: u32) -> LimiterConfig {
    LimiterConfig::new(RuleConfig::new(Duration::seconds(1), per_sec))
        .add_route_rule(RECOMPUTE_ROUTE, RuleConfig::new(Duration::seconds(1), 1))
}

/// Checks a caller-supplied token against the configured one in constant
/// time.
///
/// # Arguments
/// * `provided` - Token from the request, if any.
/// * `expected` - Configured token. `None` means the endpoint is disabled.
///
/// # Returns
/// * `true` only when both are present and equal.
pub(crate) fn token_matches(provided: Option<&str>, expected: Option<&str>) -> bool {
    match (provided, expected) {
        (Some(provided), Some(expected)) if !expected.is_empty() => {
            provided.as_bytes().ct_eq(expected.as_bytes()).into()
        }
        _ => false,
    }
}

/// Fills in the serving region on measurements posted without one.
pub(crate) fn stamp_region(mut measurement: RawMeasurement, region_id: &str) -> RawMeasurement {
    if measurement.region() == UNKNOWN_REGION {
        measurement.region_id = region_id.to_string();
    }
    measurement
}
