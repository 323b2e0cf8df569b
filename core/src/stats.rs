use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{P95_MIN_SAMPLES, UNDEFINED_STAT};
use crate::latency::Latency;

/// Summary statistics for one (region, database, operation) bucket.
///
/// `None` marks a statistic that could not be computed. On the wire every
/// field is a plain number and `-1` stands in for `None`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatSummary {
    #[serde(with = "sentinel")]
    pub min: Option<u64>,
    #[serde(with = "sentinel")]
    pub max: Option<u64>,
    #[serde(with = "sentinel", alias = "avg")]
    pub average: Option<u64>,
    #[serde(with = "sentinel")]
    pub p95: Option<u64>,
}

impl StatSummary {
    pub const UNDEFINED: StatSummary = StatSummary {
        min: None,
        max: None,
        average: None,
        p95: None,
    };

    pub fn is_undefined(&self) -> bool {
        *self == StatSummary::UNDEFINED
    }
}

/// Computes min/max/average/p95 over a bucket of latency samples.
///
/// A bucket that is empty, or that holds a single unmeasured or errored
/// sample, has no meaningful statistics and yields [`StatSummary::UNDEFINED`].
/// The average is the arithmetic mean rounded half up. p95 is the order
/// statistic at index `floor(0.95 * n) - 1` of the ascending samples and is
/// only reported once there are more than [`P95_MIN_SAMPLES`] samples.
pub fn compute_stats(samples: &[Latency]) -> StatSummary {
    let mut measured: Vec<u64> = Vec::with_capacity(samples.len());
    for sample in samples {
        match sample {
            Latency::Measured(ms) => measured.push(*ms),
            Latency::Unmeasured | Latency::Errored => return StatSummary::UNDEFINED,
        }
    }

    if measured.is_empty() {
        return StatSummary::UNDEFINED;
    }

    let min = measured.iter().copied().fold(u64::MAX, u64::min);
    let max = measured.iter().copied().fold(u64::MIN, u64::max);

    let count = measured.len() as u128;
    let sum: u128 = measured.iter().map(|&ms| u128::from(ms)).sum();
    let average = u64::try_from((2 * sum + count) / (2 * count)).unwrap_or(u64::MAX);

    let p95 = if measured.len() > P95_MIN_SAMPLES {
        measured.sort_unstable();
        let index = measured.len() * 95 / 100 - 1;
        measured.get(index).copied()
    } else {
        None
    };

    StatSummary {
        min: Some(min),
        max: Some(max),
        average: Some(average),
        p95,
    }
}

mod sentinel {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_u64(*v),
            None => serializer.serialize_i64(UNDEFINED_STAT),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        let raw = f64::deserialize(deserializer)?;
        if raw.is_finite() && raw >= 0.0 {
            Ok(Some(raw.round() as u64))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measured(values: &[u64]) -> Vec<Latency> {
        values.iter().map(|&v| Latency::Measured(v)).collect()
    }

    #[test]
    fn empty_bucket_is_undefined() {
        assert_eq!(compute_stats(&[]), StatSummary::UNDEFINED);
    }

    #[test]
    fn single_unmeasured_sample_poisons_the_bucket() {
        let mut samples = measured(&[5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        samples.push(Latency::Unmeasured);
        assert_eq!(compute_stats(&samples), StatSummary::UNDEFINED);
    }

    #[test]
    fn single_errored_sample_poisons_the_bucket() {
        let mut samples = measured(&[5, 6, 7]);
        samples.insert(1, Latency::Errored);
        assert!(compute_stats(&samples).is_undefined());
    }

    #[test]
    fn small_buckets_have_no_p95() {
        let stats = compute_stats(&measured(&[4, 2, 9, 7, 3, 1, 8, 6, 5, 10]));
        assert_eq!(stats.min, Some(1));
        assert_eq!(stats.max, Some(10));
        assert_eq!(stats.average, Some(6)); // 5.5 rounds up
        assert_eq!(stats.p95, None);
    }

    #[test]
    fn worked_example_matches_expected_summary() {
        let stats = compute_stats(&measured(&[10, 12, 11, 9, 10, 50, 11, 12, 9, 10, 11, 13]));
        assert_eq!(
            stats,
            StatSummary {
                min: Some(9),
                max: Some(50),
                average: Some(14),
                p95: Some(13),
            }
        );
    }

    #[test]
    fn p95_uses_floor_index_on_sorted_samples() {
        for n in 11..=200u64 {
            let values: Vec<u64> = (0..n).rev().map(|v| v * 3).collect();
            let stats = compute_stats(&measured(&values));
            let mut sorted = values.clone();
            sorted.sort_unstable();
            let expected = sorted[(n as usize * 95) / 100 - 1];
            assert_eq!(stats.p95, Some(expected), "n = {n}");
        }
    }

    #[test]
    fn average_rounds_half_up() {
        assert_eq!(compute_stats(&measured(&[1, 2])).average, Some(2));
        assert_eq!(compute_stats(&measured(&[1, 1, 2])).average, Some(1));
        assert_eq!(compute_stats(&measured(&[0])).average, Some(0));
    }

    #[test]
    fn wire_format_uses_minus_one_for_undefined() {
        let json = serde_json::to_string(&StatSummary::UNDEFINED).unwrap();
        assert_eq!(json, r#"{"min":-1,"max":-1,"average":-1,"p95":-1}"#);

        let partial = StatSummary {
            min: Some(1),
            max: Some(3),
            average: Some(2),
            p95: None,
        };
        let json = serde_json::to_string(&partial).unwrap();
        assert_eq!(json, r#"{"min":1,"max":3,"average":2,"p95":-1}"#);
    }

    #[test]
    fn legacy_avg_field_is_accepted() {
        let stats: StatSummary =
            serde_json::from_str(r#"{"min":1,"max":9,"avg":4,"p95":-1}"#).unwrap();
        assert_eq!(stats.average, Some(4));
        assert_eq!(stats.p95, None);
    }
}
