use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{ERRORED_SENTINEL, UNMEASURED_SENTINEL};

/// One timed operation against one database.
///
/// The measurement log stores these as plain numbers: a non-negative
/// millisecond count, `-1` when the database has no such operation, or `-99`
/// when the measurement failed. Any other negative or non-finite number is
/// read back as [`Latency::Errored`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Latency {
    Measured(u64),
    Unmeasured,
    Errored,
}

impl Latency {
    /// Decodes a wire number. Fractional milliseconds are rounded.
    pub fn from_wire(value: f64) -> Self {
        if !value.is_finite() {
            return Latency::Errored;
        }
        if value == UNMEASURED_SENTINEL as f64 {
            return Latency::Unmeasured;
        }
        if value < 0.0 || value >= u64::MAX as f64 {
            return Latency::Errored;
        }
        Latency::Measured(value.round() as u64)
    }

    pub fn to_wire(self) -> i64 {
        match self {
            Latency::Measured(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
            Latency::Unmeasured => UNMEASURED_SENTINEL,
            Latency::Errored => ERRORED_SENTINEL,
        }
    }

    pub fn as_millis(self) -> Option<u64> {
        match self {
            Latency::Measured(ms) => Some(ms),
            Latency::Unmeasured | Latency::Errored => None,
        }
    }
}

impl Serialize for Latency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_wire())
    }
}

struct LatencyVisitor;

impl Visitor<'_> for LatencyVisitor {
    type Value = Latency;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a latency in milliseconds or a negative sentinel")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Latency, E> {
        Ok(Latency::Measured(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Latency, E> {
        Ok(match value {
            UNMEASURED_SENTINEL => Latency::Unmeasured,
            v if v < 0 => Latency::Errored,
            v => Latency::Measured(v.unsigned_abs()),
        })
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Latency, E> {
        Ok(Latency::from_wire(value))
    }
}

impl<'de> Deserialize<'de> for Latency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(LatencyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::Latency;

    fn decode(json: &str) -> Latency {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn sentinels_decode_to_tagged_variants() {
        assert_eq!(decode("-1"), Latency::Unmeasured);
        assert_eq!(decode("-99"), Latency::Errored);
        assert_eq!(decode("-7"), Latency::Errored);
        assert_eq!(decode("-1.0"), Latency::Unmeasured);
        assert_eq!(decode("-0.5"), Latency::Errored);
    }

    #[test]
    fn fractional_milliseconds_are_rounded() {
        assert_eq!(decode("12.4"), Latency::Measured(12));
        assert_eq!(decode("12.5"), Latency::Measured(13));
        assert_eq!(decode("0"), Latency::Measured(0));
    }

    #[test]
    fn encodes_back_to_wire_numbers() {
        assert_eq!(serde_json::to_string(&Latency::Measured(42)).unwrap(), "42");
        assert_eq!(serde_json::to_string(&Latency::Unmeasured).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&Latency::Errored).unwrap(), "-99");
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        assert!(serde_json::from_str::<Latency>("\"fast\"").is_err());
        assert!(serde_json::from_str::<Latency>("null").is_err());
    }

    #[test]
    fn non_finite_wire_values_are_errors() {
        assert_eq!(Latency::from_wire(f64::NAN), Latency::Errored);
        assert_eq!(Latency::from_wire(f64::INFINITY), Latency::Errored);
    }
}
