use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type StationId = u32;
pub type TransmissionId = u64;

/// Simulated time, measured from the start of the simulation.
pub type SimTime = Duration;

/// Pair of backoff delays drawn for one collision event.
///
/// `old_message` applies to the frame that was on the bus first,
/// `new_message` to the frame that collided with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffWindow {
    #[serde(with = "serde_secs")]
    pub old_message: Duration,
    #[serde(with = "serde_secs")]
    pub new_message: Duration,
}

/// Durations as fractional seconds, the unit the front-end displays.
pub mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Durations as milliseconds, used by the TOML config files.
///
/// Whole milliseconds are written as integers. Anything finer is written as
/// a fractional millisecond count so microsecond slot times survive.
pub mod serde_millis {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    const NANOS_PER_MILLI: u128 = 1_000_000;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let nanos = d.as_nanos();
        if nanos % NANOS_PER_MILLI == 0 {
            s.serialize_u64((nanos / NANOS_PER_MILLI) as u64)
        } else {
            s.serialize_f64(nanos as f64 / NANOS_PER_MILLI as f64)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        d.deserialize_any(MillisVisitor)
    }

    struct MillisVisitor;

    impl<'de> Visitor<'de> for MillisVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a non-negative number of milliseconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_millis)
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            if !v.is_finite() || v < 0.0 {
                return Err(E::invalid_value(de::Unexpected::Float(v), &self));
            }
            Ok(Duration::from_nanos((v * NANOS_PER_MILLI as f64).round() as u64))
        }
    }
}
