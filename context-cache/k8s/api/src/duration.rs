use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A non-negative duration in Go's `time.Duration` string format, e.g. `1h30m` or `10s`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct K8sDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("negative durations are not supported")]
    Negative,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

// === impl K8sDuration ===

impl K8sDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for K8sDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<K8sDuration> for Duration {
    fn from(K8sDuration(duration): K8sDuration) -> Self {
        duration
    }
}

impl fmt::Display for K8sDuration {
    /// Formats whole hours, minutes and seconds the way Go does (`1h0m30s`), falling back to
    /// fractional seconds for sub-second precision.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0;
        if total.is_zero() {
            return f.write_str("0s");
        }
        if total < Duration::from_secs(1) {
            return write!(f, "{}ms", total.as_secs_f64() * 1000.0);
        }

        let secs = total.as_secs();
        let (h, m) = (secs / 3600, (secs % 3600) / 60);
        let s = (secs % 60) as f64 + f64::from(total.subsec_nanos()) / 1e9;
        if h > 0 {
            write!(f, "{h}h{m}m{s}s")
        } else if m > 0 {
            write!(f, "{m}m{s}s")
        } else {
            write!(f, "{s}s")
        }
    }
}

impl FromStr for K8sDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn unit(unit: &str) -> Result<Duration, ParseError> {
            match unit {
                "ns" => Ok(Duration::from_nanos(1)),
                // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
                "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(Duration::from_micros(1)),
                "ms" => Ok(Duration::from_millis(1)),
                "s" => Ok(Duration::from_secs(1)),
                "m" => Ok(MINUTE),
                "h" => Ok(HOUR),
                _ => Err(ParseError::InvalidUnit),
            }
        }

        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        let mut rest = s.trim_start_matches('+');
        if rest == "0" {
            return Ok(Self::default());
        }
        if rest.is_empty() {
            return Err(ParseError::NoUnit);
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (name, tail) = tail.split_at(unit_end);

            total += unit(name)?.mul_f64(value.parse::<f64>()?);
            rest = tail;
        }

        Ok(Self(total))
    }
}

impl Serialize for K8sDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for K8sDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = K8sDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string in Go `time.Duration.String()` format")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<K8sDuration>().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

impl schemars::JsonSchema for K8sDuration {
    fn schema_name() -> String {
        "K8sDuration".to_owned()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        // Not "duration", which would denote ISO 8601.
        schemars::schema::SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::String.into()),
            format: None,
            ..Default::default()
        }
        .into()
    }
}
