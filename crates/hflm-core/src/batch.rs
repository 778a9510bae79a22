//! Batch-size policy parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Batch-size policy handed to the harness.
///
/// `Auto` carries a scale factor the harness applies while probing for the
/// largest batch that fits; the adapter stores it but never applies it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchSize {
    Fixed(usize),
    Auto { scale: f64 },
}

impl BatchSize {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input == "auto" || input.starts_with("auto:") {
            let mut parts = input.split(':');
            parts.next();
            let scale = match parts.next() {
                None => 1.0,
                Some(raw) => raw.trim().parse::<f64>().map_err(|_| {
                    Error::InvalidArgument(format!(
                        "Invalid auto batch size scale '{raw}' in '{input}'"
                    ))
                })?,
            };
            if !scale.is_finite() || scale <= 0.0 {
                return Err(Error::InvalidArgument(format!(
                    "Auto batch size scale must be positive, got '{input}'"
                )));
            }
            return Ok(Self::Auto { scale });
        }

        match input.parse::<usize>() {
            Ok(0) => Err(Error::InvalidArgument(
                "Batch size must be a positive integer".to_string(),
            )),
            Ok(n) => Ok(Self::Fixed(n)),
            Err(_) => Err(Error::InvalidArgument(format!(
                "Batch size must be 'auto', 'auto:<scale>' or a positive integer, got '{input}'"
            ))),
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto { .. })
    }

    /// Fixed size, if the policy is not automatic.
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Auto { .. } => None,
        }
    }

    pub fn scale(&self) -> Option<f64> {
        match self {
            Self::Fixed(_) => None,
            Self::Auto { scale } => Some(*scale),
        }
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self::Fixed(1)
    }
}

impl FromStr for BatchSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{n}"),
            Self::Auto { scale } if *scale == 1.0 => write!(f, "auto"),
            Self::Auto { scale } => write!(f, "auto:{scale}"),
        }
    }
}

// Config files may carry either `batch_size = 8` or `batch_size = "auto:2"`.
impl<'de> Deserialize<'de> for BatchSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(usize),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => BatchSize::parse(&n.to_string()),
            Raw::Str(s) => BatchSize::parse(&s),
        }
        .map_err(serde::de::Error::custom)
    }
}

impl Serialize for BatchSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Fixed(n) => serializer.serialize_u64(*n as u64),
            Self::Auto { .. } => serializer.serialize_str(&self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_auto_defaults_scale_to_one() {
        assert_eq!(BatchSize::parse("auto").unwrap(), BatchSize::Auto { scale: 1.0 });
    }

    #[test]
    fn test_auto_with_scale() {
        assert_eq!(
            BatchSize::parse("auto:2.5").unwrap(),
            BatchSize::Auto { scale: 2.5 }
        );
        assert_eq!(BatchSize::parse("auto:0.5").unwrap().scale(), Some(0.5));
    }

    #[test]
    fn test_fixed_integer() {
        let parsed = BatchSize::parse("8").unwrap();
        assert_eq!(parsed, BatchSize::Fixed(8));
        assert_eq!(parsed.fixed(), Some(8));
        assert!(!parsed.is_auto());
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["large", "0", "-3", "auto:fast", "auto:-1", "8.5", ""] {
            assert!(
                matches!(BatchSize::parse(bad), Err(Error::InvalidArgument(_))),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn test_deserialize_from_int_or_string() {
        let fixed: BatchSize = serde_json::from_str("16").unwrap();
        assert_eq!(fixed, BatchSize::Fixed(16));
        let auto: BatchSize = serde_json::from_str("\"auto:4\"").unwrap();
        assert_eq!(auto, BatchSize::Auto { scale: 4.0 });
        assert!(serde_json::from_str::<BatchSize>("\"many\"").is_err());
    }

    #[test]
    fn test_display_matches_parse_input() {
        assert_eq!(BatchSize::Fixed(4).to_string(), "4");
        assert_eq!(BatchSize::Auto { scale: 1.0 }.to_string(), "auto");
        assert_eq!(BatchSize::Auto { scale: 2.5 }.to_string(), "auto:2.5");
    }
}
