//! Typed extraction of a protocol's open interest from the perps overview payload.
//!
//! Expected shape (extra fields ignored):
//! `{ "protocols": [ { "name": "Lighter", "openInterest": 123.4 }, ... ] }`

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricParseError {
    /// Body is not JSON or has no `protocols` array.
    Malformed(String),
    NoMatchingProtocol(String),
    MissingField { protocol: String, field: &'static str },
    NonNumeric { protocol: String, field: &'static str },
}

impl std::fmt::Display for MetricParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed overview payload: {}", e),
            Self::NoMatchingProtocol(needle) => {
                write!(f, "no protocol matching '{}' in overview", needle)
            }
            Self::MissingField { protocol, field } => {
                write!(f, "{}.{} missing", protocol, field)
            }
            Self::NonNumeric { protocol, field } => {
                write!(f, "{}.{} is not a finite number", protocol, field)
            }
        }
    }
}

impl std::error::Error for MetricParseError {}

const OPEN_INTEREST_FIELD: &str = "openInterest";

#[derive(Debug, Deserialize)]
struct OverviewPayload {
    protocols: Vec<Value>,
}

/// Find the first protocol whose name contains `needle` (case-insensitive)
/// and return its open interest.
pub fn extract_open_interest(body: &str, needle: &str) -> Result<f64, MetricParseError> {
    let payload: OverviewPayload =
        serde_json::from_str(body).map_err(|e| MetricParseError::Malformed(e.to_string()))?;

    let needle_lower = needle.to_lowercase();
    let (name, entry) = payload
        .protocols
        .iter()
        .find_map(|entry| {
            let name = entry.get("name")?.as_str()?;
            name.to_lowercase()
                .contains(&needle_lower)
                .then(|| (name.to_string(), entry))
        })
        .ok_or_else(|| MetricParseError::NoMatchingProtocol(needle.to_string()))?;

    let raw = entry
        .get(OPEN_INTEREST_FIELD)
        .filter(|v| !v.is_null())
        .ok_or_else(|| MetricParseError::MissingField {
            protocol: name.clone(),
            field: OPEN_INTEREST_FIELD,
        })?;

    raw.as_f64()
        .filter(|v| v.is_finite())
        .ok_or(MetricParseError::NonNumeric {
            protocol: name,
            field: OPEN_INTEREST_FIELD,
        })
}
