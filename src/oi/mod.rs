//! Ground-truth open interest: upstream client, payload parsing and the
//! shared last-known-good cache.

pub mod cache;
pub mod client;
pub mod parse;

pub use cache::{OiCache, OiSnapshot, MANUAL_SOURCE};
pub use client::{FetchError, HttpTransport, MetricSource, MetricTransport, OiSourceClient};
pub use parse::{extract_open_interest, MetricParseError};
