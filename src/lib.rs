//! Lighter OI prediction game backend.
//!
//! Players guess the day's Lighter open interest; a round closes at a fixed
//! UTC hour, the real OI is fetched from redundant DefiLlama mirrors, and
//! guesses are ranked by absolute distance.

pub mod api;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod oi;
pub mod rounds;
pub mod store;

pub use config::{AppConfig, RetryPolicy};
pub use error::{GameError, GameResult};
