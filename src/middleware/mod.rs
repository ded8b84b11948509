//! HTTP middleware: request logging and the submission cooldown.

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{submitter_key, SubmissionCooldown};
