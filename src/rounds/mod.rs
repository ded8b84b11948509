//! Round game: lifecycle engine, scoring, scheduler and prediction intake.

pub mod lifecycle;
pub mod scheduler;
pub mod scoring;
pub mod submission;

pub use lifecycle::{
    next_close_at, DeferredRound, ResolutionReport, RoundEngine, ScoredRound, TickReport,
};
pub use scheduler::{spawn_scheduler, SchedulerHandle};
pub use scoring::score;
pub use submission::PredictionDesk;
