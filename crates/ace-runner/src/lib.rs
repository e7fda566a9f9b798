pub mod engine;
pub mod error;
mod explorer;
pub mod journal;
pub mod options;
pub mod scorer;
pub mod session;
pub mod swarm;
pub mod trainer;

#[cfg(test)]
mod test_support;

pub use engine::{Engine, ProcessEngine, TrainRequest};
pub use error::SearchError;
pub use journal::{CandidateRecord, Journal, RoundKind, RoundRecord};
pub use options::{DesyncPolicy, ExplorePlan, SearchOptions, SwarmPlan};
pub use scorer::{score, select_best, should_stop_after_trial};
pub use session::{RunSession, TrialOptions};
pub use swarm::SwarmOutcome;
pub use trainer::{
    describe_workspace, Description, GenerationSummary, RoundOutcome, SwarmReport, TrainReport,
    Trainer,
};
