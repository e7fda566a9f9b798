use thiserror::Error;

/// Search outcomes a caller may want to match on. Everything else travels
/// as a plain `anyhow::Error`.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("engine_failed: exit status {status}: {message}")]
    EngineFailed { status: String, message: String },

    #[error("engine_output_invalid: {0}")]
    EngineOutputInvalid(String),

    #[error("no_viable_candidate: every candidate in {round} was excluded")]
    NoViableCandidate { round: String },

    #[error("invalid_plan: {0}")]
    InvalidPlan(String),
}
