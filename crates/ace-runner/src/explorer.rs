use ace_core::Slot;
use anyhow::Result;
use tracing::{info, warn};

use crate::error::SearchError;
use crate::journal::RoundKind;
use crate::session::TrialOptions;
use crate::trainer::{Candidate, RoundOutcome, Trainer};

impl<'a> Trainer<'a> {
    /// Trains `num_attempts` fresh sessions for `attempt_length` episodes at
    /// `learning_rate`, parking each checkpoint in its attempt slot, then
    /// promotes the lowest-scoring attempt back into the primary slot.
    ///
    /// Attempts do not touch the settings record; only the winner's
    /// configuration is persisted. A failed attempt is excluded.
    pub fn explore(
        &self,
        learning_rate: f32,
        num_attempts: usize,
        attempt_length: u32,
    ) -> Result<RoundOutcome<'a>> {
        if num_attempts == 0 {
            return Err(
                SearchError::InvalidPlan("exploration needs at least one attempt".into()).into(),
            );
        }
        let mut candidates = Vec::with_capacity(num_attempts);
        for idx in 0..num_attempts {
            info!(
                attempt = idx + 1,
                of = num_attempts,
                episodes = attempt_length,
                learning_rate,
                "starting exploratory attempt"
            );
            self.store().clear(Slot::Primary)?;
            let mut session = self.fresh_session();
            session.set_all_learning_rates(learning_rate);
            let trial = TrialOptions::from_scratch(attempt_length).without_persist();
            let candidate = match session.run_trial(trial) {
                Ok(_) => {
                    let score = self.score_of(&session);
                    info!(attempt = idx + 1, score, "exploratory attempt scored");
                    Candidate::scored(session, score)
                }
                Err(err) => {
                    warn!(
                        attempt = idx + 1,
                        error = %err,
                        "exploratory attempt failed; excluding it"
                    );
                    Candidate::excluded(session, err.to_string())
                }
            };
            self.park(idx)?;
            candidates.push(candidate);
        }
        self.conclude(RoundKind::Exploration, 0, candidates, None, None, None)
    }
}
