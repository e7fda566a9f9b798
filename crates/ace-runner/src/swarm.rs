use ace_core::Slot;
use anyhow::Result;
use tracing::{debug, info, warn};

use crate::error::SearchError;
use crate::journal::RoundKind;
use crate::options::SwarmPlan;
use crate::scorer::{mean, should_stop_after_trial, trial_failed};
use crate::session::{RunSession, TrialOptions};
use crate::trainer::{Candidate, GenerationSummary, RoundOutcome, Trainer};

pub struct SwarmOutcome<'a> {
    pub winner: Option<RunSession<'a>>,
    pub best_score: f64,
    pub generations: Vec<GenerationSummary>,
}

impl<'a> Trainer<'a> {
    /// One swarm generation.
    ///
    /// The primary checkpoint becomes the host. Every member starts from a
    /// copy of the host under the settings record, trains a perturbed trial
    /// segment and either stops early or continues unperturbed to
    /// `num_episodes`. The best member is promoted into primary. If every
    /// member is excluded the host is copied back into primary and the
    /// generation fails.
    pub fn run_generation(
        &self,
        generation: usize,
        swarm_size: usize,
        num_episodes: u32,
        perturbation: f64,
        target_score: f64,
    ) -> Result<RoundOutcome<'a>> {
        if swarm_size == 0 {
            return Err(SearchError::InvalidPlan("swarm_size must be at least 1".into()).into());
        }
        let store = self.store();
        if store.list(Slot::Primary)?.is_empty() {
            warn!("primary slot holds no checkpoint; reusing the existing host");
        } else {
            store.clear(Slot::Host)?;
            store.promote(Slot::Primary, Slot::Host)?;
        }

        let mut candidates = Vec::with_capacity(swarm_size);
        for idx in 0..swarm_size {
            let candidate =
                self.run_member(idx, swarm_size, num_episodes, perturbation, target_score)?;
            self.park(idx)?;
            candidates.push(candidate);
        }
        self.conclude(
            RoundKind::SwarmGeneration,
            generation,
            candidates,
            Some(perturbation),
            Some(target_score),
            Some(Slot::Host),
        )
    }

    fn run_member(
        &self,
        idx: usize,
        swarm_size: usize,
        num_episodes: u32,
        perturbation: f64,
        target_score: f64,
    ) -> Result<Candidate<'a>> {
        info!(member = idx + 1, of = swarm_size, "starting swarm member");
        let store = self.store();
        store.clear(Slot::Primary)?;
        store.duplicate(Slot::Host, Slot::Primary)?;

        let mut session = self.fresh_session();
        if let Err(err) = session.load_settings() {
            warn!(member = idx + 1, error = %err, "cannot load host settings; excluding member");
            return Ok(Candidate::excluded(session, err.to_string()));
        }

        let options = self.options();
        let trial_episodes = num_episodes.min(options.trial_episodes);
        let trial = TrialOptions::resume(trial_episodes)
            .perturbed(perturbation)
            .without_sync_check()
            .without_persist();
        let trial_losses = match session.run_trial(trial) {
            Ok(losses) => losses,
            Err(err) => {
                warn!(member = idx + 1, error = %err, "trial failed; excluding member");
                return Ok(Candidate::excluded(session, err.to_string()));
            }
        };

        let trial_score = mean(&trial_losses);
        let failed = trial_failed(trial_score, target_score, options.trial_margin);
        if should_stop_after_trial(
            trial_score,
            target_score,
            options.trial_margin,
            num_episodes,
            trial_episodes,
        ) {
            if failed {
                info!(
                    member = idx + 1,
                    trial_score,
                    target_score,
                    "trial missed target; stopping member early"
                );
            } else {
                debug!(member = idx + 1, "trial covered every episode");
            }
        } else {
            info!(member = idx + 1, trial_score, "trial passed; continuing");
            let rest = TrialOptions::resume(num_episodes - trial_episodes)
                .without_sync_check()
                .without_persist();
            if let Err(err) = session.run_trial(rest) {
                warn!(member = idx + 1, error = %err, "continuation failed; excluding member");
                let mut candidate = Candidate::excluded(session, err.to_string());
                candidate.trial_score = Some(trial_score);
                return Ok(candidate);
            }
        }

        let score = self.score_of(&session);
        info!(member = idx + 1, score, "swarm member scored");
        Ok(Candidate {
            session,
            score,
            trial_score: Some(trial_score),
            early_stopped: failed,
            excluded: None,
        })
    }

    /// Runs `plan.iterations` generations. The perturbation decays
    /// geometrically and each generation's target is the previous winning
    /// score, starting from `initial_target`.
    pub fn iterate_swarm(&self, plan: &SwarmPlan, initial_target: f64) -> Result<SwarmOutcome<'a>> {
        let mut target = initial_target;
        let mut winner = None;
        let mut generations = Vec::with_capacity(plan.iterations);
        for generation in 0..plan.iterations {
            let perturbation = plan.perturbation(generation);
            info!(
                generation = generation + 1,
                of = plan.iterations,
                perturbation,
                target_score = target,
                "starting swarm generation"
            );
            let outcome = self.run_generation(
                generation,
                plan.swarm_size,
                plan.num_episodes,
                perturbation,
                target,
            )?;
            generations.push(GenerationSummary {
                generation,
                perturbation,
                target_score: target,
                winner_index: outcome.winner_index,
                score: outcome.score,
            });
            target = outcome.score;
            winner = Some(outcome.winner);
        }
        Ok(SwarmOutcome {
            winner,
            best_score: target,
            generations,
        })
    }
}
