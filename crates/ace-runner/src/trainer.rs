use ace_core::{CheckpointStore, ConfigPair, SettingsFile, Slot, Synchronization};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use tracing::info;

use crate::engine::Engine;
use crate::error::SearchError;
use crate::journal::{CandidateRecord, Journal, RoundKind, RoundRecord};
use crate::options::{ExplorePlan, SearchOptions, SwarmPlan};
use crate::scorer::{score, select_best};
use crate::session::{RunSession, TrialOptions};

pub struct Trainer<'a> {
    engine: &'a dyn Engine,
    store: &'a dyn CheckpointStore,
    settings: &'a SettingsFile,
    options: SearchOptions,
    base: ConfigPair,
    rng: RefCell<StdRng>,
    journal: Option<&'a Journal>,
}

pub(crate) struct Candidate<'a> {
    pub session: RunSession<'a>,
    pub score: f64,
    pub trial_score: Option<f64>,
    pub early_stopped: bool,
    pub excluded: Option<String>,
}

impl<'a> Candidate<'a> {
    pub fn scored(session: RunSession<'a>, score: f64) -> Self {
        Self {
            session,
            score,
            trial_score: None,
            early_stopped: false,
            excluded: None,
        }
    }

    pub fn excluded(session: RunSession<'a>, reason: String) -> Self {
        Self {
            session,
            score: f64::INFINITY,
            trial_score: None,
            early_stopped: false,
            excluded: Some(reason),
        }
    }

    fn record(&self, index: usize) -> CandidateRecord {
        CandidateRecord {
            index,
            seed: self.session.seed(),
            trial_score: self.trial_score,
            early_stopped: self.early_stopped,
            excluded: self.excluded.clone(),
            losses: self.session.history().to_vec(),
            score: self.score.is_finite().then_some(self.score),
        }
    }
}

/// Winner of a round. Its checkpoint has been copied into the primary slot
/// and its configuration written to the settings record.
pub struct RoundOutcome<'a> {
    pub winner: RunSession<'a>,
    pub winner_index: usize,
    pub score: f64,
    pub scores: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub explored: bool,
    pub exploration_scores: Vec<f64>,
    pub winner_index: Option<usize>,
    pub losses: Vec<f64>,
    pub final_score: f64,
    pub settings_digest: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub generation: usize,
    pub perturbation: f64,
    pub target_score: f64,
    pub winner_index: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwarmReport {
    pub initial_target: f64,
    pub generations: Vec<GenerationSummary>,
    pub best_score: f64,
    pub settings_digest: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Description {
    pub base_config: ConfigPair,
    pub settings_record: Option<ConfigPair>,
    pub synchronized: bool,
    pub mismatched_fields: Vec<String>,
    pub slots: BTreeMap<String, Vec<String>>,
}

impl<'a> Trainer<'a> {
    pub fn new(
        engine: &'a dyn Engine,
        store: &'a dyn CheckpointStore,
        settings: &'a SettingsFile,
        options: SearchOptions,
    ) -> Result<Self> {
        options.validate()?;
        let base = options.base_config()?;
        let rng = RefCell::new(StdRng::seed_from_u64(options.seed));
        Ok(Self {
            engine,
            store,
            settings,
            options,
            base,
            rng,
            journal: None,
        })
    }

    pub fn with_journal(mut self, journal: &'a Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    pub fn base_config(&self) -> &ConfigPair {
        &self.base
    }

    pub(crate) fn store(&self) -> &'a dyn CheckpointStore {
        self.store
    }

    pub fn fresh_session(&self) -> RunSession<'a> {
        let seed = self.rng.borrow_mut().gen::<u64>();
        RunSession::new(
            self.engine,
            self.settings,
            self.base,
            seed,
            self.options.on_desync,
        )
    }

    pub(crate) fn score_of(&self, session: &RunSession<'_>) -> f64 {
        score(session.history(), self.options.score_window)
    }

    pub(crate) fn park(&self, index: usize) -> Result<()> {
        self.store.clear(Slot::Attempt(index))?;
        self.store.promote(Slot::Primary, Slot::Attempt(index))?;
        Ok(())
    }

    /// Picks the round winner, copies its checkpoint into the primary slot
    /// and persists its configuration. With no viable candidate the
    /// `fallback` slot, if any, is copied back into primary and the round
    /// fails.
    pub(crate) fn conclude(
        &self,
        kind: RoundKind,
        round: usize,
        mut candidates: Vec<Candidate<'a>>,
        perturbation: Option<f64>,
        target_score: Option<f64>,
        fallback: Option<Slot>,
    ) -> Result<RoundOutcome<'a>> {
        let scores: Vec<f64> = candidates.iter().map(|c| c.score).collect();
        let best = select_best(&scores);
        match best {
            Some(idx) => {
                self.store.duplicate(Slot::Attempt(idx), Slot::Primary)?;
                candidates[idx].session.persist_settings()?;
            }
            None => {
                if let Some(slot) = fallback {
                    self.store.duplicate(slot, Slot::Primary)?;
                }
            }
        }

        if let Some(journal) = self.journal {
            journal.record_round(&RoundRecord {
                kind,
                round,
                perturbation,
                target_score: target_score.filter(|t| t.is_finite()),
                candidates: candidates
                    .iter()
                    .enumerate()
                    .map(|(i, c)| c.record(i))
                    .collect(),
                winner: best,
                winner_score: best.map(|i| scores[i]),
                checkpoint: self.store.fingerprint(Slot::Primary)?,
            })?;
        }

        let Some(idx) = best else {
            return Err(SearchError::NoViableCandidate {
                round: format!("{} {}", kind.as_str(), round),
            }
            .into());
        };
        info!(
            round = kind.as_str(),
            winner = idx,
            score = scores[idx],
            "promoted winner to primary slot"
        );
        let winner = candidates.swap_remove(idx).session;
        Ok(RoundOutcome {
            winner,
            winner_index: idx,
            score: scores[idx],
            scores,
        })
    }

    /// Explores at `plan.fast_lr` (when attempts are configured), then
    /// trains the winner, or a fresh session, for `plan.train_episodes` at
    /// `plan.slow_lr`.
    pub fn train(&self, plan: &ExplorePlan) -> Result<TrainReport> {
        plan.validate()?;
        let (mut session, exploration) = if plan.num_attempts > 0 {
            let outcome = self.explore(plan.fast_lr, plan.num_attempts, plan.attempt_length)?;
            let found = (outcome.winner_index, outcome.scores);
            (outcome.winner, Some(found))
        } else {
            info!("no exploratory attempts configured; training a fresh session");
            self.store.clear(Slot::Primary)?;
            (self.fresh_session(), None)
        };

        session.set_all_learning_rates(plan.slow_lr);
        // The record still holds the winner's fast learning rates.
        let trial = if exploration.is_some() {
            TrialOptions::resume(plan.train_episodes).without_sync_check()
        } else {
            TrialOptions::from_scratch(plan.train_episodes)
        };
        info!(
            episodes = plan.train_episodes,
            learning_rate = plan.slow_lr,
            resumed = exploration.is_some(),
            "starting main training"
        );
        let losses = session.run_trial(trial)?;
        let final_score = score(&losses, self.options.score_window);
        info!(final_score, "main training finished");

        let (winner_index, exploration_scores) = match exploration {
            Some((idx, scores)) => (Some(idx), scores),
            None => (None, Vec::new()),
        };
        Ok(TrainReport {
            explored: winner_index.is_some(),
            exploration_scores,
            winner_index,
            losses,
            final_score,
            settings_digest: self.settings.digest()?,
        })
    }

    pub fn train_as_swarm(&self, plan: &SwarmPlan) -> Result<SwarmReport> {
        plan.validate()?;
        let initial_target = if plan.exploratory_attempts > 0 {
            let outcome = self.explore(
                plan.learning_rate,
                plan.exploratory_attempts,
                plan.exploratory_episodes,
            )?;
            outcome.score
        } else {
            info!("initializing host checkpoint with a one-episode session");
            self.store.clear(Slot::Primary)?;
            let mut session = self.fresh_session();
            session.set_all_learning_rates(plan.learning_rate);
            let losses = session.run_trial(TrialOptions::from_scratch(1))?;
            losses.last().copied().unwrap_or(f64::INFINITY)
        };
        info!(initial_target, "swarm seeded");

        if plan.swarm_size == 0 || plan.iterations == 0 {
            info!("swarm is empty; keeping the seeded checkpoint");
            return Ok(SwarmReport {
                initial_target,
                generations: Vec::new(),
                best_score: initial_target,
                settings_digest: self.settings.digest()?,
            });
        }

        let outcome = self.iterate_swarm(plan, initial_target)?;
        Ok(SwarmReport {
            initial_target,
            best_score: outcome.best_score,
            generations: outcome.generations,
            settings_digest: self.settings.digest()?,
        })
    }

    pub fn evaluate(&self, episode_length: Option<u32>) -> Result<bool> {
        let mut session = self.fresh_session();
        session.evaluate(episode_length)
    }
}

/// Snapshot of a workspace: the settings record, whether it matches
/// `base`, and the checkpoint files in the primary, host and first
/// `attempt_slots` attempt slots. Empty attempt slots are omitted.
pub fn describe_workspace(
    store: &dyn CheckpointStore,
    settings: &SettingsFile,
    base: &ConfigPair,
    attempt_slots: usize,
) -> Result<Description> {
    let settings_record = settings.load_optional()?;
    let (synchronized, mismatched_fields) = match settings.compare(base)? {
        Synchronization::Synchronized => (true, Vec::new()),
        Synchronization::Diverged(fields) => (false, fields),
        Synchronization::Missing => (false, Vec::new()),
    };
    let mut slots = BTreeMap::new();
    let all = [Slot::Primary, Slot::Host]
        .into_iter()
        .chain((0..attempt_slots).map(Slot::Attempt));
    for slot in all {
        let files = store.list(slot)?;
        if !files.is_empty() || matches!(slot, Slot::Primary | Slot::Host) {
            slots.insert(slot.to_string(), files);
        }
    }
    Ok(Description {
        base_config: *base,
        settings_record,
        synchronized,
        mismatched_fields,
        slots,
    })
}
