use ace_core::{
    ConfigPair, DEFAULT_CHECKPOINT_SUFFIX, DEFAULT_EPISODE_LENGTH, DEFAULT_NUM_FIRMS,
    DEFAULT_NUM_PERSONS,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::SearchError;
use crate::scorer::DEFAULT_SCORE_WINDOW;

pub const DEFAULT_TRIAL_EPISODES: u32 = 5;
pub const DEFAULT_TRIAL_MARGIN: f64 = 1e4;

/// What to do when a resume is requested but the settings record does not
/// match the session's configuration. Chosen ahead of time by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesyncPolicy {
    #[default]
    Abort,
    ReloadThenProceed,
    ProceedAnyway,
}

impl DesyncPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesyncPolicy::Abort => "abort",
            DesyncPolicy::ReloadThenProceed => "reload_then_proceed",
            DesyncPolicy::ProceedAnyway => "proceed_anyway",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchOptions {
    pub num_persons: u32,
    pub num_firms: u32,
    pub episode_length: u32,
    /// Episodes a swarm member trains before the early-stop decision.
    pub trial_episodes: u32,
    /// Absolute slack added to the target score for the early-stop test.
    pub trial_margin: f64,
    pub score_window: f64,
    pub on_desync: DesyncPolicy,
    pub checkpoint_suffix: String,
    pub seed: u64,
    /// By-name field edits applied to every fresh configuration, keyed as
    /// `scenarioParams.<field>` or `trainingParams.<field>`.
    pub overrides: BTreeMap<String, Value>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            num_persons: DEFAULT_NUM_PERSONS,
            num_firms: DEFAULT_NUM_FIRMS,
            episode_length: DEFAULT_EPISODE_LENGTH,
            trial_episodes: DEFAULT_TRIAL_EPISODES,
            trial_margin: DEFAULT_TRIAL_MARGIN,
            score_window: DEFAULT_SCORE_WINDOW,
            on_desync: DesyncPolicy::Abort,
            checkpoint_suffix: DEFAULT_CHECKPOINT_SUFFIX.to_string(),
            seed: 1337,
            overrides: BTreeMap::new(),
        }
    }
}

impl SearchOptions {
    pub fn base_config(&self) -> Result<ConfigPair> {
        let mut pair = ConfigPair::for_population(self.num_persons, self.num_firms)
            .with_episode_length(self.episode_length);
        for (path, value) in &self.overrides {
            pair = pair.with_field(path, value.clone())?;
        }
        Ok(pair)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trial_episodes == 0 {
            return Err(SearchError::InvalidPlan("trial_episodes must be at least 1".into()).into());
        }
        if !(self.score_window > 0.0 && self.score_window <= 1.0) {
            return Err(SearchError::InvalidPlan(format!(
                "score_window must be in (0, 1], got {}",
                self.score_window
            ))
            .into());
        }
        if !(self.trial_margin >= 0.0) {
            return Err(SearchError::InvalidPlan(format!(
                "trial_margin must be non-negative, got {}",
                self.trial_margin
            ))
            .into());
        }
        if self.checkpoint_suffix.is_empty() {
            return Err(
                SearchError::InvalidPlan("checkpoint_suffix must not be empty".into()).into(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExplorePlan {
    pub fast_lr: f32,
    pub slow_lr: f32,
    pub num_attempts: usize,
    pub attempt_length: u32,
    pub train_episodes: u32,
}

impl Default for ExplorePlan {
    fn default() -> Self {
        Self {
            fast_lr: 1e-3,
            slow_lr: 1e-6,
            num_attempts: 0,
            attempt_length: 4,
            train_episodes: 500,
        }
    }
}

impl ExplorePlan {
    pub fn validate(&self) -> Result<()> {
        if self.num_attempts > 0 && self.attempt_length == 0 {
            return Err(SearchError::InvalidPlan("attempt_length must be at least 1".into()).into());
        }
        Ok(())
    }
}

/// Iterated swarm: generations of perturbed members sharing one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwarmPlan {
    pub swarm_size: usize,
    pub num_episodes: u32,
    pub learning_rate: f32,
    pub initial_perturbation: f64,
    pub perturbation_decay: f64,
    pub iterations: usize,
    /// When non-zero the first host comes from an exploration round
    /// instead of a single one-episode session.
    pub exploratory_attempts: usize,
    pub exploratory_episodes: u32,
}

impl Default for SwarmPlan {
    fn default() -> Self {
        Self {
            swarm_size: 10,
            num_episodes: 100,
            learning_rate: 1e-5,
            initial_perturbation: 0.1,
            perturbation_decay: 0.8,
            iterations: 10,
            exploratory_attempts: 0,
            exploratory_episodes: 4,
        }
    }
}

impl SwarmPlan {
    pub fn perturbation(&self, generation: usize) -> f64 {
        self.initial_perturbation * self.perturbation_decay.powi(generation as i32)
    }

    pub fn validate(&self) -> Result<()> {
        if self.swarm_size > 0 && self.iterations > 0 && self.num_episodes == 0 {
            return Err(SearchError::InvalidPlan("num_episodes must be at least 1".into()).into());
        }
        if !(self.initial_perturbation >= 0.0) || !(self.perturbation_decay >= 0.0) {
            return Err(SearchError::InvalidPlan(
                "perturbation and decay must be non-negative".into(),
            )
            .into());
        }
        if self.exploratory_attempts > 0 && self.exploratory_episodes == 0 {
            return Err(SearchError::InvalidPlan(
                "exploratory_episodes must be at least 1".into(),
            )
            .into());
        }
        Ok(())
    }
}
