use ace_core::{ConfigPair, SettingsFile, Synchronization};
use anyhow::Result;
use tracing::{debug, warn};

use crate::engine::{Engine, TrainRequest};
use crate::error::SearchError;
use crate::options::DesyncPolicy;

/// How a training call treats the checkpoint and the settings record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialOptions {
    pub num_episodes: u32,
    pub from_checkpoint: bool,
    pub perturbation: f64,
    pub check_sync: bool,
    pub persist_settings: bool,
}

impl TrialOptions {
    pub fn from_scratch(num_episodes: u32) -> Self {
        Self {
            num_episodes,
            from_checkpoint: false,
            perturbation: 0.0,
            check_sync: true,
            persist_settings: true,
        }
    }

    pub fn resume(num_episodes: u32) -> Self {
        Self {
            from_checkpoint: true,
            ..Self::from_scratch(num_episodes)
        }
    }

    pub fn perturbed(self, perturbation: f64) -> Self {
        Self {
            perturbation,
            ..self
        }
    }

    pub fn without_sync_check(self) -> Self {
        Self {
            check_sync: false,
            ..self
        }
    }

    pub fn without_persist(self) -> Self {
        Self {
            persist_settings: false,
            ..self
        }
    }
}

/// Owns a configuration pair and the loss history of everything trained
/// under it. Sessions are cheap; the checkpoint lives in the primary slot,
/// not in the session.
pub struct RunSession<'a> {
    engine: &'a dyn Engine,
    settings: &'a SettingsFile,
    config: ConfigPair,
    history: Vec<f64>,
    seed: u64,
    calls: u64,
    on_desync: DesyncPolicy,
}

impl<'a> RunSession<'a> {
    pub fn new(
        engine: &'a dyn Engine,
        settings: &'a SettingsFile,
        config: ConfigPair,
        seed: u64,
        on_desync: DesyncPolicy,
    ) -> Self {
        Self {
            engine,
            settings,
            config,
            history: Vec::new(),
            seed,
            calls: 0,
            on_desync,
        }
    }

    pub fn config(&self) -> &ConfigPair {
        &self.config
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn set_all_learning_rates(&mut self, value: f32) {
        self.config = self.config.with_learning_rate(value);
    }

    pub fn persist_settings(&self) -> Result<()> {
        self.settings.persist(&self.config)
    }

    pub fn synchronization(&self) -> Result<Synchronization> {
        self.settings.compare(&self.config)
    }

    /// True iff the settings record exists and equals the session
    /// configuration field by field.
    pub fn settings_synchronized(&self) -> Result<bool> {
        Ok(self.synchronization()?.is_synchronized())
    }

    pub fn load_settings(&mut self) -> Result<()> {
        self.config = self.settings.load()?;
        Ok(())
    }

    /// Trains `options.num_episodes` episodes and appends the losses to the
    /// history. Returns the losses of this call only.
    ///
    /// A resume with `check_sync` compares the session configuration, as it
    /// stood before this call, against the settings record. On divergence
    /// the session's [`DesyncPolicy`] decides; an abort returns no losses
    /// and leaves the engine untouched.
    pub fn run_trial(&mut self, options: TrialOptions) -> Result<Vec<f64>> {
        if options.from_checkpoint && options.check_sync && !self.resolve_desync()? {
            return Ok(Vec::new());
        }
        self.config = self.config.with_num_episodes(options.num_episodes);
        if options.num_episodes == 0 {
            return Ok(Vec::new());
        }

        let seed = self.next_seed();
        let request = TrainRequest {
            config: &self.config,
            from_checkpoint: options.from_checkpoint,
            perturbation: options.perturbation,
            seed,
        };
        debug!(
            episodes = options.num_episodes,
            from_checkpoint = options.from_checkpoint,
            perturbation = options.perturbation,
            seed,
            "training"
        );
        let losses = self.engine.train(&request)?;
        if losses.len() != options.num_episodes as usize {
            return Err(SearchError::EngineOutputInvalid(format!(
                "expected {} losses, engine reported {}",
                options.num_episodes,
                losses.len()
            ))
            .into());
        }
        self.history.extend_from_slice(&losses);
        if options.persist_settings {
            self.persist_settings()?;
        }
        Ok(losses)
    }

    /// Runs the simulation once with the primary checkpoint, gated by the
    /// settings record the same way a resume is. Returns false when the
    /// desync policy aborted the run.
    pub fn evaluate(&mut self, episode_length: Option<u32>) -> Result<bool> {
        if !self.resolve_desync()? {
            return Ok(false);
        }
        if let Some(length) = episode_length {
            self.config = self.config.with_episode_length(length);
        }
        let seed = self.next_seed();
        self.engine.run(&self.config, seed)?;
        Ok(true)
    }

    fn next_seed(&mut self) -> u64 {
        let seed = self.seed.wrapping_add(self.calls);
        self.calls += 1;
        seed
    }

    fn resolve_desync(&mut self) -> Result<bool> {
        let fields = match self.synchronization()? {
            Synchronization::Synchronized => return Ok(true),
            Synchronization::Diverged(fields) => fields,
            Synchronization::Missing => vec!["<settings record missing>".to_string()],
        };
        match self.on_desync {
            DesyncPolicy::Abort => {
                warn!(
                    fields = %fields.join(", "),
                    record = %self.settings.path().display(),
                    "settings record does not match the session configuration; skipping"
                );
                Ok(false)
            }
            DesyncPolicy::ReloadThenProceed => {
                warn!(
                    fields = %fields.join(", "),
                    "settings record does not match; reloading it into the session"
                );
                self.load_settings()?;
                Ok(true)
            }
            DesyncPolicy::ProceedAnyway => {
                warn!(
                    fields = %fields.join(", "),
                    "settings record does not match; proceeding with session configuration"
                );
                Ok(true)
            }
        }
    }
}
