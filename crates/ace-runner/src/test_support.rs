use ace_core::{ensure_dir, ConfigPair, DirCheckpointStore, Layout, SettingsFile};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::PathBuf;

use crate::engine::{Engine, TrainRequest};

pub(crate) const MARKER: &str = "model.pt";

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub config: ConfigPair,
    pub from_checkpoint: bool,
    pub perturbation: f64,
    pub seed: u64,
    /// Marker content the call found in the primary slot when resuming.
    pub found: Option<String>,
}

/// Replays queued loss vectors and leaves a marker checkpoint in the
/// primary slot whose content records the lineage of calls that produced
/// it, e.g. `seed>c0>c3`.
pub(crate) struct ScriptedEngine {
    primary: PathBuf,
    script: RefCell<VecDeque<Vec<f64>>>,
    failing: RefCell<BTreeSet<usize>>,
    calls: RefCell<Vec<RecordedCall>>,
    runs: RefCell<Vec<ConfigPair>>,
}

impl ScriptedEngine {
    pub fn new(primary: PathBuf) -> Self {
        Self {
            primary,
            script: RefCell::new(VecDeque::new()),
            failing: RefCell::new(BTreeSet::new()),
            calls: RefCell::new(Vec::new()),
            runs: RefCell::new(Vec::new()),
        }
    }

    pub fn push_losses(&self, losses: &[f64]) {
        self.script.borrow_mut().push_back(losses.to_vec());
    }

    /// Makes the 0-indexed training call `index` fail.
    pub fn fail_call(&self, index: usize) {
        self.failing.borrow_mut().insert(index);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn runs(&self) -> Vec<ConfigPair> {
        self.runs.borrow().clone()
    }
}

impl Engine for ScriptedEngine {
    fn train(&self, request: &TrainRequest<'_>) -> Result<Vec<f64>> {
        let index = self.calls.borrow().len();
        let marker = self.primary.join(MARKER);
        let found = if request.from_checkpoint {
            fs::read_to_string(&marker).ok()
        } else {
            None
        };
        self.calls.borrow_mut().push(RecordedCall {
            config: *request.config,
            from_checkpoint: request.from_checkpoint,
            perturbation: request.perturbation,
            seed: request.seed,
            found: found.clone(),
        });
        if self.failing.borrow().contains(&index) {
            return Err(anyhow!("engine_failed: scripted failure on call {}", index));
        }

        let n = request.num_episodes() as usize;
        let losses = self
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| vec![1.0; n]);
        let lineage = match found {
            Some(prev) => format!("{}>c{}", prev, index),
            None => format!("c{}", index),
        };
        ensure_dir(&self.primary)?;
        fs::write(&marker, lineage)?;
        Ok(losses)
    }

    fn run(&self, config: &ConfigPair, _seed: u64) -> Result<()> {
        self.runs.borrow_mut().push(*config);
        Ok(())
    }
}

/// Temporary workspace removed on drop.
pub(crate) struct Fixture {
    pub root: PathBuf,
    pub layout: Layout,
    pub settings: SettingsFile,
    pub store: DirCheckpointStore,
}

impl Fixture {
    pub fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "ace_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let layout = Layout::new(&root);
        layout.prepare().expect("prepare workspace");
        Self {
            settings: layout.settings(),
            store: layout.checkpoint_store(".pt"),
            layout,
            root,
        }
    }

    pub fn engine(&self) -> ScriptedEngine {
        ScriptedEngine::new(self.layout.models_dir())
    }

    /// Marker content in `slot`, if any.
    pub fn marker(&self, slot: ace_core::Slot) -> Option<String> {
        fs::read_to_string(self.store.slot_dir(slot).join(MARKER)).ok()
    }

    pub fn put_marker(&self, slot: ace_core::Slot, body: &str) {
        let dir = self.store.slot_dir(slot);
        ensure_dir(&dir).expect("slot dir");
        fs::write(dir.join(MARKER), body).expect("write marker");
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
