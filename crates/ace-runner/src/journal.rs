//! Per-invocation record of a search, written under `runs/run_<ts>/`.
//!
//! ```text
//! runs/run_20260101_120000/
//!   manifest.json    search_manifest_v1: algorithm, options, plan, base config
//!   run_state.json   run_state_v1: running | completed | failed
//!   round_000.json   search_round_v1: candidates, winner, checkpoint digest
//!   result.json      search_result_v1
//! ```

use ace_core::{atomic_write_json_pretty, ensure_dir};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::cell::Cell;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind {
    Exploration,
    SwarmGeneration,
}

impl RoundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundKind::Exploration => "exploration",
            RoundKind::SwarmGeneration => "swarm_generation",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    pub index: usize,
    pub seed: u64,
    pub trial_score: Option<f64>,
    pub early_stopped: bool,
    pub excluded: Option<String>,
    pub losses: Vec<f64>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundRecord {
    pub kind: RoundKind,
    pub round: usize,
    pub perturbation: Option<f64>,
    pub target_score: Option<f64>,
    pub candidates: Vec<CandidateRecord>,
    pub winner: Option<usize>,
    pub winner_score: Option<f64>,
    /// Digest of the primary slot after the winner was promoted.
    pub checkpoint: Option<String>,
}

pub struct Journal {
    dir: PathBuf,
    run_id: String,
    rounds: Cell<usize>,
    done: Cell<bool>,
}

impl Journal {
    /// Creates the run directory, writes the manifest and marks the run as
    /// running. The run is marked failed if the journal is dropped before
    /// [`Journal::complete`].
    pub fn create(runs_dir: &Path, algorithm: &str, details: Value) -> Result<Self> {
        ensure_dir(runs_dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut run_id = format!("run_{}", stamp);
        let mut attempt = 1;
        while runs_dir.join(&run_id).exists() {
            attempt += 1;
            run_id = format!("run_{}_{}", stamp, attempt);
        }
        let dir = runs_dir.join(&run_id);
        ensure_dir(&dir)?;

        let manifest = json!({
            "schema_version": "search_manifest_v1",
            "run_id": run_id,
            "algorithm": algorithm,
            "created_at": Utc::now().to_rfc3339(),
            "details": details,
        });
        atomic_write_json_pretty(&dir.join("manifest.json"), &manifest)?;
        let journal = Self {
            dir,
            run_id,
            rounds: Cell::new(0),
            done: Cell::new(false),
        };
        journal.write_state("running")?;
        Ok(journal)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record_round(&self, record: &RoundRecord) -> Result<()> {
        let seq = self.rounds.get();
        let payload = json!({
            "schema_version": "search_round_v1",
            "run_id": self.run_id,
            "sequence": seq,
            "recorded_at": Utc::now().to_rfc3339(),
            "round": record,
        });
        atomic_write_json_pretty(&self.dir.join(format!("round_{:03}.json", seq)), &payload)?;
        self.rounds.set(seq + 1);
        Ok(())
    }

    pub fn complete(&self, result: Value) -> Result<()> {
        let payload = json!({
            "schema_version": "search_result_v1",
            "run_id": self.run_id,
            "completed_at": Utc::now().to_rfc3339(),
            "result": result,
        });
        atomic_write_json_pretty(&self.dir.join("result.json"), &payload)?;
        self.write_state("completed")?;
        self.done.set(true);
        Ok(())
    }

    fn write_state(&self, status: &str) -> Result<()> {
        let payload = json!({
            "schema_version": "run_state_v1",
            "run_id": self.run_id,
            "status": status,
            "rounds": self.rounds.get(),
            "updated_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&self.dir.join("run_state.json"), &payload)
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if !self.done.get() {
            let _ = self.write_state("failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn read(path: PathBuf) -> Value {
        serde_json::from_slice(&fs::read(path).expect("read")).expect("json")
    }

    fn temp_runs(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "ace_journal_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn completed_run_writes_rounds_and_result() {
        let runs = temp_runs("complete");
        let journal = Journal::create(&runs, "swarm", json!({"swarm_size": 2})).unwrap();
        let dir = journal.dir().to_path_buf();
        assert_eq!(read(dir.join("run_state.json"))["status"], "running");

        journal
            .record_round(&RoundRecord {
                kind: RoundKind::SwarmGeneration,
                round: 0,
                perturbation: Some(0.1),
                target_score: None,
                candidates: vec![CandidateRecord {
                    index: 0,
                    seed: 9,
                    trial_score: Some(4.0),
                    early_stopped: false,
                    excluded: None,
                    losses: vec![4.0],
                    score: Some(4.0),
                }],
                winner: Some(0),
                winner_score: Some(4.0),
                checkpoint: None,
            })
            .unwrap();
        journal.complete(json!({"best_score": 4.0})).unwrap();
        drop(journal);

        let round = read(dir.join("round_000.json"));
        assert_eq!(round["schema_version"], "search_round_v1");
        assert_eq!(round["round"]["kind"], "swarm_generation");
        assert_eq!(round["round"]["winner"], 0);
        assert_eq!(read(dir.join("result.json"))["result"]["best_score"], 4.0);
        assert_eq!(read(dir.join("run_state.json"))["status"], "completed");
        assert_eq!(read(dir.join("manifest.json"))["algorithm"], "swarm");
        let _ = fs::remove_dir_all(runs);
    }

    #[test]
    fn dropped_journal_marks_run_failed_and_ids_do_not_collide() {
        let runs = temp_runs("failed");
        let first = Journal::create(&runs, "train", json!({})).unwrap();
        let second = Journal::create(&runs, "train", json!({})).unwrap();
        assert_ne!(first.run_id(), second.run_id());
        let dir = first.dir().to_path_buf();
        drop(first);
        drop(second);
        assert_eq!(read(dir.join("run_state.json"))["status"], "failed");
        let _ = fs::remove_dir_all(runs);
    }
}
