use ace_core::{atomic_write_bytes, ensure_dir, sha256_bytes, sha256_file, ConfigPair};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::SearchError;

pub const ENGINE_REQUEST_SCHEMA: &str = "engine_request_v1";
pub const ENGINE_RESPONSE_SCHEMA: &str = "engine_response_v1";

/// One training call. The number of episodes is
/// `config.training.num_episodes`.
#[derive(Debug, Clone, Copy)]
pub struct TrainRequest<'a> {
    pub config: &'a ConfigPair,
    pub from_checkpoint: bool,
    pub perturbation: f64,
    pub seed: u64,
}

impl TrainRequest<'_> {
    pub fn num_episodes(&self) -> u32 {
        self.config.training.num_episodes
    }
}

pub trait Engine {
    /// Trains and returns exactly one loss per requested episode. The
    /// resulting checkpoint is left in the primary slot.
    fn train(&self, request: &TrainRequest<'_>) -> Result<Vec<f64>>;

    fn run(&self, config: &ConfigPair, seed: u64) -> Result<()>;
}

/// Engine driven as a child process.
///
/// Each call writes an `engine_request_v1` document, pipes it to the
/// command's stdin and exports its path, the expected response path and the
/// checkpoint directory as environment variables. The response is read from
/// `ACE_ENGINE_RESPONSE`, falling back to the last JSON line on stdout.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    command: Vec<String>,
    workdir: PathBuf,
    checkpoint_dir: PathBuf,
    exchange_dir: PathBuf,
}

impl ProcessEngine {
    pub fn new(
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        checkpoint_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(SearchError::InvalidPlan("engine command is empty".into()).into());
        }
        let workdir = workdir.into();
        let exchange_dir = exchange_dir(&workdir);
        Ok(Self {
            command,
            workdir,
            checkpoint_dir: checkpoint_dir.into(),
            exchange_dir,
        })
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Digest identifying the engine build: the first command part that
    /// names an existing file (relative parts resolve against the workdir),
    /// else the command line itself.
    pub fn digest(&self) -> Result<String> {
        for part in &self.command {
            let candidate = Path::new(part);
            let path = if candidate.is_relative() {
                self.workdir.join(candidate)
            } else {
                candidate.to_path_buf()
            };
            if path.is_file() {
                return sha256_file(&path);
            }
        }
        Ok(sha256_bytes(self.command.join(" ").as_bytes()))
    }

    fn request_payload(&self, mode: &str, config: &ConfigPair, extra: Value) -> Result<Value> {
        let mut payload = json!({
            "schema_version": ENGINE_REQUEST_SCHEMA,
            "mode": mode,
            "checkpoint_dir": self.checkpoint_dir.display().to_string(),
            "settings": serde_json::to_value(config)?,
        });
        if let (Some(obj), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            obj.extend(extra);
        }
        Ok(payload)
    }

    fn invoke(&self, request: &Value) -> Result<Option<Value>> {
        ensure_dir(&self.exchange_dir)?;
        let request_path = self.exchange_dir.join("request.json");
        let response_path = self.exchange_dir.join("response.json");
        let request_bytes = serde_json::to_vec_pretty(request)?;
        atomic_write_bytes(&request_path, &request_bytes)?;
        if response_path.exists() {
            fs::remove_file(&response_path)?;
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.current_dir(&self.workdir);
        cmd.env("ACE_ENGINE_REQUEST", &request_path);
        cmd.env("ACE_ENGINE_RESPONSE", &response_path);
        cmd.env("ACE_CHECKPOINT_DIR", &self.checkpoint_dir);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        debug!(command = %self.command.join(" "), "spawning engine");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("engine_spawn_failed: {}", self.command[0]))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&request_bytes);
        }
        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let last_line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|s| s.trim().to_string());

        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(SearchError::EngineFailed {
                status,
                message: last_line.unwrap_or_else(|| "engine produced no output".to_string()),
            }
            .into());
        }

        if response_path.exists() {
            let bytes = fs::read(&response_path)?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                SearchError::EngineOutputInvalid(format!("{}: {}", response_path.display(), e))
            })?;
            return Ok(Some(value));
        }
        Ok(last_line.and_then(|line| serde_json::from_str::<Value>(&line).ok()))
    }
}

impl Engine for ProcessEngine {
    fn train(&self, request: &TrainRequest<'_>) -> Result<Vec<f64>> {
        let expected = request.num_episodes() as usize;
        let payload = self.request_payload(
            "train",
            request.config,
            json!({
                "num_episodes": expected,
                "from_checkpoint": request.from_checkpoint,
                "perturbation": request.perturbation,
                "seed": request.seed,
            }),
        )?;
        let response = self.invoke(&payload)?.ok_or_else(|| SearchError::EngineFailed {
            status: "0".to_string(),
            message: "engine exited without writing a response".to_string(),
        })?;
        let losses = parse_losses(&response)?;
        if losses.len() != expected {
            return Err(SearchError::EngineOutputInvalid(format!(
                "expected {} losses, engine reported {}",
                expected,
                losses.len()
            ))
            .into());
        }
        Ok(losses)
    }

    fn run(&self, config: &ConfigPair, seed: u64) -> Result<()> {
        let payload = self.request_payload("run", config, json!({ "seed": seed }))?;
        if let Some(response) = self.invoke(&payload)? {
            if let Some(err) = response.get("error") {
                return Err(anyhow!("engine_failed: {}", err));
            }
        }
        Ok(())
    }
}

fn parse_losses(response: &Value) -> Result<Vec<f64>> {
    if let Some(err) = response.get("error") {
        return Err(SearchError::EngineFailed {
            status: "0".to_string(),
            message: err.to_string(),
        }
        .into());
    }
    if let Some(schema) = response.get("schema_version").and_then(Value::as_str) {
        if schema != ENGINE_RESPONSE_SCHEMA {
            return Err(SearchError::EngineOutputInvalid(format!(
                "unsupported response schema {}",
                schema
            ))
            .into());
        }
    }
    let raw = response
        .get("losses")
        .and_then(Value::as_array)
        .ok_or_else(|| SearchError::EngineOutputInvalid("response has no losses array".into()))?;
    raw.iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                anyhow::Error::from(SearchError::EngineOutputInvalid(format!(
                    "loss is not a number: {}",
                    v
                )))
            })
        })
        .collect()
}

pub fn exchange_dir(workdir: &Path) -> PathBuf {
    workdir.join(".engine")
}
