//! Slot-addressed storage of opaque checkpoint artifacts.
//!
//! A checkpoint is whatever set of files the engine left in a slot. There is
//! no manifest: a file belongs to the checkpoint iff it is a direct child of
//! the slot directory and its name ends in the configured suffix.
//!
//! ```text
//! models/               Primary    (engine reads and writes here)
//!   purchaseNet.pt
//!   valueNet.pt
//!   host/               Host       (shared ancestor of a swarm generation)
//!   attempt0/           Attempt(0)
//!   attempt1/           Attempt(1)
//! ```

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::util::ensure_dir;

pub const DEFAULT_CHECKPOINT_SUFFIX: &str = ".pt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Primary,
    Host,
    Attempt(usize),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Primary => write!(f, "primary"),
            Slot::Host => write!(f, "host"),
            Slot::Attempt(i) => write!(f, "attempt{}", i),
        }
    }
}

/// Storage for checkpoint artifact sets.
///
/// Relocating from an empty slot is a no-op, never an error. Callers must
/// hold exclusive access to both slots for the duration of a call.
pub trait CheckpointStore {
    /// Moves every checkpoint file from `from` into `to`, leaving `from`
    /// without checkpoint files. Returns the number of files moved.
    fn promote(&self, from: Slot, to: Slot) -> Result<usize>;

    /// Copies every checkpoint file from `from` into `to`. `from` is left
    /// untouched. Returns the number of files copied.
    fn duplicate(&self, from: Slot, to: Slot) -> Result<usize>;

    /// Deletes every checkpoint file in `slot`.
    fn clear(&self, slot: Slot) -> Result<usize>;

    /// Sorted file names of the checkpoint in `slot`.
    fn list(&self, slot: Slot) -> Result<Vec<String>>;

    /// Content digest of the checkpoint in `slot`, `None` when empty.
    fn fingerprint(&self, slot: Slot) -> Result<Option<String>>;
}

/// Directory-backed store. Slots other than [`Slot::Primary`] are
/// subdirectories of the primary directory.
#[derive(Debug, Clone)]
pub struct DirCheckpointStore {
    root: PathBuf,
    suffix: String,
}

impl DirCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_suffix(root, DEFAULT_CHECKPOINT_SUFFIX)
    }

    pub fn with_suffix(root: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            suffix: suffix.into(),
        }
    }

    pub fn slot_dir(&self, slot: Slot) -> PathBuf {
        match slot {
            Slot::Primary => self.root.clone(),
            other => self.root.join(other.to_string()),
        }
    }

    fn checkpoint_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let matches = entry
                .file_name()
                .to_str()
                .map(|name| name.ends_with(&self.suffix))
                .unwrap_or(false);
            if matches {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn relocate(&self, from: Slot, to: Slot, copy: bool) -> Result<usize> {
        let src = self.slot_dir(from);
        let files = self.checkpoint_files(&src)?;
        if files.is_empty() {
            return Ok(0);
        }
        if from == to {
            return Ok(files.len());
        }
        let dst = self.slot_dir(to);
        ensure_dir(&dst)?;
        for file in &files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = dst.join(name);
            if copy {
                fs::copy(file, &target).with_context(|| {
                    format!("checkpoint_copy_failed: {} -> {}", file.display(), target.display())
                })?;
            } else {
                fs::rename(file, &target).with_context(|| {
                    format!("checkpoint_move_failed: {} -> {}", file.display(), target.display())
                })?;
            }
        }
        debug!(
            from = %from,
            to = %to,
            files = files.len(),
            copy,
            "relocated checkpoint"
        );
        Ok(files.len())
    }
}

impl CheckpointStore for DirCheckpointStore {
    fn promote(&self, from: Slot, to: Slot) -> Result<usize> {
        self.relocate(from, to, false)
    }

    fn duplicate(&self, from: Slot, to: Slot) -> Result<usize> {
        self.relocate(from, to, true)
    }

    fn clear(&self, slot: Slot) -> Result<usize> {
        let files = self.checkpoint_files(&self.slot_dir(slot))?;
        for file in &files {
            fs::remove_file(file)
                .with_context(|| format!("checkpoint_remove_failed: {}", file.display()))?;
        }
        Ok(files.len())
    }

    fn list(&self, slot: Slot) -> Result<Vec<String>> {
        Ok(self
            .checkpoint_files(&self.slot_dir(slot))?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect())
    }

    fn fingerprint(&self, slot: Slot) -> Result<Option<String>> {
        let files = self.checkpoint_files(&self.slot_dir(slot))?;
        if files.is_empty() {
            return Ok(None);
        }
        let mut hasher = Sha256::new();
        for file in &files {
            let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(fs::read(file)?);
            hasher.update([0u8]);
        }
        Ok(Some(format!("sha256:{}", hex::encode(hasher.finalize()))))
    }
}
