use anyhow::{anyhow, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::checkpoint::DirCheckpointStore;
use crate::settings::SettingsFile;
use crate::util::ensure_dir;

/// On-disk layout of a training workspace.
///
/// ```text
/// <root>/
///   settings.json   settings record
///   models/         checkpoint slots
///   runs/           search journals
///   .ace.lock       held while a command trains or relocates checkpoints
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".ace.lock")
    }

    pub fn settings(&self) -> SettingsFile {
        SettingsFile::new(self.settings_path())
    }

    pub fn checkpoint_store(&self, suffix: &str) -> DirCheckpointStore {
        DirCheckpointStore::with_suffix(self.models_dir(), suffix)
    }

    pub fn prepare(&self) -> Result<()> {
        ensure_dir(&self.root)?;
        ensure_dir(&self.models_dir())?;
        Ok(())
    }
}

/// Exclusive hold on a workspace. Released when dropped.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_workspace_lock(layout: &Layout) -> Result<WorkspaceLock> {
    let lock_path = layout.lock_path();
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(WorkspaceLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
            "workspace_busy: another command holds {}",
            lock_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}
