pub mod checkpoint;
pub mod config;
pub mod layout;
pub mod settings;
pub mod util;

pub use checkpoint::{CheckpointStore, DirCheckpointStore, Slot, DEFAULT_CHECKPOINT_SUFFIX};
pub use config::{
    ConfigError, ConfigPair, ScenarioParams, TrainingParams, DEFAULT_EPISODE_LENGTH,
    DEFAULT_LEARNING_RATE, DEFAULT_NUM_FIRMS, DEFAULT_NUM_PERSONS, LEARNING_RATE_FIELDS,
};
pub use layout::{acquire_workspace_lock, Layout, WorkspaceLock};
pub use settings::{SettingsError, SettingsFile, Synchronization};
pub use util::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_bytes, sha256_file};
