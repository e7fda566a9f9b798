use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::ConfigPair;
use crate::util::{atomic_write_json_pretty, sha256_bytes};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings_missing: no settings record at {0}")]
    Missing(PathBuf),
    #[error("settings_malformed: {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

/// Result of comparing an in-memory pair against the persisted record.
#[derive(Debug, Clone, PartialEq)]
pub enum Synchronization {
    Synchronized,
    Diverged(Vec<String>),
    Missing,
}

impl Synchronization {
    pub fn is_synchronized(&self) -> bool {
        matches!(self, Synchronization::Synchronized)
    }
}

#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the record with `pair`.
    pub fn persist(&self, pair: &ConfigPair) -> Result<()> {
        atomic_write_json_pretty(&self.path, pair)
    }

    pub fn load(&self) -> Result<ConfigPair> {
        match self.load_optional()? {
            Some(pair) => Ok(pair),
            None => Err(SettingsError::Missing(self.path.clone()).into()),
        }
    }

    pub fn load_optional(&self) -> Result<Option<ConfigPair>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        let pair = serde_json::from_slice(&bytes).map_err(|e| SettingsError::Malformed {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        Ok(Some(pair))
    }

    pub fn compare(&self, pair: &ConfigPair) -> Result<Synchronization> {
        let Some(record) = self.load_optional()? else {
            return Ok(Synchronization::Missing);
        };
        if record == *pair {
            Ok(Synchronization::Synchronized)
        } else {
            Ok(Synchronization::Diverged(pair.mismatched_fields(&record)))
        }
    }

    /// Digest of the record bytes as stored, `None` when absent.
    pub fn digest(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(sha256_bytes(&fs::read(&self.path)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "ace_settings_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    #[test]
    fn persist_load_persist_is_byte_identical() {
        let root = temp_root("roundtrip");
        let settings = SettingsFile::new(root.join("settings.json"));
        let pair = ConfigPair::for_population(31, 7)
            .with_learning_rate(1e-5)
            .with_field("scenarioParams.discount_sigma", json!(0.1 + 0.2))
            .expect("field");

        settings.persist(&pair).expect("persist");
        let first = fs::read(settings.path()).expect("read first");
        let loaded = settings.load().expect("load");
        assert_eq!(loaded, pair);

        settings.persist(&loaded).expect("persist again");
        let second = fs::read(settings.path()).expect("read second");
        assert_eq!(first, second);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn compare_detects_any_single_field_difference() {
        let root = temp_root("compare");
        let settings = SettingsFile::new(root.join("settings.json"));
        let b = ConfigPair::default();
        settings.persist(&b).expect("persist");

        assert_eq!(settings.compare(&b).unwrap(), Synchronization::Synchronized);

        let a = b.with_field("scenarioParams.numFirms", json!(13)).unwrap();
        assert_eq!(
            settings.compare(&a).unwrap(),
            Synchronization::Diverged(vec!["scenarioParams.numFirms".into()])
        );

        let a = b.with_field("trainingParams.valueNetLR", json!(0.0011)).unwrap();
        assert!(!settings.compare(&a).unwrap().is_synchronized());

        let serialized = serde_json::to_value(b).unwrap();
        let mut checked = 0;
        for section in ["scenarioParams", "trainingParams"] {
            for (field, value) in serialized[section].as_object().unwrap() {
                let bumped = match value.as_u64() {
                    Some(n) => json!(n + 1),
                    None => json!(value.as_f64().unwrap() + 1.0),
                };
                let path = format!("{}.{}", section, field);
                let a = b.with_field(&path, bumped).unwrap();
                assert_eq!(
                    settings.compare(&a).unwrap(),
                    Synchronization::Diverged(vec![path.clone()]),
                    "{}",
                    path
                );
                checked += 1;
            }
        }
        assert!(checked > 60, "only {} fields checked", checked);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_record_is_reported_not_raised() {
        let root = temp_root("missing");
        let settings = SettingsFile::new(root.join("settings.json"));
        assert_eq!(
            settings.compare(&ConfigPair::default()).unwrap(),
            Synchronization::Missing
        );
        assert!(settings.load_optional().unwrap().is_none());
        assert!(settings.digest().unwrap().is_none());
        let err = settings.load().expect_err("missing must fail");
        assert!(err.to_string().contains("settings_missing"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn malformed_record_is_an_error() {
        let root = temp_root("malformed");
        let path = root.join("settings.json");
        fs::write(&path, r#"{"scenarioParams":{},"trainingParams":{}}"#).unwrap();
        let err = SettingsFile::new(&path).load().expect_err("malformed");
        assert!(err.to_string().contains("settings_malformed"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
