//! On-disk configuration store: snapshot reads, optimistic-concurrency
//! mutations, atomic writes with backup rotation, validate-or-rollback.
//!
//! The store is the only authorized mutator of the config file. Readers
//! work from [`ConfigSnapshot`]s; a stale snapshot is fine — its
//! `raw_sha256` is the token a later mutation uses to detect that it lost
//! the race.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::document::{self, ConfigOp};
use super::path::parse_path;
use super::schema::EffectiveConfig;

/// How many `.bak.{ts}` files are retained after a mutation.
pub const DEFAULT_MAX_BACKUPS: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config write conflict: expected raw hash {expected}, file has {actual}")]
    Conflict { expected: String, actual: String },

    #[error("config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("config path error: {0}")]
    Path(String),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Process exit code at the CLI boundary: 2 for lost writes, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Conflict { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A point-in-time view of the config file.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub path: PathBuf,
    pub exists: bool,
    /// Raw file bytes; absent when the file does not exist.
    pub raw: Option<Vec<u8>>,
    /// SHA-256 of the on-disk bytes (of the empty string when absent).
    pub raw_sha256: [u8; 32],
    /// The parsed document, when parsing succeeded.
    pub effective: Option<Value>,
    /// SHA-256 of the canonical serialization of `effective`.
    pub effective_sha256: Option<[u8; 32]>,
    pub load_success: bool,
    pub load_errors: Vec<String>,
}

impl ConfigSnapshot {
    pub fn raw_hash_hex(&self) -> String {
        hex::encode(self.raw_sha256)
    }

    pub fn effective_hash_hex(&self) -> Option<String> {
        self.effective_sha256.map(hex::encode)
    }

    /// Deserialize the typed view. `None` when parsing or validation failed.
    pub fn typed(&self) -> Option<EffectiveConfig> {
        if !self.load_success {
            return None;
        }
        self.effective
            .as_ref()
            .and_then(|v| EffectiveConfig::from_value(v).ok())
    }
}

pub struct ConfigStore {
    path: PathBuf,
    max_backups: usize,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }

    pub fn with_max_backups(mut self, n: usize) -> Self {
        self.max_backups = n;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pure read: no locks, no side effects.
    pub fn snapshot(&self) -> Result<ConfigSnapshot> {
        let raw = match fs::read(&self.path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let raw_sha256 = sha256(raw.as_deref().unwrap_or(&[]));
        let mut load_errors = Vec::new();
        let mut effective = None;
        let mut effective_sha256 = None;

        if let Some(bytes) = &raw {
            match std::str::from_utf8(bytes) {
                Ok(text) => match document::parse_jsonc(text) {
                    Ok(value) => {
                        effective_sha256 = Some(sha256(&canonical_bytes(&value)));
                        load_errors.extend(EffectiveConfig::validate(&value));
                        effective = Some(value);
                    }
                    Err(e) => load_errors.push(e),
                },
                Err(e) => load_errors.push(format!("config is not UTF-8: {e}")),
            }
        }
        // An absent file leaves `effective` unset; mutations start from the
        // empty document.

        Ok(ConfigSnapshot {
            path: self.path.clone(),
            exists: raw.is_some(),
            load_success: load_errors.is_empty(),
            raw,
            raw_sha256,
            effective,
            effective_sha256,
            load_errors,
        })
    }

    /// Set the value at `path`, honoring the CAS hash when given.
    pub fn set_value(
        &self,
        path: &str,
        value: Value,
        expected_raw_hash: Option<[u8; 32]>,
    ) -> Result<ConfigSnapshot> {
        self.apply(
            &[ConfigOp::Set {
                path: path.to_string(),
                value,
            }],
            expected_raw_hash,
        )
    }

    pub fn delete_value(
        &self,
        path: &str,
        expected_raw_hash: Option<[u8; 32]>,
    ) -> Result<ConfigSnapshot> {
        self.apply(
            &[ConfigOp::Delete {
                path: path.to_string(),
            }],
            expected_raw_hash,
        )
    }

    /// Deep-merge `value` into the document root.
    pub fn patch(&self, value: Value, expected_raw_hash: Option<[u8; 32]>) -> Result<ConfigSnapshot> {
        self.apply(&[ConfigOp::Patch { path: None, value }], expected_raw_hash)
    }

    /// Apply an ordered mutation batch under one CAS check and one write.
    pub fn apply(
        &self,
        ops: &[ConfigOp],
        expected_raw_hash: Option<[u8; 32]>,
    ) -> Result<ConfigSnapshot> {
        // Pre-validate op paths so a bad path never costs a write cycle.
        for op in ops {
            match op {
                ConfigOp::Set { path, .. } | ConfigOp::Delete { path } => {
                    parse_path(path).map_err(ConfigError::Path)?;
                }
                ConfigOp::Patch { path: Some(p), .. } => {
                    parse_path(p).map_err(ConfigError::Path)?;
                }
                ConfigOp::Patch { path: None, .. } => {}
            }
        }

        let before = self.snapshot()?;
        if let Some(expected) = expected_raw_hash {
            if expected != before.raw_sha256 {
                return Err(ConfigError::Conflict {
                    expected: hex::encode(expected),
                    actual: before.raw_hash_hex(),
                });
            }
        }
        if !before.load_success {
            // Refuse to mutate a document we cannot faithfully rewrite.
            return Err(ConfigError::Validation(before.load_errors));
        }

        let mut doc = before
            .effective
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        document::apply_ops(&mut doc, ops).map_err(ConfigError::Path)?;

        let mut serialized = serde_json::to_vec_pretty(&doc)
            .map_err(|e| ConfigError::Validation(vec![format!("serialize failed: {e}")]))?;
        serialized.push(b'\n');

        self.atomic_write(&serialized)?;

        // Validate-or-rollback: re-read what actually landed on disk.
        let after = self.snapshot()?;
        if !after.load_success {
            warn!(
                path = %self.path.display(),
                errors = ?after.load_errors,
                "config mutation produced an invalid document; rolling back"
            );
            match &before.raw {
                Some(prev) => self.atomic_write(prev)?,
                None => {
                    fs::remove_file(&self.path)?;
                }
            }
            return Err(ConfigError::Validation(after.load_errors));
        }

        debug!(
            path = %self.path.display(),
            raw_hash = %after.raw_hash_hex(),
            "config mutation committed"
        );
        Ok(after)
    }

    /// Atomic write protocol: tmp + fsync, backup copy, rename, dir fsync,
    /// backup pruning. On rename failure the tmp file is removed; the
    /// target is never observed half-written.
    fn atomic_write(&self, bytes: &[u8]) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;

        let ts = chrono::Utc::now().timestamp_millis();
        let pid = std::process::id();
        let tmp = self.path.with_file_name(format!(
            "{}.{pid}.{ts}.tmp",
            self.file_name()
        ));

        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }

        if self.path.exists() {
            let backup = self.path.with_file_name(format!("{}.bak.{ts}", self.file_name()));
            fs::copy(&self.path, &backup)?;
        }

        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        // Persist the rename itself.
        if let Ok(dir) = fs::File::open(&parent) {
            let _ = dir.sync_all();
        }

        self.prune_backups()?;
        Ok(())
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config.jsonc".to_string())
    }

    fn prune_backups(&self) -> Result<()> {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        let prefix = format!("{}.bak.", self.file_name());
        let mut backups: Vec<PathBuf> = fs::read_dir(parent)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        // The timestamp suffix sorts lexicographically for same-width millis;
        // newest last.
        backups.sort();
        while backups.len() > self.max_backups {
            let victim = backups.remove(0);
            let _ = fs::remove_file(victim);
        }
        Ok(())
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Canonical serialization for the effective hash: serde_json's map is
/// key-ordered, so equal values always produce equal bytes.
fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("config.jsonc"))
    }

    #[test]
    fn missing_file_snapshot_hashes_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let snap = store_in(&dir).snapshot().unwrap();
        assert!(!snap.exists);
        assert!(snap.raw.is_none());
        assert_eq!(
            snap.raw_hash_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn set_then_delete_restores_effective_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .set_value("agents.mozi.main", json!(true), None)
            .unwrap();
        let before = store.snapshot().unwrap();

        store.set_value("logging.level", json!("debug"), None).unwrap();
        let after_set = store.snapshot().unwrap();
        assert_ne!(before.raw_sha256, after_set.raw_sha256);

        store.delete_value("logging.level", None).unwrap();
        store.delete_value("logging", None).unwrap();
        let after_delete = store.snapshot().unwrap();
        assert_eq!(before.effective_sha256, after_delete.effective_sha256);
    }

    #[test]
    fn stale_hash_conflicts_and_leaves_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.set_value("meta.name", json!("mozi"), None).unwrap();

        let reader_a = store.snapshot().unwrap();
        let reader_b = store.snapshot().unwrap();

        // A wins the race.
        store
            .set_value("meta.name", json!("a"), Some(reader_a.raw_sha256))
            .unwrap();

        // B loses with the stale token.
        let err = store
            .set_value("meta.name", json!("b"), Some(reader_b.raw_sha256))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict { .. }));
        assert_eq!(err.exit_code(), 2);

        let now = store.snapshot().unwrap();
        let doc = now.effective.unwrap();
        assert_eq!(doc["meta"]["name"], json!("a"));
    }

    #[test]
    fn every_commit_changes_raw_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut hashes = Vec::new();
        for i in 0..3 {
            let snap = store.set_value("counter", json!(i), None).unwrap();
            hashes.push(snap.raw_sha256);
        }
        assert_ne!(hashes[0], hashes[1]);
        assert_ne!(hashes[1], hashes[2]);
    }

    #[test]
    fn backups_rotate_to_newest_n() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).with_max_backups(2);
        for i in 0..6 {
            store.set_value("n", json!(i), None).unwrap();
            // Distinct millisecond timestamps keep backup names unique.
            std::thread::sleep(std::time::Duration::from_millis(3));
        }
        let backups = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
            .count();
        assert!(backups <= 2, "expected at most 2 backups, found {backups}");
    }

    #[test]
    fn invalid_mutation_rolls_back_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .apply(
                &[
                    ConfigOp::Set {
                        path: "agents.a.main".into(),
                        value: json!(true),
                    },
                ],
                None,
            )
            .unwrap();
        let before = store.snapshot().unwrap();

        // Two main agents violates the schema.
        let err = store
            .set_value("agents.b.main", json!(true), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let after = store.snapshot().unwrap();
        assert_eq!(before.raw_sha256, after.raw_sha256);
    }

    #[test]
    fn sentinel_keeps_secret_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .set_value("models.openai.apiKey", json!("sk-secret"), None)
            .unwrap();
        store
            .set_value(
                "models.openai.apiKey",
                json!(document::REDACTION_SENTINEL),
                None,
            )
            .unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(
            snap.effective.unwrap()["models"]["openai"]["apiKey"],
            json!("sk-secret")
        );
    }

    #[test]
    fn refuses_to_mutate_unparseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), b"{ not json at all").unwrap();
        let err = store.set_value("a", json!(1), None).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
