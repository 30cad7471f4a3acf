//! Filesystem layout around the config directory.
//!
//! ```text
//! {configDir}/config.jsonc        the configuration document
//! {configDir}/.env                auth broker secret store (0600)
//! {configDir}/data/mozi.pid       runtime PID file
//! {configDir}/data/mozi.db        sessions + reminders
//! {configDir}/data/secret.key     at-rest encryption key
//! {configDir}/logs/runtime.log    append-only runtime log
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub config_file: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub pid_file: PathBuf,
    pub db_file: PathBuf,
    pub env_file: PathBuf,
    pub key_file: PathBuf,
    pub log_file: PathBuf,
}

/// Resolve the layout: `--config` beats `MOZI_CONFIG` beats
/// `~/.mozi/config.jsonc`; `MOZI_PID_FILE` relocates only the PID file.
pub fn resolve(config_override: Option<&Path>) -> RuntimePaths {
    let config_file = config_override
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("MOZI_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_file);
    let config_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let data_dir = config_dir.join("data");
    let logs_dir = config_dir.join("logs");
    let pid_file = std::env::var("MOZI_PID_FILE")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("mozi.pid"));

    RuntimePaths {
        env_file: config_dir.join(".env"),
        db_file: data_dir.join("mozi.db"),
        key_file: data_dir.join("secret.key"),
        log_file: logs_dir.join("runtime.log"),
        config_file,
        config_dir,
        data_dir,
        logs_dir,
        pid_file,
    }
}

fn default_config_file() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".mozi").join("config.jsonc")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins() {
        let paths = resolve(Some(Path::new("/tmp/custom/conf.jsonc")));
        assert_eq!(paths.config_file, Path::new("/tmp/custom/conf.jsonc"));
        assert_eq!(paths.config_dir, Path::new("/tmp/custom"));
        assert_eq!(paths.db_file, Path::new("/tmp/custom/data/mozi.db"));
        assert_eq!(paths.log_file, Path::new("/tmp/custom/logs/runtime.log"));
    }
}
