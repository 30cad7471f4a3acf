//! `.env` secret file maintenance.
//!
//! The auth broker persists secrets as `KEY=value` lines next to the config
//! document. Merging preserves keys written by other tools, and the file is
//! kept at mode 0o600.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Merge `updates` into the env file at `path`, creating it if missing.
///
/// A `None` value removes the key. Foreign keys and their ordering are
/// preserved; new keys are appended sorted. Comment and blank lines survive.
pub fn merge_env_file(
    path: &Path,
    updates: &BTreeMap<String, Option<String>>,
) -> std::io::Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let mut out: Vec<String> = Vec::new();
    let mut seen: Vec<&str> = Vec::new();

    for line in existing.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push(line.to_string());
            continue;
        }
        let Some((key, _)) = line.split_once('=') else {
            out.push(line.to_string());
            continue;
        };
        let key = key.trim();
        match updates.get(key) {
            Some(Some(value)) => {
                out.push(format!("{key}={value}"));
                seen.push(key);
            }
            Some(None) => {
                // deleted
                seen.push(key);
            }
            None => out.push(line.to_string()),
        }
    }

    for (key, value) in updates {
        if seen.iter().any(|k| *k == key.as_str()) {
            continue;
        }
        if let Some(value) = value {
            out.push(format!("{key}={value}"));
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    for line in &out {
        writeln!(file, "{line}")?;
    }
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Read all `KEY=value` pairs from the env file. Missing file is empty.
pub fn read_env_file(path: &Path) -> std::io::Result<BTreeMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.to_string());
        }
    }
    Ok(map)
}
