//! Env-file auth broker: secrets live in `{configDir}/.env` (mode 0600),
//! values encrypted at rest with the per-install key.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use mozi_agent::AuthBroker;
use mozi_core::envfile::{merge_env_file, read_env_file};
use mozi_core::secrets::{decrypt_secret, encrypt_secret, KEY_LEN, NONCE_LEN};
use mozi_core::text::{from_base64, to_base64};

const VALUE_PREFIX: &str = "enc:v1:";

pub struct EnvFileBroker {
    env_file: PathBuf,
    key: [u8; KEY_LEN],
}

impl EnvFileBroker {
    pub fn new(env_file: PathBuf, key: [u8; KEY_LEN]) -> Self {
        Self { env_file, key }
    }

    fn encode(&self, value: &str) -> Result<String, String> {
        let (ciphertext, nonce) = encrypt_secret(value, &self.key)?;
        Ok(format!(
            "{VALUE_PREFIX}{}:{}",
            to_base64(&nonce),
            to_base64(&ciphertext)
        ))
    }

    fn decode(&self, stored: &str) -> Result<String, String> {
        let Some(rest) = stored.strip_prefix(VALUE_PREFIX) else {
            // Hand-written plaintext entries are accepted as-is.
            return Ok(stored.to_string());
        };
        let (nonce_b64, ct_b64) = rest
            .split_once(':')
            .ok_or_else(|| "malformed encrypted value".to_string())?;
        let nonce_bytes = from_base64(nonce_b64)?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| "bad nonce length".to_string())?;
        decrypt_secret(&from_base64(ct_b64)?, &nonce, &self.key)
    }
}

#[async_trait]
impl AuthBroker for EnvFileBroker {
    async fn set_secret(&self, key: &str, value: &str) -> Result<(), String> {
        let key = key.trim().to_uppercase();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err("secret names must be ALL_CAPS identifiers".to_string());
        }
        let mut updates = BTreeMap::new();
        updates.insert(key, Some(self.encode(value)?));
        merge_env_file(&self.env_file, &updates).map_err(|e| e.to_string())
    }

    async fn unset_secret(&self, key: &str) -> Result<(), String> {
        let mut updates = BTreeMap::new();
        updates.insert(key.trim().to_uppercase(), None);
        merge_env_file(&self.env_file, &updates).map_err(|e| e.to_string())
    }

    async fn list_secrets(&self) -> Result<Vec<String>, String> {
        Ok(read_env_file(&self.env_file)
            .map_err(|e| e.to_string())?
            .keys()
            .cloned()
            .collect())
    }

    async fn check_secret(&self, key: &str) -> Result<bool, String> {
        let map = read_env_file(&self.env_file).map_err(|e| e.to_string())?;
        match map.get(&key.trim().to_uppercase()) {
            Some(stored) => Ok(self.decode(stored).map(|v| !v.is_empty()).unwrap_or(false)),
            None => Ok(false),
        }
    }
}
