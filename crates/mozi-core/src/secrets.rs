//! At-rest secret encryption for the auth broker's store.
//!
//! AES-256-GCM with a per-install key file. Values are stored as
//! `nonce || ciphertext`; the nonce is fresh per encryption.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Encrypt `plaintext`; returns `(ciphertext, nonce)`.
pub fn encrypt_secret(plaintext: &str, key: &[u8; KEY_LEN]) -> Result<(Vec<u8>, [u8; NONCE_LEN]), String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| format!("encryption failed: {e}"))?;
    let mut nonce_out = [0u8; NONCE_LEN];
    nonce_out.copy_from_slice(&nonce);
    Ok((ciphertext, nonce_out))
}

/// Decrypt a `(ciphertext, nonce)` pair produced by [`encrypt_secret`].
pub fn decrypt_secret(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
    key: &[u8; KEY_LEN],
) -> Result<String, String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| format!("decryption failed: {e}"))?;
    String::from_utf8(plaintext).map_err(|e| format!("decrypted secret is not UTF-8: {e}"))
}

/// Load the key file, generating (0o600) one on first use.
pub fn load_or_create_key(path: &std::path::Path) -> std::io::Result<[u8; KEY_LEN]> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == KEY_LEN => {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes);
            Ok(key)
        }
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("secret key file {} has the wrong length", path.display()),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key: [u8; KEY_LEN] = Aes256Gcm::generate_key(&mut OsRng).into();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, key)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
            Ok(key)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_restores_plaintext() {
        let key = [7u8; KEY_LEN];
        for plaintext in ["", "sk-abc123", "пароль", "a much longer secret value with spaces"] {
            let (ciphertext, nonce) = encrypt_secret(plaintext, &key).unwrap();
            assert_eq!(decrypt_secret(&ciphertext, &nonce, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let key = [1u8; KEY_LEN];
        let other = [2u8; KEY_LEN];
        let (ciphertext, nonce) = encrypt_secret("secret", &key).unwrap();
        assert!(decrypt_secret(&ciphertext, &nonce, &other).is_err());
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let key = [3u8; KEY_LEN];
        let (_, n1) = encrypt_secret("x", &key).unwrap();
        let (_, n2) = encrypt_secret("x", &key).unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn key_file_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/secret.key");
        let k1 = load_or_create_key(&path).unwrap();
        let k2 = load_or_create_key(&path).unwrap();
        assert_eq!(k1, k2);
    }
}
