use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::fs;
use tracing::debug;

use crate::error::{ArbiterError, Result};

/// Environment variable that unlocks the credential store.
pub const PASSWORD_ENV: &str = "ARBITER_PASSWORD";

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;

#[derive(Serialize, Deserialize)]
struct EncryptedFile {
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Encrypted key-value store for provider API keys and other secrets.
///
/// AES-256-GCM with a PBKDF2-SHA256 derived key (100k iterations); the file
/// is written with owner-only permissions. The password lives in memory only
/// while the process runs.
pub struct CredentialStore {
    path: PathBuf,
    password: String,
}

impl CredentialStore {
    pub fn open(path: impl Into<PathBuf>, password: impl Into<String>) -> Result<Self> {
        let password = password.into();
        if password.is_empty() {
            return Err(ArbiterError::Credentials("password cannot be empty".into()));
        }
        Ok(Self {
            path: path.into(),
            password,
        })
    }

    /// Opens the store with the password from `ARBITER_PASSWORD`.
    pub fn open_from_env(path: impl Into<PathBuf>) -> Result<Self> {
        let password = std::env::var(PASSWORD_ENV).map_err(|_| {
            ArbiterError::Credentials(format!("{} is not set", PASSWORD_ENV))
        })?;
        Self::open(path, password)
    }

    pub async fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        let file: EncryptedFile = serde_json::from_str(&content)?;

        let salt = decode_hex(&file.salt)?;
        let nonce_bytes = decode_hex(&file.nonce)?;
        let ciphertext = decode_hex(&file.ciphertext)?;
        if nonce_bytes.len() != 12 {
            return Err(ArbiterError::Credentials("corrupt store: bad nonce length".into()));
        }

        let key_bytes = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher.decrypt(nonce, ciphertext.as_ref()).map_err(|_| {
            ArbiterError::Credentials("decryption failed: wrong password or corrupt store".into())
        })?;

        Ok(serde_json::from_slice(&plaintext)?)
    }

    pub async fn save(&self, secrets: &BTreeMap<String, String>) -> Result<()> {
        let plaintext = serde_json::to_vec(secrets)?;

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let key_bytes = self.derive_key(&salt);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| ArbiterError::Credentials("encryption failed".into()))?;

        let file = EncryptedFile {
            salt: encode_hex(&salt),
            nonce: encode_hex(&nonce),
            ciphertext: encode_hex(&ciphertext),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&file)?).await?;
        restrict_permissions(&self.path).await?;
        debug!(path = %self.path.display(), entries = secrets.len(), "Saved credential store");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load().await?.get(key).cloned())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut secrets = self.load().await?;
        secrets.insert(key.to_string(), value.to_string());
        self.save(&secrets).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let mut secrets = self.load().await?;
        secrets.remove(key);
        self.save(&secrets).await
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(self.password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
        key
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(ArbiterError::Credentials("odd-length hex field".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| ArbiterError::Credentials("invalid hex field".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let store = CredentialStore::open(&path, "hunter2-but-long").unwrap();

        store.set("openai", "sk-test-key").await.unwrap();
        store.set("local", "none").await.unwrap();

        assert_eq!(store.get("openai").await.unwrap().as_deref(), Some("sk-test-key"));

        store.remove("local").await.unwrap();
        assert_eq!(store.get("local").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");

        let store = CredentialStore::open(&path, "correct-password").unwrap();
        store.set("k", "v").await.unwrap();

        let wrong = CredentialStore::open(&path, "wrong-password").unwrap();
        assert!(wrong.load().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("absent.json"), "pw").unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let store = CredentialStore::open(&path, "pw").unwrap();
        store.set("k", "v").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_empty_password_refused() {
        assert!(CredentialStore::open("/tmp/x", "").is_err());
    }

    #[test]
    fn test_hex_codec() {
        let bytes = vec![0x00, 0xff, 0x42];
        assert_eq!(decode_hex(&encode_hex(&bytes)).unwrap(), bytes);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }
}
