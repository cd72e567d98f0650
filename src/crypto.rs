//! Token encryption at rest
//!
//! Every call to [`TokenCipher::encrypt`] draws a fresh random salt and IV. The
//! AES-256-GCM key is derived from the master secret and the salt with
//! HKDF-SHA256, and the output is a single hex string laid out as
//! `salt || iv || ciphertext || tag`, so one stored value carries everything
//! needed to decrypt it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::path::Path;
use tracing::info;

const SALT_LENGTH: usize = 64;
const IV_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;
const KEY_LENGTH: usize = 32;
const KEY_INFO: &[u8] = b"repomirror-token-key";

/// Environment variable that overrides the key file
pub const ENCRYPTION_KEY_ENV: &str = "REPOMIRROR_ENCRYPTION_KEY";

/// Authenticated encryption for values kept in the credential store
#[derive(Clone)]
pub struct TokenCipher {
    master: Vec<u8>,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    pub fn new(master: impl AsRef<[u8]>) -> Result<Self> {
        let master = master.as_ref().to_vec();
        if master.is_empty() {
            bail!("Encryption key must not be empty");
        }
        Ok(Self { master })
    }

    /// Use REPOMIRROR_ENCRYPTION_KEY if set, otherwise read (or create) the key file
    pub fn from_env_or_file(key_file: &Path) -> Result<Self> {
        if let Ok(secret) = std::env::var(ENCRYPTION_KEY_ENV) {
            if !secret.is_empty() {
                return Self::new(secret.as_bytes());
            }
        }

        if key_file.exists() {
            let content = std::fs::read_to_string(key_file)
                .with_context(|| format!("Failed to read key file: {}", key_file.display()))?;
            let master = hex::decode(content.trim())
                .with_context(|| format!("Key file is not valid hex: {}", key_file.display()))?;
            return Self::new(master);
        }

        let mut master = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut master);
        write_key_file(key_file, &hex::encode(master))?;
        info!("Generated new master key at {}", key_file.display());

        Self::new(master)
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LENGTH]> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.master);
        let mut key = [0u8; KEY_LENGTH];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|e| anyhow!("HKDF expansion failed: {}", e))?;
        Ok(key)
    }

    /// Encrypt `plaintext` into the self-describing hex format
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LENGTH];
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("Invalid key length: {}", e))?;

        // aes-gcm appends the tag to the ciphertext
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut out = Vec::with_capacity(SALT_LENGTH + IV_LENGTH + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    /// Decrypt a value produced by [`TokenCipher::encrypt`]; fails if it was altered
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = hex::decode(encoded.trim()).context("Encrypted value is not valid hex")?;
        if raw.len() < SALT_LENGTH + IV_LENGTH + TAG_LENGTH {
            bail!("Encrypted value is too short");
        }

        let (salt, rest) = raw.split_at(SALT_LENGTH);
        let (iv, sealed) = rest.split_at(IV_LENGTH);

        let key = self.derive_key(salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("Invalid key length: {}", e))?;

        let plain = cipher
            .decrypt(Nonce::from_slice(iv), sealed)
            .map_err(|_| anyhow!("Decryption failed: wrong key or tampered value"))?;

        String::from_utf8(plain).context("Decrypted value is not valid UTF-8")
    }
}

fn write_key_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create key file directory")?;
    }

    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write key file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to restrict key file permissions")?;
    }

    Ok(())
}
