//! The on-disk ECDSA keypair stored under `<workingDir>/.jsxtool/host-keys`.
//!
//! The private key authenticates the host agent's `host_init` handshake; the
//! public key is what the bus verifies it against. Both sides of the project
//! (container and host) see the same checkout, so the pair never travels over
//! the network.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use p256::{
    ecdsa::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};
use thiserror::Error;

use crate::config::PROJECT_DIR_NAME;

const KEYS_DIR_NAME: &str = "host-keys";
const PRIVATE_KEY_FILE: &str = "private-key.pem";
const PUBLIC_KEY_FILE: &str = "public-key.pem";

/// Entries that must never be committed from the project directory.
const GITIGNORE_ENTRIES: &[&str] = &["host-keys", "terminal-secret"];

pub struct LocalKeyStore {
    project_dir: PathBuf,
    keys_dir: PathBuf,
    cache: Mutex<Option<SigningKey>>,
}

impl LocalKeyStore {
    pub fn new(working_directory: &Path) -> Self {
        let project_dir = working_directory.join(PROJECT_DIR_NAME);
        let keys_dir = project_dir.join(KEYS_DIR_NAME);

        LocalKeyStore {
            project_dir,
            keys_dir,
            cache: Mutex::new(None),
        }
    }

    /// Returns the project's signing key, reading it from disk on first use
    /// and generating a fresh pair if none exists yet.
    pub fn signing_key(&self) -> Result<SigningKey, KeyStoreError> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(key) = cache.as_ref() {
            return Ok(key.clone());
        }

        let private_path = self.keys_dir.join(PRIVATE_KEY_FILE);
        if !private_path.is_file() {
            drop(cache);
            self.regenerate_key_pair(true)?;
            cache = self.cache.lock().unwrap();
            if let Some(key) = cache.as_ref() {
                return Ok(key.clone());
            }
        }

        let pem = fs_err::read_to_string(&private_path).map_err(|source| KeyStoreError::Io {
            path: private_path.clone(),
            source,
        })?;
        let key = SigningKey::from_pkcs8_pem(&pem).map_err(|source| KeyStoreError::BadKey {
            path: private_path,
            message: source.to_string(),
        })?;

        *cache = Some(key.clone());
        Ok(key)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyStoreError> {
        Ok(*self.signing_key()?.verifying_key())
    }

    /// The SPKI public key as base-64 DER: the PEM file with its armour and
    /// whitespace stripped.
    pub fn public_key_der(&self) -> Result<String, KeyStoreError> {
        // Make sure the pair exists before reading the public half.
        self.signing_key()?;

        let public_path = self.keys_dir.join(PUBLIC_KEY_FILE);
        let pem = fs_err::read_to_string(&public_path).map_err(|source| KeyStoreError::Io {
            path: public_path,
            source,
        })?;

        Ok(pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect::<Vec<_>>()
            .concat())
    }

    /// Generates and writes a fresh P-256 keypair. With `force` unset this is
    /// a no-op when a pair already exists; returns whether a pair was written.
    pub fn regenerate_key_pair(&self, force: bool) -> Result<bool, KeyStoreError> {
        let private_path = self.keys_dir.join(PRIVATE_KEY_FILE);
        let public_path = self.keys_dir.join(PUBLIC_KEY_FILE);

        if !force && private_path.is_file() && public_path.is_file() {
            return Ok(false);
        }

        fs_err::create_dir_all(&self.keys_dir).map_err(|source| KeyStoreError::Io {
            path: self.keys_dir.clone(),
            source,
        })?;

        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let verifying_key = signing_key.verifying_key();

        let private_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|source| KeyStoreError::Encode {
                message: source.to_string(),
            })?;
        let public_pem =
            verifying_key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|source| KeyStoreError::Encode {
                    message: source.to_string(),
                })?;

        write_atomic(&private_path, private_pem.as_bytes())?;
        write_atomic(&public_path, public_pem.as_bytes())?;

        self.ensure_gitignore()?;

        *self.cache.lock().unwrap() = None;
        log::info!("Wrote new host keypair to {}", self.keys_dir.display());

        Ok(true)
    }

    /// Makes sure `.jsxtool/.gitignore` covers the key material and the
    /// terminal secret.
    pub fn ensure_gitignore(&self) -> Result<(), KeyStoreError> {
        let gitignore_path = self.project_dir.join(".gitignore");

        let existing = match fs_err::read_to_string(&gitignore_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(KeyStoreError::Io {
                    path: gitignore_path,
                    source,
                })
            }
        };

        let present: Vec<&str> = existing.lines().map(str::trim).collect();
        let missing: Vec<&str> = GITIGNORE_ENTRIES
            .iter()
            .copied()
            .filter(|entry| !present.contains(entry))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        for entry in missing {
            updated.push_str(entry);
            updated.push('\n');
        }

        fs_err::create_dir_all(&self.project_dir).map_err(|source| KeyStoreError::Io {
            path: self.project_dir.clone(),
            source,
        })?;
        write_atomic(&gitignore_path, updated.as_bytes())
    }
}

/// Write-then-rename so a crash never leaves a half-written key on disk.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), KeyStoreError> {
    let tmp_path = path.with_extension("tmp");

    let result = (|| {
        let mut file = fs_err::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.flush()?;
        drop(file);
        fs_err::rename(&tmp_path, path)
    })();

    result.map_err(|source| KeyStoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Key store I/O error at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unreadable key at {}: {message}", path.display())]
    BadKey { path: PathBuf, message: String },

    #[error("Could not encode key material: {message}")]
    Encode { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_pair_lazily_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalKeyStore::new(dir.path());

        let key_a = store.signing_key().unwrap();
        let key_b = store.signing_key().unwrap();
        assert_eq!(key_a.to_bytes(), key_b.to_bytes());

        assert!(dir
            .path()
            .join(".jsxtool/host-keys/private-key.pem")
            .is_file());
        assert!(dir
            .path()
            .join(".jsxtool/host-keys/public-key.pem")
            .is_file());
    }

    #[test]
    fn regenerate_replaces_the_pair_only_when_forced() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalKeyStore::new(dir.path());

        let original = store.signing_key().unwrap();
        assert!(!store.regenerate_key_pair(false).unwrap());
        assert_eq!(store.signing_key().unwrap().to_bytes(), original.to_bytes());

        assert!(store.regenerate_key_pair(true).unwrap());
        assert_ne!(store.signing_key().unwrap().to_bytes(), original.to_bytes());
    }

    #[test]
    fn public_key_der_is_unarmoured_base64() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalKeyStore::new(dir.path());

        let der = store.public_key_der().unwrap();
        assert!(!der.contains("BEGIN"));
        assert!(!der.contains('\n'));
        assert!(data_encoding::BASE64.decode(der.as_bytes()).is_ok());
    }

    #[test]
    fn gitignore_gains_required_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalKeyStore::new(dir.path());
        store.signing_key().unwrap();

        let contents =
            fs_err::read_to_string(dir.path().join(".jsxtool/.gitignore")).unwrap();
        assert!(contents.lines().any(|line| line == "host-keys"));
        assert!(contents.lines().any(|line| line == "terminal-secret"));
    }
}
