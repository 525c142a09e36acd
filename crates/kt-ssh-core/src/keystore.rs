//! KeyStore: the process-global SSH authentication identity (§4.1)
//!
//! Completes a TODO the teacher left itself in
//! `load_or_generate_host_key` ("Host key persistence not yet implemented -
//! key will change on restart") by actually writing the generated keypair
//! to disk with the permissions §4.1 requires.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use russh_keys::key::{KeyPair, PublicKey};

use kt_core::error::{ConfigError, KtError};

const PRIVATE_KEY_FILE: &str = "ssh_key";
const PUBLIC_KEY_FILE: &str = "ssh_key.pub";
const PUBLIC_KEY_COMMENT: &str = "kterminus-core";

/// Owns the single asymmetric identity used to authenticate SSH connections
/// to every agent. Exactly one exists per process (§3); `Reload` lets an
/// operator rotate it out from under a running process without disturbing
/// already-established Connections.
pub struct KeyStore {
    inner: RwLock<KeyMaterial>,
    data_dir: PathBuf,
}

struct KeyMaterial {
    signer: KeyPair,
    public_line: String,
}

impl KeyStore {
    /// Load the keypair at `<data_dir>/ssh_key`, generating and persisting
    /// a fresh Ed25519 pair if it does not exist. Any failure here (I/O,
    /// parse, directory creation) is fatal at startup, per §4.1.
    pub fn load_or_generate(data_dir: impl Into<PathBuf>) -> Result<Self, KtError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let private_path = data_dir.join(PRIVATE_KEY_FILE);
        let public_path = data_dir.join(PUBLIC_KEY_FILE);

        let (signer, public_line) = if private_path.exists() {
            let signer = load_private_key(&private_path)?;
            let public_line = if public_path.exists() {
                std::fs::read_to_string(&public_path)?.trim().to_string()
            } else {
                tracing::warn!(
                    "private key present but public key missing at {:?}; re-deriving",
                    public_path
                );
                let line = public_key_line(&signer)?;
                write_public_key(&public_path, &line)?;
                line
            };
            (signer, public_line)
        } else {
            tracing::info!("generating new SSH keypair at {:?}", private_path);
            let signer = KeyPair::generate_ed25519()
                .ok_or_else(|| ConfigError::Invalid("failed to generate Ed25519 key".into()))?;
            let public_line = public_key_line(&signer)?;
            write_private_key(&private_path, &signer)?;
            write_public_key(&public_path, &public_line)?;
            (signer, public_line)
        };

        Ok(Self {
            inner: RwLock::new(KeyMaterial {
                signer,
                public_line,
            }),
            data_dir,
        })
    }

    /// The signer used for SSH client authentication.
    pub fn signer(&self) -> KeyPair {
        self.inner.read().expect("keystore lock poisoned").signer.clone()
    }

    /// The public key in the single-line `algorithm base64` format the
    /// orchestrator's key-install operation expects.
    pub fn public_key_line(&self) -> String {
        self.inner
            .read()
            .expect("keystore lock poisoned")
            .public_line
            .clone()
    }

    /// Atomically swap in a freshly generated keypair, persisting it over
    /// the existing files. Connections already established keep using the
    /// old identity until they reconnect (§4.1) — Reload only changes what
    /// future `Connect`/Reconnector attempts sign with.
    pub fn reload(&self) -> Result<(), KtError> {
        let private_path = self.data_dir.join(PRIVATE_KEY_FILE);
        let public_path = self.data_dir.join(PUBLIC_KEY_FILE);

        let signer = KeyPair::generate_ed25519()
            .ok_or_else(|| ConfigError::Invalid("failed to generate Ed25519 key".into()))?;
        let public_line = public_key_line(&signer)?;
        write_private_key(&private_path, &signer)?;
        write_public_key(&public_path, &public_line)?;

        let mut guard = self.inner.write().expect("keystore lock poisoned");
        guard.signer = signer;
        guard.public_line = public_line;
        Ok(())
    }
}

fn load_private_key(path: &Path) -> Result<KeyPair, KtError> {
    russh_keys::load_secret_key(path, None).map_err(|e| {
        KtError::Config(ConfigError::BadKeyFormat {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    })
}

fn public_key_line(signer: &KeyPair) -> Result<String, KtError> {
    let public: PublicKey = signer
        .clone_public_key()
        .map_err(|e| ConfigError::Invalid(format!("failed to derive public key: {e}")))?;

    let mut encoded = Vec::new();
    russh_keys::write_public_key_base64(&mut encoded, &public)
        .map_err(|e| ConfigError::Invalid(format!("failed to encode public key: {e}")))?;
    let encoded = String::from_utf8(encoded)
        .map_err(|e| ConfigError::Invalid(format!("public key encoding was not UTF-8: {e}")))?;

    Ok(format!("{} {}", encoded, PUBLIC_KEY_COMMENT))
}

#[cfg(unix)]
fn write_private_key(path: &Path, signer: &KeyPair) -> Result<(), KtError> {
    use std::os::unix::fs::PermissionsExt;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(signer, &mut pem)
        .map_err(|e| ConfigError::Invalid(format!("failed to encode private key: {e}")))?;

    let mut file = std::fs::File::create(path)?;
    file.write_all(&pem)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, signer: &KeyPair) -> Result<(), KtError> {
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(signer, &mut pem)
        .map_err(|e| ConfigError::Invalid(format!("failed to encode private key: {e}")))?;
    std::fs::write(path, pem)?;
    Ok(())
}

#[cfg(unix)]
fn write_public_key(path: &Path, line: &str) -> Result<(), KtError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("{line}\n"))?;
    std::fs::File::open(path)?.set_permissions(std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_public_key(path: &Path, line: &str) -> Result<(), KtError> {
    std::fs::write(path, format!("{line}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_and_persists_a_keypair() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::load_or_generate(dir.path()).unwrap();

        assert!(dir.path().join(PRIVATE_KEY_FILE).exists());
        assert!(dir.path().join(PUBLIC_KEY_FILE).exists());
        assert!(store.public_key_line().starts_with("ssh-ed25519 "));
    }

    #[test]
    fn reloading_an_existing_store_reuses_the_persisted_key() {
        let dir = TempDir::new().unwrap();
        let first = KeyStore::load_or_generate(dir.path()).unwrap();
        let first_public = first.public_key_line();
        drop(first);

        let second = KeyStore::load_or_generate(dir.path()).unwrap();
        assert_eq!(second.public_key_line(), first_public);
    }

    #[test]
    fn missing_public_file_is_rederived() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::load_or_generate(dir.path()).unwrap();
        let public_line = store.public_key_line();
        drop(store);

        std::fs::remove_file(dir.path().join(PUBLIC_KEY_FILE)).unwrap();
        let reloaded = KeyStore::load_or_generate(dir.path()).unwrap();
        assert_eq!(reloaded.public_key_line(), public_line);
        assert!(dir.path().join(PUBLIC_KEY_FILE).exists());
    }

    #[test]
    fn reload_replaces_the_identity_without_touching_old_references() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::load_or_generate(dir.path()).unwrap();
        let before = store.public_key_line();

        store.reload().unwrap();
        let after = store.public_key_line();

        assert_ne!(before, after);
    }

    #[cfg(unix)]
    #[test]
    fn private_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let _store = KeyStore::load_or_generate(dir.path()).unwrap();
        let meta = std::fs::metadata(dir.path().join(PRIVATE_KEY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
