//! Credential cache: a small JSON file `{api_id, encrypted_blob}` where
//! `encrypted_blob` is an AEAD-encrypted serialized object holding the
//! remaining credentials plus the cached storage-channel id. The encryption
//! key is derived from the user identity and the machine-bound secret via
//! [`crate::crypto::derive_user_key`], so the cache is only ever readable on
//! the machine that wrote it for that user.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::{Error, Result};

pub const CREDENTIAL_CACHE_FILE_NAME: &str = "credentials.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialFile {
    api_id: String,
    encrypted_blob: String,
}

/// The plaintext payload of the credential cache: whatever the remote
/// channel implementation needs to re-authenticate, plus the storage
/// channel id located by `ensure_channel` on a prior run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Credentials {
    pub bot_token: Option<String>,
    pub storage_channel_id: Option<String>,
}

pub fn credential_cache_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CREDENTIAL_CACHE_FILE_NAME)
}

/// Loads and decrypts the credential cache for `user_identity`, if present.
pub fn load(path: &Path, user_identity: &str) -> Result<Option<Credentials>> {
    if !path.exists() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(path)?;
    let file: CredentialFile = serde_json::from_str(&text).map_err(|e| Error::InvalidConfig {
        message: format!("invalid credential cache: {e}"),
    })?;
    if file.api_id != user_identity {
        return Ok(None);
    }

    let blob = base64::engine::general_purpose::STANDARD
        .decode(file.encrypted_blob.as_bytes())
        .map_err(|e| Error::InvalidConfig {
            message: format!("invalid credential cache encoding: {e}"),
        })?;

    let key = crypto::derive_user_key(user_identity);
    let plaintext = crypto::decrypt(&blob, &key)?;
    let credentials: Credentials = serde_json::from_slice(&plaintext).map_err(|e| Error::InvalidConfig {
        message: format!("corrupt credential cache payload: {e}"),
    })?;
    Ok(Some(credentials))
}

/// Encrypts and atomically writes the credential cache for `user_identity`.
pub fn save(path: &Path, user_identity: &str, credentials: &Credentials) -> Result<()> {
    let key = crypto::derive_user_key(user_identity);
    let plaintext = serde_json::to_vec(credentials).map_err(|e| Error::Other {
        message: format!("failed to serialize credentials: {e}"),
    })?;
    let blob = crypto::encrypt(&plaintext, &key)?;

    let file = CredentialFile {
        api_id: user_identity.to_string(),
        encrypted_blob: base64::engine::general_purpose::STANDARD.encode(blob),
    };
    let text = serde_json::to_string_pretty(&file).map_err(|e| Error::Other {
        message: format!("failed to serialize credential cache: {e}"),
    })?;

    write_atomic_private(path, text.as_bytes())?;
    Ok(())
}

fn write_atomic_private(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");

    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_rejects_wrong_user() {
        let dir = tempfile::tempdir().unwrap();
        let path = credential_cache_path(dir.path());

        let creds = Credentials {
            bot_token: Some("secret-token".to_string()),
            storage_channel_id: Some("chan-1".to_string()),
        };
        save(&path, "user-a", &creds).unwrap();

        let loaded = load(&path, "user-a").unwrap().unwrap();
        assert_eq!(loaded.bot_token.as_deref(), Some("secret-token"));
        assert_eq!(loaded.storage_channel_id.as_deref(), Some("chan-1"));

        // A different identity derives a different key and the api_id
        // tag doesn't even match, so it's treated as absent rather than
        // attempted-and-failed.
        assert!(load(&path, "user-b").unwrap().is_none());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = credential_cache_path(dir.path());
        assert!(load(&path, "user-a").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn cache_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = credential_cache_path(dir.path());
        save(&path, "user-a", &Credentials::default()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
