use std::io::Read;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const APP_PEPPER: &[u8] = b"TDRIVE_SECRET_PEPPER_!@#$%";
const FALLBACK_MACHINE_SECRET: &[u8] = b"fallback_entropy_for_tdrive_!@#$%";
const USER_KEY_ITERATIONS: u32 = 500_000;
const FILE_KEY_ITERATIONS: u32 = 480_000;

/// Authenticated encryption: AES-256-GCM, fresh random 12-byte nonce per
/// call, layout `iv(12) || ciphertext || tag(16)`. Never reuses a
/// (key, nonce) pair because the nonce is drawn fresh from the OS RNG
/// every call.
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext_and_tag = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::Crypto)?;

    let mut out = Vec::with_capacity(IV_LEN + ciphertext_and_tag.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext_and_tag);
    Ok(out)
}

/// Decrypts a blob produced by [`encrypt`]. Fails atomically with
/// [`Error::Crypto`] on any authentication failure or malformed framing;
/// never returns partial plaintext.
pub fn decrypt(blob: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if blob.len() < IV_LEN + TAG_LEN {
        return Err(Error::Crypto);
    }

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&blob[..IV_LEN]);
    let ciphertext_and_tag = &blob[IV_LEN..];

    cipher
        .decrypt(nonce, ciphertext_and_tag)
        .map_err(|_| Error::Crypto)
}

fn machine_secret() -> Vec<u8> {
    match machine_uid::get() {
        Ok(id) => id.into_bytes(),
        Err(_) => FALLBACK_MACHINE_SECRET.to_vec(),
    }
}

fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

/// Deterministic per-user key: mixes a fixed pepper, a per-user salt derived
/// from `user_identity`, and a machine-bound secret. Degrades to a fixed
/// constant if the machine id cannot be read, but stays deterministic.
pub fn derive_user_key(user_identity: &str) -> [u8; 32] {
    let salt = hash_bytes_raw(format!("tdrive-salt-{user_identity}").as_bytes());

    let mut password = APP_PEPPER.to_vec();
    password.extend_from_slice(&machine_secret());

    pbkdf2_sha256(&password, &salt, USER_KEY_ITERATIONS)
}

/// Deterministic per-content key: two non-overlapping slices of the hex
/// content hash serve as password and salt, so resume and dedup always
/// derive the same key for the same content.
pub fn derive_file_key(content_hash_hex: &str) -> [u8; 32] {
    let mid = content_hash_hex.len() / 2;
    let (password, salt) = content_hash_hex.split_at(mid);
    pbkdf2_sha256(password.as_bytes(), salt.as_bytes(), FILE_KEY_ITERATIONS)
}

fn hash_bytes_raw(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// SHA-256 of a file's contents, streamed in 4 KiB reads.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(hash_bytes_raw(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [7u8; 32];
        let msg = b"hello chunk";

        let enc = encrypt(msg, &key).unwrap();
        assert_eq!(enc.len(), msg.len() + IV_LEN + TAG_LEN);

        let dec = decrypt(&enc, &key).unwrap();
        assert_eq!(dec, msg);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let key = [1u8; 32];
        let other = [2u8; 32];
        let enc = encrypt(b"secret", &key).unwrap();
        assert!(matches!(decrypt(&enc, &other), Err(Error::Crypto)));
    }

    #[test]
    fn tampered_ciphertext_fails_atomically() {
        let key = [3u8; 32];
        let mut enc = encrypt(b"tamper me", &key).unwrap();
        let last = enc.len() - 1;
        enc[last] ^= 0xFF;
        assert!(matches!(decrypt(&enc, &key), Err(Error::Crypto)));
    }

    #[test]
    fn derive_file_key_is_deterministic() {
        let hash = hash_bytes(b"some content");
        assert_eq!(derive_file_key(&hash), derive_file_key(&hash));
    }

    #[test]
    fn derive_user_key_is_deterministic() {
        assert_eq!(derive_user_key("user-1"), derive_user_key("user-1"));
        assert_ne!(derive_user_key("user-1"), derive_user_key("user-2"));
    }

    #[test]
    fn hash_bytes_matches_known_vector() {
        // SHA-256 of the empty string, for the empty-file edge case.
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
