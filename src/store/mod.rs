//! Session store (encrypted file-based credential persistence)
//!
//! All known accounts plus the last-active pointer are kept as a single
//! record, encrypted with AES-256-GCM in ~/.config/plover/sessions.enc.
//! The encryption key is derived from machine-specific identifiers.
//!
//! Writes replace the whole record atomically (temp file + rename), so a
//! concurrent reader never observes a partially-written set.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

use crate::error::SessionError;
use crate::models::AccountCredential;
use crate::paths;

const NONCE_SIZE: usize = 12;

/// The full persisted record: every known account plus the last-active pointer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Known accounts in login order
    #[serde(default)]
    pub accounts: Vec<AccountCredential>,
    /// DID of the account that was current when last persisted
    #[serde(default)]
    pub last_active_did: Option<String>,
}

/// Durable store for session credentials
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Open the store at the default location (~/.config/plover/sessions.enc)
    pub fn open() -> Result<Self, SessionError> {
        let path = paths::sessions_path().map_err(|e| {
            SessionError::StoreUnavailable(std::io::Error::other(e.to_string()))
        })?;
        Ok(Self { path })
    }

    /// Open the store at a specific path
    pub fn open_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the full persisted record.
    ///
    /// A missing file is an empty snapshot. Undecryptable or unparseable
    /// content surfaces as `CorruptStore` so the caller can log it; callers
    /// treat that as an empty snapshot rather than a fatal condition.
    pub fn read_all(&self) -> Result<StoreSnapshot, SessionError> {
        if !self.path.exists() {
            return Ok(StoreSnapshot::default());
        }

        let encrypted = fs::read(&self.path).map_err(SessionError::StoreUnavailable)?;

        if encrypted.len() < NONCE_SIZE {
            return Err(SessionError::CorruptStore);
        }

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&derive_key())
            .map_err(|_| SessionError::CorruptStore)?;
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SessionError::CorruptStore)?;

        serde_json::from_slice(&plaintext).map_err(|_| SessionError::CorruptStore)
    }

    /// Atomically replace the full persisted record.
    pub fn write_all(&self, snapshot: &StoreSnapshot) -> Result<(), SessionError> {
        let json = serde_json::to_vec(snapshot).map_err(|e| {
            SessionError::StoreUnavailable(std::io::Error::other(e.to_string()))
        })?;

        let cipher = Aes256Gcm::new_from_slice(&derive_key())
            .map_err(|_| SessionError::CorruptStore)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, json.as_slice()).map_err(|_| {
            SessionError::StoreUnavailable(std::io::Error::other("encryption failed"))
        })?;

        let mut output = nonce_bytes.to_vec();
        output.extend(ciphertext);

        // Write to a sibling temp file, then rename over the target. Rename
        // within one directory is atomic on the platforms we care about.
        let tmp = self.path.with_extension("enc.tmp");
        fs::write(&tmp, &output).map_err(SessionError::StoreUnavailable)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&tmp)
                .map_err(SessionError::StoreUnavailable)?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&tmp, perms).map_err(SessionError::StoreUnavailable)?;
        }

        fs::rename(&tmp, &self.path).map_err(SessionError::StoreUnavailable)
    }

    /// Read the last-active DID pointer
    pub fn read_last_active(&self) -> Result<Option<String>, SessionError> {
        Ok(self.read_all()?.last_active_did)
    }

    /// Update only the last-active DID pointer
    pub fn write_last_active(&self, did: Option<&str>) -> Result<(), SessionError> {
        let mut snapshot = self.read_all().unwrap_or_default();
        snapshot.last_active_did = did.map(str::to_string);
        self.write_all(&snapshot)
    }

    /// Remove all persisted state (full logout)
    pub fn clear(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::StoreUnavailable(e)),
        }
    }
}

/// Get machine ID for key derivation
fn get_machine_id() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(id) = fs::read_to_string("/etc/machine-id") {
            return id.trim().to_string();
        }
        if let Ok(id) = fs::read_to_string("/var/lib/dbus/machine-id") {
            return id.trim().to_string();
        }
    }

    // Fallback: home directory path (always available via dirs crate)
    dirs::home_dir()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| "plover-fallback-key".to_string())
}

/// Derive encryption key from machine-specific data
fn derive_key() -> [u8; 32] {
    let mut hasher = Sha256::new();

    hasher.update(get_machine_id().as_bytes());

    if let Some(home) = dirs::home_dir() {
        hasher.update(home.to_string_lossy().as_bytes());
    }

    // Fixed salt for this app
    hasher.update(b"plover-photo-client-v1");

    hasher.finalize().into()
}
