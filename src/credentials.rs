use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use keyring::{Entry, Error as KeyringError};

use crate::config::EmailAccount;
use crate::error::SyncError;

const SERVICE: &str = "mailsync-imap";

/// An account password. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(\"***\")")
    }
}

/// Source of account passwords for the session layer.
pub trait CredentialProvider: Send + Sync {
    fn secret(&self, account: &EmailAccount) -> Result<Secret, SyncError>;
}

/// Passwords in the system keyring.
#[derive(Clone, Debug)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE.to_string(),
        }
    }

    pub fn store_password(&self, account_id: &str, password: &str) -> Result<()> {
        let entry =
            Entry::new(&self.service, account_id).context("Failed to create keyring entry")?;
        entry
            .set_password(password)
            .context("Failed to store password in keyring")?;
        log::debug!("Password stored in keyring for {}", account_id);
        Ok(())
    }

    pub fn get_password(&self, account_id: &str) -> Result<Option<String>> {
        let entry =
            Entry::new(&self.service, account_id).context("Failed to create keyring entry")?;
        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to retrieve password: {}", e)),
        }
    }

    pub fn delete_password(&self, account_id: &str) -> Result<()> {
        let entry =
            Entry::new(&self.service, account_id).context("Failed to create keyring entry")?;
        match entry.delete_password() {
            Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to delete password: {}", e)),
        }
    }

    /// Probes the keyring with a throwaway entry.
    pub fn is_available() -> bool {
        let Ok(entry) = Entry::new("mailsync-probe", "probe") else {
            return false;
        };
        if entry.set_password("probe").is_err() {
            return false;
        }
        let _ = entry.delete_password();
        true
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Obfuscated password files for systems without a keyring.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new() -> Result<Self> {
        let dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("mailsync")
            .join("credentials");
        Self::in_dir(dir)
    }

    pub fn in_dir(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).context("Failed to create credentials directory")?;
        Ok(Self { dir })
    }

    fn file(&self, account_id: &str) -> PathBuf {
        self.dir.join(format!("{}.enc", account_id))
    }

    pub fn store_password(&self, account_id: &str, password: &str) -> Result<()> {
        let data = obfuscate(password.as_bytes(), account_id);
        std::fs::write(self.file(account_id), data)
            .context("Failed to write password file")?;
        log::warn!(
            "Password for {} stored in a file; install a system keyring for real protection",
            account_id
        );
        Ok(())
    }

    pub fn get_password(&self, account_id: &str) -> Result<Option<String>> {
        let path = self.file(account_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path).context("Failed to read password file")?;
        let password = String::from_utf8(obfuscate(&data, account_id))
            .context("Failed to decode password")?;
        Ok(Some(password))
    }

    pub fn delete_password(&self, account_id: &str) -> Result<()> {
        let path = self.file(account_id);
        if path.exists() {
            std::fs::remove_file(&path).context("Failed to delete password file")?;
        }
        Ok(())
    }
}

fn obfuscate(data: &[u8], account_id: &str) -> Vec<u8> {
    let seed = account_id.as_bytes();
    if seed.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .enumerate()
        .map(|(i, &byte)| byte ^ seed[i % seed.len()] ^ (i % 32) as u8)
        .collect()
}

/// Keyring when the platform has one, password files otherwise.
#[derive(Clone, Debug)]
pub enum SecureCredentials {
    SystemKeyring(KeyringStore),
    Fallback(FileStore),
}

impl SecureCredentials {
    pub fn new() -> Result<Self> {
        if KeyringStore::is_available() {
            Ok(Self::SystemKeyring(KeyringStore::new()))
        } else {
            Ok(Self::Fallback(FileStore::new()?))
        }
    }

    pub fn store_password(&self, account_id: &str, password: &str) -> Result<()> {
        match self {
            Self::SystemKeyring(store) => store.store_password(account_id, password),
            Self::Fallback(store) => store.store_password(account_id, password),
        }
    }

    pub fn get_password(&self, account_id: &str) -> Result<Option<String>> {
        match self {
            Self::SystemKeyring(store) => store.get_password(account_id),
            Self::Fallback(store) => store.get_password(account_id),
        }
    }

    pub fn delete_password(&self, account_id: &str) -> Result<()> {
        match self {
            Self::SystemKeyring(store) => store.delete_password(account_id),
            Self::Fallback(store) => store.delete_password(account_id),
        }
    }
}

impl CredentialProvider for SecureCredentials {
    fn secret(&self, account: &EmailAccount) -> Result<Secret, SyncError> {
        match self.get_password(&account.email) {
            Ok(Some(password)) => Ok(Secret::new(password)),
            Ok(None) => Err(SyncError::Auth(format!(
                "no password stored for {}",
                account.email
            ))),
            Err(e) => Err(SyncError::TransientConnect(format!(
                "credential store unavailable: {:#}",
                e
            ))),
        }
    }
}

/// In-memory passwords keyed by account email.
#[derive(Default)]
pub struct StaticCredentials {
    secrets: Mutex<HashMap<String, Secret>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, email: &str, password: &str) -> Self {
        self.insert(email, password);
        self
    }

    pub fn insert(&self, email: &str, password: &str) {
        self.secrets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(email.to_string(), Secret::new(password));
    }
}

impl CredentialProvider for StaticCredentials {
    fn secret(&self, account: &EmailAccount) -> Result<Secret, SyncError> {
        self.secrets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&account.email)
            .cloned()
            .ok_or_else(|| SyncError::Auth(format!("no password for {}", account.email)))
    }
}
