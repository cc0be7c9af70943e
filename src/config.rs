use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffPolicy;

/// Servers drop an IDLE after 30 minutes; renewal has to come before that.
const MAX_IDLE_RENEWAL_SECS: u64 = 29 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Failed to create config directory")]
    CreateDirError,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImapSecurity {
    None,
    StartTLS,
    SSL,
}

impl ImapSecurity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "none" => Some(ImapSecurity::None),
            "starttls" => Some(ImapSecurity::StartTLS),
            "ssl" | "tls" => Some(ImapSecurity::SSL),
            _ => None,
        }
    }
}

/// One remote mailbox account. Passwords live in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAccount {
    pub name: String,
    pub email: String,
    pub imap_server: String,
    pub imap_port: u16,
    pub imap_security: ImapSecurity,
    pub imap_username: String,
}

impl Default for EmailAccount {
    fn default() -> Self {
        Self {
            name: "Default Account".to_string(),
            email: "user@example.com".to_string(),
            imap_server: "imap.example.com".to_string(),
            imap_port: 993,
            imap_security: ImapSecurity::SSL,
            imap_username: "user@example.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Seconds between timed passes in daemon mode.
    pub interval_secs: u64,
    pub use_idle: bool,
    pub watch_folder: String,
    pub idle_renewal_secs: u64,
    pub batch_size: usize,
    /// Connect, read and write timeout for server round trips.
    pub operation_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            use_idle: true,
            watch_folder: "INBOX".to_string(),
            idle_renewal_secs: 25 * 60,
            batch_size: 50,
            operation_timeout_secs: 60,
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_renewal(&self) -> Duration {
        Duration::from_secs(self.idle_renewal_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamSettings {
    pub enabled: bool,
    pub threshold: f64,
    pub auto_move_to_junk: bool,
}

impl Default for SpamSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.8,
            auto_move_to_junk: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub accounts: Vec<EmailAccount>,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub spam: SpamSettings,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Overrides the default database location.
    #[serde(default)]
    pub database_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accounts: vec![],
            sync: SyncSettings::default(),
            spam: SpamSettings::default(),
            backoff: BackoffPolicy::default(),
            database_path: None,
        }
    }
}

impl Config {
    pub fn default_path() -> &'static str {
        "~/.config/mailsync/config.json"
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);

        // A missing file means a fresh install
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let path = Path::new(path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::CreateDirError)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        if sync.idle_renewal_secs == 0 || sync.idle_renewal_secs >= MAX_IDLE_RENEWAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "sync.idle_renewal_secs must be between 1 and {}",
                MAX_IDLE_RENEWAL_SECS - 1
            )));
        }
        if sync.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.interval_secs must be at least 1".to_string(),
            ));
        }
        if sync.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "sync.batch_size must be at least 1".to_string(),
            ));
        }
        if sync.operation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.operation_timeout_secs must be at least 1".to_string(),
            ));
        }
        if sync.watch_folder.trim().is_empty() {
            return Err(ConfigError::Invalid("sync.watch_folder is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.spam.threshold) {
            return Err(ConfigError::Invalid(
                "spam.threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        self.backoff.validate().map_err(ConfigError::Invalid)?;

        for (i, account) in self.accounts.iter().enumerate() {
            if self.accounts[..i].iter().any(|a| a.email == account.email) {
                return Err(ConfigError::Invalid(format!(
                    "account {} is configured twice",
                    account.email
                )));
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => PathBuf::from(shellexpand::tilde(path).into_owned()),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mailsync")
                .join("mail.db"),
        }
    }

    pub fn find_account(&self, email: &str) -> Option<&EmailAccount> {
        self.accounts.iter().find(|a| a.email == email)
    }

    /// Adds the account, or replaces the one with the same email address.
    pub fn add_account(&mut self, account: EmailAccount) {
        match self.accounts.iter_mut().find(|a| a.email == account.email) {
            Some(existing) => *existing = account,
            None => self.accounts.push(account),
        }
    }

    pub fn remove_account(&mut self, email: &str) -> Result<EmailAccount, &'static str> {
        let index = self
            .accounts
            .iter()
            .position(|a| a.email == email)
            .ok_or("No such account")?;

        Ok(self.accounts.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(email: &str) -> EmailAccount {
        EmailAccount {
            email: email.to_string(),
            imap_username: email.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert!(config.accounts.is_empty());
        assert_eq!(config.sync.watch_folder, "INBOX");
        assert_eq!(config.sync.idle_renewal(), Duration::from_secs(1500));
    }

    #[test]
    fn save_then_load_keeps_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.json");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.add_account(account("a@example.com"));
        config.spam.enabled = true;
        config.spam.threshold = 0.65;
        config.backoff.max_ms = 10_000;
        config.save(path).unwrap();

        let loaded = Config::load(path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"accounts": [], "sync": {"interval_secs": 60}, "spam": {"enabled": true}}"#,
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.sync.batch_size, 50);
        assert!(config.spam.enabled);
        assert_eq!(config.spam.threshold, 0.8);
        assert_eq!(config.backoff, BackoffPolicy::default());
    }

    #[test]
    fn renewal_must_stay_under_the_server_limit() {
        let mut config = Config::default();
        config.sync.idle_renewal_secs = 29 * 60;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.sync.idle_renewal_secs = 28 * 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_accounts_are_rejected() {
        let mut config = Config::default();
        config.accounts.push(account("a@example.com"));
        config.accounts.push(account("a@example.com"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn add_replaces_and_remove_drops() {
        let mut config = Config::default();
        config.add_account(account("a@example.com"));
        config.add_account(account("b@example.com"));
        config.add_account(account("c@example.com"));

        let mut renamed = account("b@example.com");
        renamed.name = "Work".to_string();
        config.add_account(renamed);
        assert_eq!(config.accounts.len(), 3);
        assert_eq!(config.find_account("b@example.com").unwrap().name, "Work");

        let removed = config.remove_account("a@example.com").unwrap();
        assert_eq!(removed.email, "a@example.com");
        assert!(config.find_account("a@example.com").is_none());
        assert_eq!(config.accounts.len(), 2);
        assert!(config.remove_account("zz@example.com").is_err());
    }
}
