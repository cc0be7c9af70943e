use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use mailsync::classify::{JunkPolicy, SpamHeaderClassifier};
use mailsync::config::{Config, EmailAccount, ImapSecurity};
use mailsync::coordinator::{SyncCoordinator, TriggerSource};
use mailsync::credentials::SecureCredentials;
use mailsync::engine::SyncEngine;
use mailsync::imap_client::ImapConnector;
use mailsync::model::FolderKey;
use mailsync::push::PushListener;
use mailsync::store::MailStore;
use mailsync::sync::SyncOptions;

/// Keeps a local replica of IMAP mailboxes in sync
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file
    #[clap(short, long, default_value = "~/.config/mailsync/config.json")]
    config: String,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add an email account, or replace the one with the same address
    AddAccount {
        /// Account name
        #[clap(short, long)]
        name: String,

        /// Email address
        #[clap(short, long)]
        email: String,

        /// IMAP server address
        #[clap(long)]
        imap_server: String,

        /// IMAP server port
        #[clap(long, default_value = "993")]
        imap_port: u16,

        /// IMAP security (None, StartTLS, SSL)
        #[clap(long, default_value = "SSL")]
        imap_security: String,

        /// IMAP username, if different from the email address
        #[clap(long)]
        imap_username: Option<String>,

        /// IMAP password
        #[clap(long)]
        imap_password: String,
    },

    /// List configured accounts
    ListAccounts,

    /// Remove an account and everything stored for it
    RemoveAccount {
        /// Email address
        #[clap(short, long)]
        email: String,
    },

    /// Delete the local copy of a folder; the next sync downloads it again
    RemoveFolder {
        /// Account email address
        #[clap(short, long)]
        account: String,

        /// Folder name
        #[clap(short, long)]
        folder: String,
    },

    /// Synchronize once and exit
    Sync {
        /// Only this account
        #[clap(short, long)]
        account: Option<String>,

        /// Only this folder (requires --account)
        #[clap(short, long, requires = "account")]
        folder: Option<String>,
    },

    /// Keep synchronizing until interrupted
    Daemon,

    /// Show what the local replica holds
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config_path = shellexpand::tilde(&args.config).into_owned();
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    match args.command {
        Commands::AddAccount {
            name,
            email,
            imap_server,
            imap_port,
            imap_security,
            imap_username,
            imap_password,
        } => {
            let Some(imap_security) = ImapSecurity::parse(&imap_security) else {
                bail!(
                    "Invalid IMAP security setting '{}' (expected None, StartTLS or SSL)",
                    imap_security
                );
            };
            let account = EmailAccount {
                name,
                imap_username: imap_username.unwrap_or_else(|| email.clone()),
                email,
                imap_server,
                imap_port,
                imap_security,
            };

            let credentials = SecureCredentials::new()?;
            credentials
                .store_password(&account.email, &imap_password)
                .context("Failed to store IMAP password")?;

            println!("Added account {} <{}>", account.name, account.email);
            config.add_account(account);
            config.save(&config_path).context("Failed to save config")?;
        }

        Commands::ListAccounts => {
            if config.accounts.is_empty() {
                println!("No accounts configured");
            }
            for account in &config.accounts {
                println!(
                    "{} <{}> {}:{} ({:?})",
                    account.name,
                    account.email,
                    account.imap_server,
                    account.imap_port,
                    account.imap_security
                );
            }
        }

        Commands::RemoveAccount { email } => {
            let removed = config.remove_account(&email).map_err(|e| anyhow!(e))?;
            config.save(&config_path).context("Failed to save config")?;

            if let Err(e) = SecureCredentials::new().and_then(|c| c.delete_password(&email)) {
                log::warn!("Could not delete stored password for {}: {:#}", email, e);
            }
            let store = open_store(&config)?;
            store.remove_account(&email)?;
            println!("Removed account {} <{}>", removed.name, removed.email);
        }

        Commands::RemoveFolder { account, folder } => {
            ensure_configured(&config, &account)?;
            let store = open_store(&config)?;
            let key = FolderKey::new(account, folder);
            if store.remove_folder(&key)? {
                println!("Removed the local copy of {}", key);
            } else {
                println!("Nothing stored for {}", key);
            }
        }

        Commands::Sync { account, folder } => {
            let engine = build_engine(&config)?;
            let coordinator = SyncCoordinator::new(engine.clone());

            match (account, folder) {
                (Some(account), Some(folder)) => {
                    ensure_configured(&config, &account)?;
                    coordinator.trigger(FolderKey::new(account, folder), TriggerSource::Manual);
                }
                (Some(account), None) => {
                    ensure_configured(&config, &account)?;
                    coordinator.trigger_account(&account, TriggerSource::Manual);
                }
                (None, _) => coordinator.trigger_all(TriggerSource::Manual),
            }

            tokio::task::spawn_blocking(move || coordinator.wait_idle())
                .await
                .context("Sync worker failed")?;
            print_status(&config, engine.store())?;
        }

        Commands::Daemon => {
            if config.accounts.is_empty() {
                bail!("No accounts configured; add one with add-account");
            }
            let engine = build_engine(&config)?;
            run_daemon(&config, engine).await?;
        }

        Commands::Status => {
            let store = open_store(&config)?;
            print_status(&config, &store)?;
        }
    }

    Ok(())
}

async fn run_daemon(config: &Config, engine: Arc<SyncEngine>) -> Result<()> {
    let coordinator = SyncCoordinator::new(engine.clone());
    let listener = config.sync.use_idle.then(|| {
        PushListener::start(
            &engine,
            &coordinator,
            &config.sync.watch_folder,
            config.sync.idle_renewal(),
        )
    });

    log::info!(
        "Synchronizing {} accounts every {}s",
        config.accounts.len(),
        config.sync.interval_secs
    );
    coordinator.trigger_all(TriggerSource::Manual);

    let mut timer = tokio::time::interval(config.sync.interval());
    // The first tick completes immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => coordinator.trigger_all(TriggerSource::Timer),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    tokio::task::spawn_blocking(move || {
        drop(listener);
        coordinator.shutdown();
    })
    .await
    .context("Shutdown failed")?;
    Ok(())
}

fn open_store(config: &Config) -> Result<MailStore> {
    let path = config.database_path();
    MailStore::open(&path).with_context(|| format!("Failed to open database {}", path.display()))
}

fn build_engine(config: &Config) -> Result<Arc<SyncEngine>> {
    let store = open_store(config)?;
    let credentials = SecureCredentials::new()?;
    let connector = ImapConnector::new(config.sync.operation_timeout());

    let junk = config.spam.enabled.then(|| {
        JunkPolicy::new(Arc::new(SpamHeaderClassifier), config.spam.threshold)
    });
    let options = SyncOptions {
        batch_size: config.sync.batch_size,
        junk,
        auto_move_to_junk: config.spam.auto_move_to_junk,
        backoff: config.backoff.clone(),
        ..SyncOptions::default()
    };

    let engine = SyncEngine::new(
        Arc::new(store),
        Arc::new(connector),
        Arc::new(credentials),
        options,
    );
    for account in &config.accounts {
        engine
            .add_account(account.clone())
            .with_context(|| format!("Failed to register account {}", account.email))?;
    }
    Ok(Arc::new(engine))
}

fn ensure_configured(config: &Config, email: &str) -> Result<()> {
    if config.find_account(email).is_none() {
        bail!("No account {} in the config", email);
    }
    Ok(())
}

fn print_status(config: &Config, store: &MailStore) -> Result<()> {
    for account in &config.accounts {
        println!("{} <{}>", account.name, account.email);
        let folders = store.folders(&account.email)?;
        if folders.is_empty() {
            println!("  never synchronized");
        }
        for folder in folders {
            let total = store.message_count(&account.email, &folder.key.folder)?;
            let unread = store.unread_count(&account.email, &folder.key.folder)?;
            let last_sync = store
                .cursor(&folder.key)?
                .and_then(|c| c.last_sync)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  {:<30} {:>6} messages {:>5} unread  {:<8} last sync {}",
                folder.key.folder,
                total,
                unread,
                folder.role.as_str(),
                last_sync
            );
        }
    }
    Ok(())
}
