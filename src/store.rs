use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use thiserror::Error;

use crate::error::SyncError;
use crate::model::{
    ActionKind, Envelope, FolderKey, FolderRecord, FolderRole, MessageFlags, NewMessage,
    PendingAction, RemoteFolder, StoredMessage, SyncCursor,
};

const SCHEMA_VERSION: i32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database schema version {0} is newer than this build supports")]
    UnsupportedSchema(i32),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything one synchronization pass changes in a folder. Applied as a single
/// transaction by [`MailStore::apply_delta`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderDelta {
    /// Discard every stored message of the folder before applying the rest.
    pub reset: bool,
    pub new_messages: Vec<NewMessage>,
    pub flag_updates: Vec<(u32, MessageFlags)>,
    pub removed: Vec<u32>,
    pub actions: Vec<PendingAction>,
    pub cursor: SyncCursor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRow {
    pub email: String,
    pub name: String,
}

/// Local replica of remote mailboxes, backed by SQLite.
pub struct MailStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl MailStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema(version));
        }
        if version < SCHEMA_VERSION {
            Self::create_schema(&conn)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn create_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                email TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS folders (
                account_email TEXT NOT NULL,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                delimiter TEXT,
                PRIMARY KEY(account_email, name),
                FOREIGN KEY(account_email) REFERENCES accounts(email) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS sync_cursors (
                account_email TEXT NOT NULL,
                folder TEXT NOT NULL,
                epoch INTEGER,
                high_water INTEGER NOT NULL DEFAULT 0,
                last_full_sync INTEGER,          -- Unix timestamp
                last_sync INTEGER,               -- Unix timestamp
                epoch_changes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY(account_email, folder),
                FOREIGN KEY(account_email, folder) REFERENCES folders(account_email, name) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS messages (
                account_email TEXT NOT NULL,
                folder TEXT NOT NULL,
                uid INTEGER NOT NULL,
                location TEXT NOT NULL,
                flags INTEGER NOT NULL DEFAULT 0, -- MessageFlags bitmask
                subject TEXT NOT NULL,
                from_addresses TEXT NOT NULL,    -- JSON array
                to_addresses TEXT NOT NULL,      -- JSON array
                message_id TEXT,
                date_sent INTEGER,               -- Unix timestamp
                size INTEGER NOT NULL DEFAULT 0,
                body BLOB,
                body_fetched BOOLEAN NOT NULL DEFAULT 0,
                PRIMARY KEY(account_email, folder, uid),
                FOREIGN KEY(account_email, folder) REFERENCES folders(account_email, name) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_location
                ON messages(account_email, location);

            CREATE TABLE IF NOT EXISTS pending_actions (
                id INTEGER PRIMARY KEY,
                account_email TEXT NOT NULL,
                action TEXT NOT NULL,
                folder TEXT NOT NULL,
                uid INTEGER NOT NULL,
                target_folder TEXT NOT NULL,
                processed BOOLEAN NOT NULL DEFAULT 0,
                error TEXT,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                FOREIGN KEY(account_email) REFERENCES accounts(email) ON DELETE CASCADE
            );",
        )?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert_account(&self, email: &str, name: &str) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO accounts (email, name) VALUES (?1, ?2)
             ON CONFLICT(email) DO UPDATE SET name = excluded.name",
            params![email, name],
        )?;
        Ok(())
    }

    /// Removes the account together with its folders, messages and queued actions.
    pub fn remove_account(&self, email: &str) -> StoreResult<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM accounts WHERE email = ?1", params![email])?;
        Ok(removed > 0)
    }

    pub fn list_accounts(&self) -> StoreResult<Vec<AccountRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT email, name FROM accounts ORDER BY email")?;
        let rows = stmt.query_map([], |row| {
            Ok(AccountRow {
                email: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Records the server's folder list. Local folders the server no longer
    /// reports are dropped with everything stored under them.
    pub fn upsert_folders(&self, account: &str, folders: &[RemoteFolder]) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        ensure_account(&tx, account)?;

        let selectable: Vec<&RemoteFolder> = folders.iter().filter(|f| f.selectable).collect();
        for folder in &selectable {
            tx.execute(
                "INSERT INTO folders (account_email, name, role, delimiter) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_email, name)
                 DO UPDATE SET role = excluded.role, delimiter = excluded.delimiter",
                params![account, folder.name, folder.role.as_str(), folder.delimiter],
            )?;
        }

        let known: Vec<String> = {
            let mut stmt = tx.prepare("SELECT name FROM folders WHERE account_email = ?1")?;
            let rows = stmt.query_map(params![account], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for name in known {
            if !selectable.iter().any(|f| f.name == name) {
                log::info!("Folder {} disappeared from {}, dropping it", name, account);
                tx.execute(
                    "DELETE FROM folders WHERE account_email = ?1 AND name = ?2",
                    params![account, name],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Drops the folder with its messages, cursor and queued actions.
    pub fn remove_folder(&self, key: &FolderKey) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM pending_actions WHERE account_email = ?1 AND folder = ?2",
            params![key.account, key.folder],
        )?;
        let removed = tx.execute(
            "DELETE FROM folders WHERE account_email = ?1 AND name = ?2",
            params![key.account, key.folder],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn folders(&self, account: &str) -> StoreResult<Vec<FolderRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, role, delimiter FROM folders WHERE account_email = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![account], |row| {
            Ok(FolderRecord {
                key: FolderKey::new(account, row.get::<_, String>(0)?),
                role: FolderRole::parse(&row.get::<_, String>(1)?),
                delimiter: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn folder_role(&self, key: &FolderKey) -> StoreResult<Option<FolderRole>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT role FROM folders WHERE account_email = ?1 AND name = ?2",
                params![key.account, key.folder],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|role| FolderRole::parse(&role)))
    }

    pub fn folder_by_role(&self, account: &str, role: FolderRole) -> StoreResult<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT name FROM folders WHERE account_email = ?1 AND role = ?2
                 ORDER BY name LIMIT 1",
                params![account, role.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn cursor(&self, key: &FolderKey) -> StoreResult<Option<SyncCursor>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT epoch, high_water, last_full_sync, last_sync, epoch_changes
                 FROM sync_cursors WHERE account_email = ?1 AND folder = ?2",
                params![key.account, key.folder],
                |row| {
                    Ok(SyncCursor {
                        epoch: row.get(0)?,
                        high_water: row.get(1)?,
                        last_full_sync: timestamp(row.get(2)?),
                        last_sync: timestamp(row.get(3)?),
                        epoch_changes: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Stored UIDs of the folder within `lo..=hi`.
    pub fn uids_in_range(&self, key: &FolderKey, lo: u32, hi: u32) -> StoreResult<BTreeSet<u32>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT uid FROM messages
             WHERE account_email = ?1 AND folder = ?2 AND uid BETWEEN ?3 AND ?4",
        )?;
        let rows = stmt.query_map(params![key.account, key.folder, lo, hi], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn flags_of(&self, key: &FolderKey, uid: u32) -> StoreResult<Option<MessageFlags>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT flags FROM messages WHERE account_email = ?1 AND folder = ?2 AND uid = ?3",
                params![key.account, key.folder, uid],
                |row| row.get::<_, u32>(0),
            )
            .optional()?
            .map(MessageFlags::from_bits))
    }

    /// Flags of every stored message of the folder, keyed by UID.
    pub fn flags_in_folder(
        &self,
        key: &FolderKey,
    ) -> StoreResult<std::collections::HashMap<u32, MessageFlags>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT uid, flags FROM messages WHERE account_email = ?1 AND folder = ?2",
        )?;
        let rows = stmt.query_map(params![key.account, key.folder], |row| {
            Ok((row.get::<_, u32>(0)?, MessageFlags::from_bits(row.get(1)?)))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Applies one pass's changes atomically. On any failure nothing is visible.
    pub fn apply_delta(&self, key: &FolderKey, delta: &FolderDelta) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        ensure_account(&tx, &key.account)?;
        tx.execute(
            "INSERT OR IGNORE INTO folders (account_email, name, role) VALUES (?1, ?2, ?3)",
            params![key.account, key.folder, FolderRole::detect(&key.folder, &[]).as_str()],
        )?;

        if delta.reset {
            let dropped = tx.execute(
                "DELETE FROM messages WHERE account_email = ?1 AND folder = ?2",
                params![key.account, key.folder],
            )?;
            tx.execute(
                "DELETE FROM pending_actions
                 WHERE account_email = ?1 AND folder = ?2 AND processed = 0",
                params![key.account, key.folder],
            )?;
            log::debug!("{}: discarded {} messages from the previous epoch", key, dropped);
        }

        {
            let mut insert = tx.prepare(
                "INSERT INTO messages (
                    account_email, folder, uid, location, flags, subject,
                    from_addresses, to_addresses, message_id, date_sent, size, body, body_fetched
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for message in &delta.new_messages {
                insert.execute(params![
                    key.account,
                    key.folder,
                    message.uid,
                    message.location,
                    message.flags.to_bits(),
                    message.envelope.subject,
                    serde_json::to_string(&message.envelope.from)?,
                    serde_json::to_string(&message.envelope.to)?,
                    message.envelope.message_id,
                    message.envelope.date.map(|d| d.timestamp()),
                    message.size as i64,
                    message.body,
                    message.body.is_some(),
                ])?;
            }

            let mut update = tx.prepare(
                "UPDATE messages SET flags = ?4
                 WHERE account_email = ?1 AND folder = ?2 AND uid = ?3",
            )?;
            for (uid, flags) in &delta.flag_updates {
                update.execute(params![key.account, key.folder, uid, flags.to_bits()])?;
            }

            let mut delete = tx.prepare(
                "DELETE FROM messages WHERE account_email = ?1 AND folder = ?2 AND uid = ?3",
            )?;
            for uid in &delta.removed {
                delete.execute(params![key.account, key.folder, uid])?;
            }

            let mut queue = tx.prepare(
                "INSERT INTO pending_actions (account_email, action, folder, uid, target_folder)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for action in &delta.actions {
                queue.execute(params![
                    action.account,
                    action.kind.as_str(),
                    action.folder,
                    action.uid,
                    action.target_folder,
                ])?;
            }
        }

        let cursor = &delta.cursor;
        tx.execute(
            "INSERT INTO sync_cursors
                (account_email, folder, epoch, high_water, last_full_sync, last_sync, epoch_changes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account_email, folder) DO UPDATE SET
                epoch = excluded.epoch,
                high_water = excluded.high_water,
                last_full_sync = excluded.last_full_sync,
                last_sync = excluded.last_sync,
                epoch_changes = excluded.epoch_changes",
            params![
                key.account,
                key.folder,
                cursor.epoch,
                cursor.high_water,
                cursor.last_full_sync.map(|t| t.timestamp()),
                cursor.last_sync.map(|t| t.timestamp()),
                cursor.epoch_changes,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Local-only flag write; the next authoritative read supersedes it.
    pub fn set_flags(&self, key: &FolderKey, uid: u32, flags: MessageFlags) -> StoreResult<bool> {
        let updated = self.conn().execute(
            "UPDATE messages SET flags = ?4 WHERE account_email = ?1 AND folder = ?2 AND uid = ?3",
            params![key.account, key.folder, uid, flags.to_bits()],
        )?;
        Ok(updated > 0)
    }

    pub fn set_starred(&self, key: &FolderKey, uid: u32, starred: bool) -> StoreResult<bool> {
        self.update_flags(key, uid, |flags| flags.flagged = starred)
    }

    pub fn set_junk_flag(&self, key: &FolderKey, uid: u32, junk: bool) -> StoreResult<bool> {
        self.update_flags(key, uid, |flags| flags.junk = junk)
    }

    fn update_flags(
        &self,
        key: &FolderKey,
        uid: u32,
        change: impl FnOnce(&mut MessageFlags),
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current: Option<u32> = tx
            .query_row(
                "SELECT flags FROM messages WHERE account_email = ?1 AND folder = ?2 AND uid = ?3",
                params![key.account, key.folder, uid],
                |row| row.get(0),
            )
            .optional()?;
        let Some(bits) = current else {
            return Ok(false);
        };

        let mut flags = MessageFlags::from_bits(bits);
        change(&mut flags);
        tx.execute(
            "UPDATE messages SET flags = ?4 WHERE account_email = ?1 AND folder = ?2 AND uid = ?3",
            params![key.account, key.folder, uid, flags.to_bits()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Messages owned by the folder, newest first.
    pub fn messages(&self, key: &FolderKey) -> StoreResult<Vec<StoredMessage>> {
        self.query_messages(
            "WHERE account_email = ?1 AND folder = ?2",
            &key.account,
            &key.folder,
        )
    }

    /// Messages shown in `location`, wherever the server keeps them.
    pub fn messages_in_location(
        &self,
        account: &str,
        location: &str,
    ) -> StoreResult<Vec<StoredMessage>> {
        self.query_messages("WHERE account_email = ?1 AND location = ?2", account, location)
    }

    fn query_messages(
        &self,
        filter: &str,
        account: &str,
        value: &str,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT account_email, folder, uid, location, flags, subject, from_addresses,
                    to_addresses, message_id, date_sent, size, body_fetched
             FROM messages {}
             ORDER BY date_sent DESC, uid DESC",
            filter
        ))?;
        let rows = stmt.query_map(params![account, value], read_message_row)?;

        let mut messages = Vec::new();
        for row in rows {
            let (mut message, from_json, to_json) = row?;
            message.envelope.from = serde_json::from_str(&from_json)?;
            message.envelope.to = serde_json::from_str(&to_json)?;
            messages.push(message);
        }
        Ok(messages)
    }

    pub fn body(&self, key: &FolderKey, uid: u32) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT body FROM messages WHERE account_email = ?1 AND folder = ?2 AND uid = ?3",
                params![key.account, key.folder, uid],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?
            .flatten())
    }

    pub fn unread_count(&self, account: &str, location: &str) -> StoreResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE account_email = ?1 AND location = ?2 AND (flags & 1) = 0",
            params![account, location],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn message_count(&self, account: &str, location: &str) -> StoreResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE account_email = ?1 AND location = ?2",
            params![account, location],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn pending_actions(&self, account: &str) -> StoreResult<Vec<PendingAction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, folder, uid, target_folder FROM pending_actions
             WHERE account_email = ?1 AND processed = 0 AND error IS NULL
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![account], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut actions = Vec::new();
        for row in rows {
            let (id, action, folder, uid, target_folder) = row?;
            let Some(kind) = ActionKind::parse(&action) else {
                log::warn!("Skipping unknown queued action {:?} (id {})", action, id);
                continue;
            };
            actions.push(PendingAction {
                id: Some(id),
                account: account.to_string(),
                kind,
                folder,
                uid,
                target_folder,
            });
        }
        Ok(actions)
    }

    pub fn mark_action_done(&self, id: i64) -> StoreResult<()> {
        self.conn().execute(
            "UPDATE pending_actions SET processed = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn mark_action_failed(&self, id: i64, error: &str) -> StoreResult<()> {
        self.conn().execute(
            "UPDATE pending_actions SET error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }
}

fn ensure_account(tx: &Transaction<'_>, email: &str) -> StoreResult<()> {
    tx.execute(
        "INSERT OR IGNORE INTO accounts (email, name) VALUES (?1, ?1)",
        params![email],
    )?;
    Ok(())
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
}

fn read_message_row(row: &Row<'_>) -> rusqlite::Result<(StoredMessage, String, String)> {
    let message = StoredMessage {
        key: FolderKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        uid: row.get(2)?,
        location: row.get(3)?,
        flags: MessageFlags::from_bits(row.get(4)?),
        envelope: Envelope {
            subject: row.get(5)?,
            from: Vec::new(),
            to: Vec::new(),
            message_id: row.get(8)?,
            date: timestamp(row.get(9)?),
        },
        size: row.get::<_, i64>(10)? as usize,
        body_fetched: row.get(11)?,
    };
    Ok((message, row.get(6)?, row.get(7)?))
}
