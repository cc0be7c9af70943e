use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one folder of one account. Accounts are keyed by email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderKey {
    pub account: String,
    pub folder: String,
}

impl FolderKey {
    pub fn new(account: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            folder: folder.into(),
        }
    }
}

impl fmt::Display for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account, self.folder)
    }
}

/// Message flag set, stored as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub seen: bool,
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub draft: bool,
    pub junk: bool,
}

impl MessageFlags {
    const SEEN: u32 = 1 << 0;
    const ANSWERED: u32 = 1 << 1;
    const FLAGGED: u32 = 1 << 2;
    const DELETED: u32 = 1 << 3;
    const DRAFT: u32 = 1 << 4;
    const JUNK: u32 = 1 << 5;

    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.seen {
            bits |= Self::SEEN;
        }
        if self.answered {
            bits |= Self::ANSWERED;
        }
        if self.flagged {
            bits |= Self::FLAGGED;
        }
        if self.deleted {
            bits |= Self::DELETED;
        }
        if self.draft {
            bits |= Self::DRAFT;
        }
        if self.junk {
            bits |= Self::JUNK;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            seen: bits & Self::SEEN != 0,
            answered: bits & Self::ANSWERED != 0,
            flagged: bits & Self::FLAGGED != 0,
            deleted: bits & Self::DELETED != 0,
            draft: bits & Self::DRAFT != 0,
            junk: bits & Self::JUNK != 0,
        }
    }

    /// Builds the flag set from IMAP flag names (`\Seen`, `$Junk`, ...).
    /// Unknown keywords are ignored; `$NotJunk` wins over `$Junk`.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut flags = Self::default();
        let mut not_junk = false;
        for name in names {
            match name.to_ascii_lowercase().as_str() {
                "\\seen" => flags.seen = true,
                "\\answered" => flags.answered = true,
                "\\flagged" => flags.flagged = true,
                "\\deleted" => flags.deleted = true,
                "\\draft" => flags.draft = true,
                "$junk" | "junk" => flags.junk = true,
                "$notjunk" | "notjunk" => not_junk = true,
                _ => {}
            }
        }
        if not_junk {
            flags.junk = false;
        }
        flags
    }

    pub fn is_unread(&self) -> bool {
        !self.seen
    }
}

/// Semantic folder type, from SPECIAL-USE attributes or well-known names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FolderRole {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
    Other,
}

impl FolderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderRole::Inbox => "inbox",
            FolderRole::Sent => "sent",
            FolderRole::Drafts => "drafts",
            FolderRole::Trash => "trash",
            FolderRole::Junk => "junk",
            FolderRole::Archive => "archive",
            FolderRole::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "inbox" => FolderRole::Inbox,
            "sent" => FolderRole::Sent,
            "drafts" => FolderRole::Drafts,
            "trash" => FolderRole::Trash,
            "junk" => FolderRole::Junk,
            "archive" => FolderRole::Archive,
            _ => FolderRole::Other,
        }
    }

    pub fn detect(name: &str, attributes: &[String]) -> Self {
        for attribute in attributes {
            let role = match attribute.to_ascii_lowercase().as_str() {
                "\\sent" => FolderRole::Sent,
                "\\drafts" => FolderRole::Drafts,
                "\\trash" => FolderRole::Trash,
                "\\junk" => FolderRole::Junk,
                "\\archive" | "\\all" => FolderRole::Archive,
                _ => continue,
            };
            return role;
        }

        match name.to_lowercase().as_str() {
            "inbox" => FolderRole::Inbox,
            "sent" | "sent mail" | "sent items" | "[gmail]/sent mail" => FolderRole::Sent,
            "drafts" | "draft" | "[gmail]/drafts" => FolderRole::Drafts,
            "trash" | "deleted" | "deleted items" | "[gmail]/trash" => FolderRole::Trash,
            "junk" | "spam" | "junk mail" | "[gmail]/spam" => FolderRole::Junk,
            "archive" | "all mail" | "[gmail]/all mail" => FolderRole::Archive,
            _ => FolderRole::Other,
        }
    }

    /// Folders whose new mail is never run through the junk classifier.
    pub fn skips_classification(&self) -> bool {
        matches!(self, FolderRole::Junk | FolderRole::Trash)
    }
}

/// A mailbox as reported by the server's folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub name: String,
    pub delimiter: Option<String>,
    pub role: FolderRole,
    pub selectable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub key: FolderKey,
    pub role: FolderRole,
    pub delimiter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub subject: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
}

/// A message discovered by a pass, ready to be written by the commit.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub uid: u32,
    pub flags: MessageFlags,
    pub envelope: Envelope,
    pub size: usize,
    pub body: Option<Vec<u8>>,
    /// Folder the message is shown in. Differs from the owning folder when
    /// the junk policy placed it elsewhere.
    pub location: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub key: FolderKey,
    pub uid: u32,
    pub location: String,
    pub flags: MessageFlags,
    pub envelope: Envelope,
    pub size: usize,
    pub body_fetched: bool,
}

/// Per-folder synchronization cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub epoch: Option<u32>,
    pub high_water: u32,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    /// Consecutive passes that observed a different epoch than the one stored.
    pub epoch_changes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    MoveToJunk,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::MoveToJunk => "move_to_junk",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "move_to_junk" => Some(ActionKind::MoveToJunk),
            _ => None,
        }
    }
}

/// A remote action queued by a pass and executed after its commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub id: Option<i64>,
    pub account: String,
    pub kind: ActionKind,
    pub folder: String,
    pub uid: u32,
    pub target_folder: String,
}
