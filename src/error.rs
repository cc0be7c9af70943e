use std::fmt;

use thiserror::Error;

/// Everything that can go wrong while synchronizing a folder.
///
/// Variants carry rendered messages rather than source errors so results can
/// be cloned and forwarded to observers on other threads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    TransientConnect(String),

    #[error("Network I/O failed: {0}")]
    TransientIo(String),

    #[error("Session invalidated: {0}")]
    SessionInvalidated(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    #[error("Account degraded after {0} consecutive connection failures")]
    Degraded(u32),

    #[error("Not supported by the server: {0}")]
    Unsupported(String),

    #[error("Synchronization cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    TransientConnect,
    TransientIo,
    SessionInvalidated,
    Store,
    ProtocolAnomaly,
    Degraded,
    Unsupported,
    Cancelled,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::TransientConnect => "transient-connect",
            ErrorKind::TransientIo => "transient-io",
            ErrorKind::SessionInvalidated => "session-invalidated",
            ErrorKind::Store => "store",
            ErrorKind::ProtocolAnomaly => "protocol-anomaly",
            ErrorKind::Degraded => "degraded",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::TransientConnect(_) => ErrorKind::TransientConnect,
            SyncError::TransientIo(_) => ErrorKind::TransientIo,
            SyncError::SessionInvalidated(_) => ErrorKind::SessionInvalidated,
            SyncError::Store(_) => ErrorKind::Store,
            SyncError::ProtocolAnomaly(_) => ErrorKind::ProtocolAnomaly,
            SyncError::Degraded(_) => ErrorKind::Degraded,
            SyncError::Unsupported(_) => ErrorKind::Unsupported,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Config(_) => ErrorKind::Config,
        }
    }

    /// Auth failures, degraded accounts, missing server features and bad
    /// configuration need the user; everything else clears up on a later pass.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::Auth(_)
                | SyncError::Degraded(_)
                | SyncError::Unsupported(_)
                | SyncError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_degraded_are_fatal() {
        assert!(!SyncError::Auth("bad password".into()).is_retryable());
        assert!(!SyncError::Degraded(5).is_retryable());
        assert!(!SyncError::Config("no such account".into()).is_retryable());
        assert!(!SyncError::Unsupported("IDLE".into()).is_retryable());
        assert!(SyncError::TransientIo("timeout".into()).is_retryable());
        assert!(SyncError::SessionInvalidated("bye".into()).is_retryable());
        assert!(SyncError::Store("locked".into()).is_retryable());
    }

    #[test]
    fn kind_renders_kebab_case() {
        assert_eq!(SyncError::Cancelled.kind().to_string(), "cancelled");
        assert_eq!(
            SyncError::SessionInvalidated(String::new()).kind().to_string(),
            "session-invalidated"
        );
    }
}
