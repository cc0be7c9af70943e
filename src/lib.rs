pub mod backoff;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod events;
pub mod imap_client;
pub mod message;
pub mod model;
pub mod push;
pub mod session;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{Config, EmailAccount};
pub use coordinator::{SyncCoordinator, TriggerOutcome, TriggerSource};
pub use engine::SyncEngine;
pub use error::{ErrorKind, SyncError};
pub use model::{FolderKey, MessageFlags};
pub use store::MailStore;
pub use sync::{PassReport, PassResult, SyncOptions};
