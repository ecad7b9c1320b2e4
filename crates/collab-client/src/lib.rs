//! collab-client: tokio runtime for collaborative note and board sessions.
//!
//! Drives the state machines from `collab-core` against real I/O: a WebSocket
//! relay for peer operations, a REST store for durable saves and a directory
//! of JSON files for local backups.

pub mod config;
pub mod file_storage;
pub mod http_store;
pub mod session;
pub mod transport;

// Re-export key types for convenience
pub use config::{ClientConfig, ConfigError, SessionConfig};
pub use file_storage::FileBackupStorage;
pub use http_store::{HttpDocumentStore, HttpStoreError};
pub use session::{SessionError, SessionHandle, SessionStatus};
pub use transport::{TransportError, TransportEvent, WsWriter, MAX_FRAME_SIZE};
