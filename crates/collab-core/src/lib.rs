//! collab-core: Runtime-independent engine for real-time document collaboration.
//!
//! This crate provides the core functionality for:
//! - A `Document` abstraction with note (text) and board (graph) implementations
//! - The JSON wire protocol spoken with the collaboration relay
//! - Echo suppression, presence tracking and reconnect policy
//! - Dual-cadence propagation (fast peer broadcast, slower durable save)
//! - A local backup ring that works regardless of network state
//!
//! Nothing here performs I/O on its own. State machines take the current time as
//! input and return what should happen next; a runtime crate drives them.

pub mod backup;
pub mod board;
pub mod clock;
pub mod connection;
pub mod debounce;
pub mod document;
pub mod echo;
pub mod events;
pub mod identity;
pub mod note;
pub mod outbox;
pub mod presence;
pub mod propagation;
pub mod protocol;
pub mod reconnect;
pub mod store;

pub use backup::{BackupError, BackupRecord, BackupStorage, BackupSummary, InMemoryStorage, LocalSafetyNet};
pub use board::{BoardDocument, BoardOp, Edge, EntityRef, Node, NodePatch};
pub use connection::{ConnectionAction, ConnectionMachine, ConnectionState};
pub use document::{Cadence, Document, DocumentId, DocumentKind};
pub use echo::EchoGuard;
pub use events::{EventBus, SessionEvent, Subscription};
pub use identity::{SessionIdentity, UserId};
pub use note::{NoteDocument, NoteOp};
pub use outbox::{OfferOutcome, OfflinePolicy, Outbox};
pub use presence::{Collaborator, PresenceSnapshot, PresenceTracker};
pub use propagation::{Propagation, SaveTicket};
pub use protocol::{Inbound, Notice, NoticeKind, Operation, PresenceEvent, ProtocolError, RosterEntry};
pub use reconnect::{ReconnectConfig, ReconnectState};
pub use store::{DocumentStore, InMemoryStore, StoreError};
