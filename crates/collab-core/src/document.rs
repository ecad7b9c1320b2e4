//! Document: the unit of collaboration.
//!
//! A document is owned by exactly one local session while it is open. Sessions
//! never share memory; they converge by exchanging [`Operation`]s over the relay
//! and by last-write-wins full saves to the backend store.

use crate::protocol::{Inbound, Operation, ProtocolError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};
use std::time::Duration;

/// Stable identifier of a document (note id or board id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for DocumentId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Debounce windows for the two propagation pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// Idle time before coalesced operations are broadcast to peers.
    /// Operations that don't coalesce are always sent immediately.
    pub broadcast: Duration,
    /// Idle time before the full document is persisted.
    pub save: Duration,
}

/// Which family of document is being synchronized.
///
/// Determines relay and REST endpoint layout and the default cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// A note: `{title, content}` text.
    Note,
    /// A canvas board: `{nodes, edges}` graph.
    Board,
}

impl DocumentKind {
    /// Relay path for a document socket, relative to the socket base URL.
    pub fn socket_path(self, id: &DocumentId) -> String {
        match self {
            DocumentKind::Note => format!("/ws/notes/{}", id),
            DocumentKind::Board => format!("/ws/canvas/{}", id),
        }
    }

    /// REST path of the full document state, relative to the API base URL.
    pub fn rest_path(self, id: &DocumentId) -> String {
        match self {
            DocumentKind::Note => format!("/notes/{}", id),
            DocumentKind::Board => format!("/canvas/boards/{}/state", id),
        }
    }

    /// Default cadence: text waits 500ms before broadcasting and 2s before saving;
    /// graph operations broadcast immediately and the whole board saves after 800ms.
    pub fn cadence(self) -> Cadence {
        match self {
            DocumentKind::Note => Cadence {
                broadcast: Duration::from_millis(500),
                save: Duration::from_millis(2000),
            },
            DocumentKind::Board => Cadence {
                broadcast: Duration::ZERO,
                save: Duration::from_millis(800),
            },
        }
    }
}

/// A collaboratively edited document.
///
/// Implementations define their operation vocabulary, how each operation is
/// applied (last write wins, no merge), and how operations map onto relay frames.
pub trait Document:
    Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Atomic, self-contained change broadcast to peers.
    type Op: Clone + Debug + PartialEq + Send + Sync + 'static;

    const KIND: DocumentKind;

    /// Apply an operation. Returns `true` if the document changed.
    fn apply(&mut self, op: &Self::Op) -> bool;

    /// Whether rapid successive values of this operation collapse into one
    /// broadcast (only the latest is sent after the broadcast window).
    fn coalesces(_op: &Self::Op) -> bool {
        false
    }

    /// Serialize an operation into an outbound relay frame.
    fn encode_operation(op: &Operation<Self::Op>) -> Result<serde_json::Value, ProtocolError>;

    /// Classify an inbound relay frame.
    fn decode_frame(frame: serde_json::Value) -> Result<Inbound<Self>, ProtocolError>;

    /// Short human-readable summary used by backup listings.
    fn preview(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
