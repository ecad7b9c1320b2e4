//! Typed shapes of relay frames after decoding.

use crate::document::Document;
use crate::identity::{SessionIdentity, UserId};
use serde::{Deserialize, Serialize};

/// An origin-stamped document operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation<Op> {
    /// Session that produced the operation. Relays that don't forward the
    /// field yield `None`, which is treated as a peer origin.
    pub origin: Option<UserId>,
    /// Display name of the producing session, if the relay forwarded it.
    pub username: Option<String>,
    pub op: Op,
}

impl<Op> Operation<Op> {
    /// Stamp an operation produced by the local session.
    pub fn local(identity: &SessionIdentity, op: Op) -> Self {
        Self {
            origin: Some(identity.user_id.clone()),
            username: Some(identity.username.clone()),
            op,
        }
    }

    /// Build an operation as received from the relay.
    pub fn remote(origin: Option<UserId>, username: Option<String>, op: Op) -> Self {
        Self {
            origin,
            username,
            op,
        }
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound<D: Document> {
    /// Authoritative full document pushed by the relay (`type: "state"`).
    /// Always applied as a full replace.
    State {
        document: D,
        online: Option<usize>,
    },
    /// A peer mutation.
    Operation(Operation<D::Op>),
    /// Join/leave/roster control frame.
    Presence(PresenceEvent),
    /// Informational notice that never touches the document.
    Notice(Notice),
    /// Frame type this client doesn't understand; ignored.
    Unknown(String),
}

/// Presence control frames.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// `user_joined`. Canvas relays may only report the new `online` count.
    Joined {
        user_id: Option<UserId>,
        username: Option<String>,
        online: Option<usize>,
    },
    /// `user_left`.
    Left {
        user_id: Option<UserId>,
        online: Option<usize>,
    },
    /// `users_online`: the complete roster, replacing what we knew.
    Roster(Vec<RosterEntry>),
}

/// One entry of a `users_online` roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    VersionCreated,
    VersionRestored,
}

/// A version-history notice from another collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub username: Option<String>,
    pub version_number: Option<u64>,
}
