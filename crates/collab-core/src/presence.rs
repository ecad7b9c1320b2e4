//! Presence: who else is attached to the document right now.
//!
//! Presence is driven purely by relay control frames; there is no client-side
//! heartbeat. It is only meaningful while the socket is connected and is wiped
//! on every local disconnect.

use crate::identity::UserId;
use crate::protocol::PresenceEvent;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// A collaborator attached to the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collaborator {
    pub user_id: UserId,
    pub username: String,
    /// When we first saw this collaborator (ms since epoch).
    pub joined_at: u64,
}

/// Point-in-time view of presence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshot {
    pub members: Vec<Collaborator>,
    /// Relay-reported online count, falling back to the member count when the
    /// relay never reported one.
    pub online: usize,
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    members: BTreeMap<UserId, Collaborator>,
    online: Option<usize>,
    connected: bool,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the connection state. Going offline clears everything.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if !connected {
            self.clear();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Drop all members and the online count.
    pub fn clear(&mut self) {
        self.members.clear();
        self.online = None;
    }

    /// Record the online count carried by a `state` frame.
    pub fn set_online(&mut self, online: Option<usize>) -> bool {
        if !self.connected || online.is_none() || online == self.online {
            return false;
        }
        self.online = online;
        true
    }

    /// Apply a control frame. Returns `true` if presence changed.
    ///
    /// Frames arriving while disconnected are stale and ignored.
    pub fn apply(&mut self, event: &PresenceEvent, now_ms: u64) -> bool {
        if !self.connected {
            debug!("Ignoring presence frame while disconnected");
            return false;
        }

        match event {
            PresenceEvent::Joined {
                user_id,
                username,
                online,
            } => {
                let mut changed = self.update_online(*online);
                if let Some(user_id) = user_id {
                    let username = username.clone().unwrap_or_else(|| user_id.to_string());
                    changed |= self.insert(user_id.clone(), username, now_ms);
                }
                changed
            }
            PresenceEvent::Left { user_id, online } => {
                let mut changed = self.update_online(*online);
                if let Some(user_id) = user_id {
                    changed |= self.members.remove(user_id).is_some();
                }
                changed
            }
            PresenceEvent::Roster(entries) => {
                let previous = std::mem::take(&mut self.members);
                for entry in entries {
                    // Keep the original join time for members we already knew.
                    let joined_at = previous
                        .get(&entry.user_id)
                        .map(|c| c.joined_at)
                        .unwrap_or(now_ms);
                    self.members.insert(
                        entry.user_id.clone(),
                        Collaborator {
                            user_id: entry.user_id.clone(),
                            username: entry.username.clone(),
                            joined_at,
                        },
                    );
                }
                self.members != previous
            }
        }
    }

    fn update_online(&mut self, online: Option<usize>) -> bool {
        match online {
            Some(count) if self.online != Some(count) => {
                self.online = Some(count);
                true
            }
            _ => false,
        }
    }

    fn insert(&mut self, user_id: UserId, username: String, now_ms: u64) -> bool {
        match self.members.get_mut(&user_id) {
            Some(existing) if existing.username == username => false,
            Some(existing) => {
                existing.username = username;
                true
            }
            None => {
                self.members.insert(
                    user_id.clone(),
                    Collaborator {
                        user_id,
                        username,
                        joined_at: now_ms,
                    },
                );
                true
            }
        }
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            members: self.members.values().cloned().collect(),
            online: self.online.unwrap_or(self.members.len()),
        }
    }
}
