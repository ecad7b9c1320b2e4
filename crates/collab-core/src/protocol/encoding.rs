//! Frame encoding and the control frames shared by every document kind.

use crate::document::Document;
use crate::identity::UserId;
use crate::protocol::envelope::{Inbound, Notice, NoticeKind, Operation, PresenceEvent, RosterEntry};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame has no type discriminator")]
    MissingType,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Parse a text frame into a JSON object.
pub fn parse_frame(text: &str) -> Result<Value> {
    let frame: Value = serde_json::from_str(text)?;
    if !frame.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    Ok(frame)
}

/// Read the `type` discriminator of a frame.
pub fn frame_type(frame: &Value) -> Result<&str> {
    frame
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)
}

/// Decode a text frame for document type `D`.
pub fn decode<D: Document>(text: &str) -> Result<Inbound<D>> {
    D::decode_frame(parse_frame(text)?)
}

/// Encode an operation into a text frame for document type `D`.
pub fn encode<D: Document>(op: &Operation<D::Op>) -> Result<String> {
    Ok(serde_json::to_string(&D::encode_operation(op)?)?)
}

/// `user_id` / `username` fields carried next to an operation payload.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct OriginFields {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub username: Option<String>,
}

impl OriginFields {
    pub(crate) fn from_frame(frame: &Value) -> Result<Self> {
        Ok(Self::deserialize(frame)?)
    }

    pub(crate) fn into_operation<Op>(self, op: Op) -> Operation<Op> {
        Operation::remote(self.user_id, self.username, op)
    }
}

/// Start an outbound frame object with `type` and the operation's origin fields.
pub(crate) fn frame_with_origin<Op>(kind: &str, op: &Operation<Op>) -> Result<Map<String, Value>> {
    let mut frame = Map::new();
    frame.insert("type".into(), Value::String(kind.into()));
    if let Some(origin) = &op.origin {
        frame.insert("user_id".into(), serde_json::to_value(origin)?);
    }
    if let Some(username) = &op.username {
        frame.insert("username".into(), Value::String(username.clone()));
    }
    Ok(frame)
}

#[derive(Deserialize)]
struct MemberFrame {
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    online: Option<usize>,
}

#[derive(Deserialize)]
struct RosterFrame {
    #[serde(default)]
    users: Vec<RosterEntry>,
}

#[derive(Deserialize)]
struct NoticeFrame {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    version_number: Option<u64>,
}

/// Decode the control frames every document kind understands.
///
/// Anything not recognised here becomes [`Inbound::Unknown`].
pub(crate) fn decode_control<D: Document>(kind: &str, frame: &Value) -> Result<Inbound<D>> {
    let inbound = match kind {
        "user_joined" => {
            let member = MemberFrame::deserialize(frame)?;
            Inbound::Presence(PresenceEvent::Joined {
                user_id: member.user_id,
                username: member.username,
                online: member.online,
            })
        }
        "user_left" => {
            let member = MemberFrame::deserialize(frame)?;
            Inbound::Presence(PresenceEvent::Left {
                user_id: member.user_id,
                online: member.online,
            })
        }
        "users_online" => {
            let roster = RosterFrame::deserialize(frame)?;
            Inbound::Presence(PresenceEvent::Roster(roster.users))
        }
        "version_created" | "version_restored" => {
            let notice = NoticeFrame::deserialize(frame)?;
            let kind = if kind == "version_created" {
                NoticeKind::VersionCreated
            } else {
                NoticeKind::VersionRestored
            };
            Inbound::Notice(Notice {
                kind,
                username: notice.username,
                version_number: notice.version_number,
            })
        }
        other => Inbound::Unknown(other.to_string()),
    };
    Ok(inbound)
}
