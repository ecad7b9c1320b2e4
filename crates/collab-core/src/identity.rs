//! Session identity: who is editing a document.
//!
//! The identity is handed to a session explicitly when a document is opened and
//! stamped onto every outgoing operation as its origin.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};

/// Identifier of a user as carried in `user_id` fields on the wire.
///
/// Relays disagree on the JSON type of this field: the note relay sends
/// integers, the canvas relay sends strings. Both are normalized to the same
/// textual form, so `42` and `"42"` compare equal.
///
/// # Examples
/// ```
/// use collab_core::UserId;
///
/// let from_number: UserId = serde_json::from_str("42").unwrap();
/// let from_string: UserId = serde_json::from_str("\"42\"").unwrap();
/// assert_eq!(from_number, from_string);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, if this id is the canonical text of an integer.
    ///
    /// Ids like `"007"` stay textual: sending them as `7` would come back as
    /// a different id.
    fn as_number(&self) -> Option<u64> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let n: u64 = self.0.parse().ok()?;
        (n.to_string() == self.0).then_some(n)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

// Integer-looking ids go back out as integers so relays that compare them
// against numeric query parameters still recognise the sender.
impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self.as_number() {
            Some(n) => s.serialize_u64(n),
            None => s.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct UserIdVisitor;

        impl Visitor<'_> for UserIdVisitor {
            type Value = UserId;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a user id as string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<UserId, E> {
                Ok(UserId::from(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<UserId, E> {
                Ok(UserId(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<UserId, E> {
                Ok(UserId::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<UserId, E> {
                Ok(UserId(v.to_string()))
            }
        }

        d.deserialize_any(UserIdVisitor)
    }
}

/// The local editing session: stable for as long as one document view is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub username: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}
