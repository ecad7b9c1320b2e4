//! Wire protocol spoken with the collaboration relay.
//!
//! Frames are JSON objects sent as WebSocket text messages:
//! - A `type` discriminator selects the frame kind
//! - Document operations carry their origin in `user_id` / `username`
//! - Control frames (`state`, `user_joined`, `user_left`, `users_online`,
//!   version notices) are shared between document kinds
//!
//! Unknown frame types decode to [`Inbound::Unknown`] rather than an error so
//! newer relays can add vocabulary without breaking older clients.

pub mod encoding;
pub mod envelope;

pub use encoding::{decode, encode, frame_type, parse_frame, ProtocolError};
pub use envelope::{Inbound, Notice, NoticeKind, Operation, PresenceEvent, RosterEntry};
