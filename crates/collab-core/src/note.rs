//! Note documents: a title plus markdown content.
//!
//! Only `content` travels over the relay. Title edits are local mutations that
//! reach other sessions through durable saves.
//!
//! Wire format:
//! - `{"type":"content_change","content":"...","user_id":1,"username":"ana"}`
//! - `{"type":"cursor_position","position":42,"user_id":1,"username":"ana"}`

use crate::document::{Document, DocumentKind};
use crate::protocol::encoding::{decode_control, frame_type, frame_with_origin, OriginFields};
use crate::protocol::{Inbound, Operation, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum preview length in backup listings.
const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

impl NoteDocument {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteOp {
    /// Replace the whole content.
    ContentChange { content: String },
    /// Caret position of the producing session. Never changes the document.
    CursorPosition { position: usize },
}

#[derive(Deserialize)]
struct ContentFrame {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct CursorFrame {
    position: usize,
}

impl Document for NoteDocument {
    type Op = NoteOp;

    const KIND: DocumentKind = DocumentKind::Note;

    fn apply(&mut self, op: &NoteOp) -> bool {
        match op {
            NoteOp::ContentChange { content } => {
                if self.content == *content {
                    return false;
                }
                self.content.clone_from(content);
                true
            }
            NoteOp::CursorPosition { .. } => false,
        }
    }

    fn coalesces(op: &NoteOp) -> bool {
        matches!(op, NoteOp::ContentChange { .. })
    }

    fn encode_operation(op: &Operation<NoteOp>) -> Result<Value, ProtocolError> {
        let frame = match &op.op {
            NoteOp::ContentChange { content } => {
                let mut frame = frame_with_origin("content_change", op)?;
                frame.insert("content".into(), Value::String(content.clone()));
                frame
            }
            NoteOp::CursorPosition { position } => {
                let mut frame = frame_with_origin("cursor_position", op)?;
                frame.insert("position".into(), Value::from(*position));
                frame
            }
        };
        Ok(Value::Object(frame))
    }

    fn decode_frame(frame: Value) -> Result<Inbound<Self>, ProtocolError> {
        let kind = frame_type(&frame)?;
        match kind {
            "content_change" => {
                let body = ContentFrame::deserialize(&frame)?;
                let origin = OriginFields::from_frame(&frame)?;
                Ok(Inbound::Operation(origin.into_operation(NoteOp::ContentChange {
                    content: body.content,
                })))
            }
            "cursor_position" => {
                let body = CursorFrame::deserialize(&frame)?;
                let origin = OriginFields::from_frame(&frame)?;
                Ok(Inbound::Operation(origin.into_operation(NoteOp::CursorPosition {
                    position: body.position,
                })))
            }
            other => decode_control(other, &frame),
        }
    }

    fn preview(&self) -> String {
        let mut preview: String = self.content.chars().take(PREVIEW_CHARS).collect();
        preview.push_str("...");
        preview
    }
}
