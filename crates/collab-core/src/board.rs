//! Canvas board documents: a graph of positioned nodes and labelled edges.
//!
//! Wire format for operations:
//! `{"type":"op","op":"add_node","data":{...},"user_id":"u1","username":"ana"}`
//!
//! The relay also pushes `{"type":"state","nodes":[...],"edges":[...],"online":2}`
//! on connect, which replaces the local board wholesale.

use crate::document::{Document, DocumentKind};
use crate::protocol::encoding::{decode_control, frame_type, frame_with_origin, OriginFields};
use crate::protocol::{Inbound, Operation, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A positioned node. Attributes the engine doesn't interpret (text, color,
/// note references, ...) ride along in `attrs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(flatten)]
    pub attrs: Map<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            x,
            y,
            width: None,
            height: None,
            attrs: Map::new(),
        }
    }

    /// Merge a partial update into this node. Known geometry fields are
    /// interpreted; everything else overwrites the matching attribute.
    fn merge(&mut self, attrs: &Map<String, Value>) {
        for (key, value) in attrs {
            match key.as_str() {
                "id" => {}
                "x" => {
                    if let Some(x) = value.as_f64() {
                        self.x = x;
                    }
                }
                "y" => {
                    if let Some(y) = value.as_f64() {
                        self.y = y;
                    }
                }
                "width" => self.width = value.as_f64(),
                "height" => self.height = value.as_f64(),
                "type" => {
                    if let Some(kind) = value.as_str() {
                        self.kind = kind.to_string();
                    }
                }
                _ => {
                    self.attrs.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    #[serde(alias = "source")]
    pub source_node_id: String,
    #[serde(alias = "target")]
    pub target_node_id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub style: Value,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_node_id: source.into(),
            target_node_id: target.into(),
            label: String::new(),
            style: Value::Null,
        }
    }

    fn touches(&self, node_id: &str) -> bool {
        self.source_node_id == node_id || self.target_node_id == node_id
    }
}

/// Partial node update: `id` plus the attributes that changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    pub id: String,
    #[serde(flatten)]
    pub attrs: Map<String, Value>,
}

impl NodePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Map::new(),
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum BoardOp {
    AddNode(Node),
    UpdateNode(NodePatch),
    DeleteNode(EntityRef),
    AddEdge(Edge),
    DeleteEdge(EntityRef),
}

impl BoardOp {
    pub fn delete_node(id: impl Into<String>) -> Self {
        BoardOp::DeleteNode(EntityRef { id: id.into() })
    }

    pub fn delete_edge(id: impl Into<String>) -> Self {
        BoardOp::DeleteEdge(EntityRef { id: id.into() })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardDocument {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl BoardDocument {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }
}

#[derive(Deserialize)]
struct StateFrame {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default)]
    online: Option<usize>,
}

impl Document for BoardDocument {
    type Op = BoardOp;

    const KIND: DocumentKind = DocumentKind::Board;

    fn apply(&mut self, op: &BoardOp) -> bool {
        match op {
            BoardOp::AddNode(node) => {
                // Re-adding an existing id overwrites it.
                match self.nodes.iter_mut().find(|n| n.id == node.id) {
                    Some(existing) if existing == node => false,
                    Some(existing) => {
                        *existing = node.clone();
                        true
                    }
                    None => {
                        self.nodes.push(node.clone());
                        true
                    }
                }
            }
            BoardOp::UpdateNode(patch) => match self.nodes.iter_mut().find(|n| n.id == patch.id) {
                Some(node) => {
                    let before = node.clone();
                    node.merge(&patch.attrs);
                    *node != before
                }
                None => false,
            },
            BoardOp::DeleteNode(target) => {
                let nodes_before = self.nodes.len();
                let edges_before = self.edges.len();
                self.nodes.retain(|n| n.id != target.id);
                self.edges.retain(|e| !e.touches(&target.id));
                self.nodes.len() != nodes_before || self.edges.len() != edges_before
            }
            BoardOp::AddEdge(edge) => match self.edges.iter_mut().find(|e| e.id == edge.id) {
                Some(existing) if existing == edge => false,
                Some(existing) => {
                    *existing = edge.clone();
                    true
                }
                None => {
                    self.edges.push(edge.clone());
                    true
                }
            },
            BoardOp::DeleteEdge(target) => {
                let before = self.edges.len();
                self.edges.retain(|e| e.id != target.id);
                self.edges.len() != before
            }
        }
    }

    fn encode_operation(op: &Operation<BoardOp>) -> Result<Value, ProtocolError> {
        let mut frame = frame_with_origin("op", op)?;
        if let Value::Object(body) = serde_json::to_value(&op.op)? {
            frame.extend(body);
        }
        Ok(Value::Object(frame))
    }

    fn decode_frame(frame: Value) -> Result<Inbound<Self>, ProtocolError> {
        let kind = frame_type(&frame)?;
        match kind {
            "op" => {
                let op = BoardOp::deserialize(&frame)?;
                let origin = OriginFields::from_frame(&frame)?;
                Ok(Inbound::Operation(origin.into_operation(op)))
            }
            "state" => {
                let state = StateFrame::deserialize(&frame)?;
                Ok(Inbound::State {
                    document: BoardDocument {
                        nodes: state.nodes,
                        edges: state.edges,
                    },
                    online: state.online,
                })
            }
            other => decode_control(other, &frame),
        }
    }

    fn preview(&self) -> String {
        format!("{} nodes, {} edges", self.nodes.len(), self.edges.len())
    }
}
