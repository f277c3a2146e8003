//! The state tree: nodes holding keyed maps and ordered lists, with per-cycle
//! change capture.
//!
//! Every mutation of a [`StateNode`] does two things: it records the change
//! inside the affected feature and marks the node dirty on its owner. Once a
//! node is part of a [`StateTree`], [`StateTree::collect_changes`] turns the
//! dirty nodes into an ordered list of [`ChangeRecord`](crate::ChangeRecord)s
//! and resets the tracking, so each cycle ships only what changed since the
//! previous one.
//!
//! Nodes start out detached, owned by a private temporary owner. Putting a
//! node into a feature of another node makes it that node's child and moves
//! its whole subtree to the parent's owner. Once the parent chain reaches the
//! root the node is attached; its next collection emits `Attach` and its full
//! current state.

mod feature;
mod node;
mod state_tree;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub use feature::FeatureChangeEvent;
pub use node::StateNode;
pub use state_tree::StateTree;

/// Identity of a node within its tree. Assigned once, never changed.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    /// Id of the tree root.
    pub const ROOT: NodeId = NodeId(1);

    /// Wrap a raw id.
    pub const fn new(raw: u32) -> Self {
        NodeId(raw)
    }

    /// The raw id.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a feature within a node, shared with the remote peer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(u16);

impl FeatureId {
    /// Wrap a raw feature id.
    pub const fn new(raw: u16) -> Self {
        FeatureId(raw)
    }

    /// The raw id.
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a feature stores.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// String keys to literal values or child nodes.
    Map,
    /// Ordered literal values.
    List,
    /// Ordered child nodes.
    NodeList,
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeatureKind::Map => "map",
            FeatureKind::List => "list",
            FeatureKind::NodeList => "node list",
        })
    }
}

/// Declaration of one feature of a node.
///
/// ```ignore
/// let features = [
///     FeatureDecl::map(FeatureId::new(1)),
///     FeatureDecl::list(FeatureId::new(2)).pooled(),
///     FeatureDecl::node_list(FeatureId::new(3)),
/// ];
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FeatureDecl {
    /// Feature id.
    pub id: FeatureId,
    /// Feature kind.
    pub kind: FeatureKind,
    /// Literal values are sent through the constant pool.
    #[serde(default)]
    pub pooled: bool,
}

impl FeatureDecl {
    /// A map feature.
    pub const fn map(id: FeatureId) -> Self {
        Self {
            id,
            kind: FeatureKind::Map,
            pooled: false,
        }
    }

    /// A list of literal values.
    pub const fn list(id: FeatureId) -> Self {
        Self {
            id,
            kind: FeatureKind::List,
            pooled: false,
        }
    }

    /// A list of child nodes.
    pub const fn node_list(id: FeatureId) -> Self {
        Self {
            id,
            kind: FeatureKind::NodeList,
            pooled: false,
        }
    }

    /// Route this feature's literal values through the constant pool.
    pub const fn pooled(mut self) -> Self {
        self.pooled = true;
        self
    }
}

/// A value stored in a feature.
#[derive(Clone, Debug)]
pub enum StateValue {
    /// Literal JSON value.
    Value(Value),
    /// Child node.
    Node(StateNode),
}

impl StateValue {
    /// The child node, if this is one.
    pub fn as_node(&self) -> Option<&StateNode> {
        match self {
            StateValue::Node(node) => Some(node),
            StateValue::Value(_) => None,
        }
    }

    /// The literal, if this is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            StateValue::Value(value) => Some(value),
            StateValue::Node(_) => None,
        }
    }

    pub(crate) fn describe(&self) -> &'static str {
        match self {
            StateValue::Value(_) => "literal",
            StateValue::Node(_) => "node",
        }
    }
}

/// Nodes compare by identity, literals by value.
impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StateValue::Value(a), StateValue::Value(b)) => a == b,
            (StateValue::Node(a), StateValue::Node(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        StateValue::Value(value)
    }
}

impl From<StateNode> for StateValue {
    fn from(node: StateNode) -> Self {
        StateValue::Node(node)
    }
}

impl From<&StateNode> for StateValue {
    fn from(node: &StateNode) -> Self {
        StateValue::Node(node.clone())
    }
}
