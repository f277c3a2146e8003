//! Change records and their JSON rendering.
//!
//! A [`ChangeRecord`] describes one mutation of one feature of one node (or
//! the attach/detach of a whole node). Records are produced by
//! [`StateTree::collect_changes`](crate::StateTree::collect_changes) in the
//! order the peer has to apply them, and rendered with
//! [`ChangeRecord::encode`]:
//!
//! ```text
//! {"type": "attach", "node": 4}
//! {"type": "put",    "node": 4, "feat": 1, "key": "label", "value": "Save"}
//! {"type": "put",    "node": 4, "feat": 2, "key": "style", "constant": "q3bC9x1Dk0A"}
//! {"type": "splice", "node": 1, "feat": 3, "index": 0, "addNodes": [4]}
//! {"type": "splice", "node": 1, "feat": 3, "index": 2, "remove": 1}
//! ```

use serde_json::{Map, Value, json};

use crate::constant_pool::ConstantPool;
use crate::error::Result;
use crate::tree::{FeatureId, NodeId};

/// Payload of a put or a removed list item.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordValue {
    /// Inlined literal.
    Literal(Value),
    /// Literal sent through the constant pool.
    Constant(Value),
    /// Reference to another node.
    Node(NodeId),
}

/// Items added to a list.
#[derive(Clone, Debug, PartialEq)]
pub enum ListItems {
    /// Inlined literals.
    Values(Vec<Value>),
    /// Literals sent through the constant pool.
    Constants(Vec<Value>),
    /// References to child nodes.
    Nodes(Vec<NodeId>),
}

impl ListItems {
    /// Number of items.
    pub fn len(&self) -> usize {
        match self {
            ListItems::Values(items) | ListItems::Constants(items) => items.len(),
            ListItems::Nodes(nodes) => nodes.len(),
        }
    }

    /// True if nothing is added.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wire tag of a record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// Node became attached.
    Attach,
    /// Node became detached.
    Detach,
    /// Feature exists but has no content.
    Noop,
    /// Map entry set.
    Put,
    /// Map entry removed.
    Remove,
    /// List items added or removed.
    Splice,
    /// List emptied.
    Clear,
}

impl ChangeType {
    /// Tag used in the encoded record.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Attach => "attach",
            ChangeType::Detach => "detach",
            ChangeType::Noop => "noop",
            ChangeType::Put => "put",
            ChangeType::Remove => "remove",
            ChangeType::Splice => "splice",
            ChangeType::Clear => "clear",
        }
    }
}

/// One change to ship to the peer.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeRecord {
    /// The node is now part of the attached tree. Followed by its full state.
    Attach {
        /// Target node.
        node: NodeId,
    },
    /// The node left the attached tree.
    Detach {
        /// Target node.
        node: NodeId,
    },
    /// Announces a feature that has no content, on attach.
    Empty {
        /// Target node.
        node: NodeId,
        /// Target feature.
        feature: FeatureId,
    },
    /// Map entry set to `value`.
    Put {
        /// Target node.
        node: NodeId,
        /// Target feature.
        feature: FeatureId,
        /// Map key.
        key: String,
        /// New value.
        value: RecordValue,
    },
    /// Map entry removed.
    Remove {
        /// Target node.
        node: NodeId,
        /// Target feature.
        feature: FeatureId,
        /// Map key.
        key: String,
    },
    /// Items inserted at `index`.
    ListAdd {
        /// Target node.
        node: NodeId,
        /// Target feature.
        feature: FeatureId,
        /// Position of the first added item.
        index: usize,
        /// Added items.
        items: ListItems,
    },
    /// One item removed at `index`.
    ListRemove {
        /// Target node.
        node: NodeId,
        /// Target feature.
        feature: FeatureId,
        /// Position of the removed item.
        index: usize,
        /// The removed item.
        removed: RecordValue,
    },
    /// Every item removed.
    ListClear {
        /// Target node.
        node: NodeId,
        /// Target feature.
        feature: FeatureId,
    },
}

impl ChangeRecord {
    /// The node this record targets.
    pub fn node(&self) -> NodeId {
        match self {
            ChangeRecord::Attach { node }
            | ChangeRecord::Detach { node }
            | ChangeRecord::Empty { node, .. }
            | ChangeRecord::Put { node, .. }
            | ChangeRecord::Remove { node, .. }
            | ChangeRecord::ListAdd { node, .. }
            | ChangeRecord::ListRemove { node, .. }
            | ChangeRecord::ListClear { node, .. } => *node,
        }
    }

    /// The feature this record targets. Attach and detach concern the whole
    /// node and have none.
    pub fn feature(&self) -> Option<FeatureId> {
        match self {
            ChangeRecord::Attach { .. } | ChangeRecord::Detach { .. } => None,
            ChangeRecord::Empty { feature, .. }
            | ChangeRecord::Put { feature, .. }
            | ChangeRecord::Remove { feature, .. }
            | ChangeRecord::ListAdd { feature, .. }
            | ChangeRecord::ListRemove { feature, .. }
            | ChangeRecord::ListClear { feature, .. } => Some(*feature),
        }
    }

    /// Wire tag.
    pub fn change_type(&self) -> ChangeType {
        match self {
            ChangeRecord::Attach { .. } => ChangeType::Attach,
            ChangeRecord::Detach { .. } => ChangeType::Detach,
            ChangeRecord::Empty { .. } => ChangeType::Noop,
            ChangeRecord::Put { .. } => ChangeType::Put,
            ChangeRecord::Remove { .. } => ChangeType::Remove,
            ChangeRecord::ListAdd { .. } | ChangeRecord::ListRemove { .. } => ChangeType::Splice,
            ChangeRecord::ListClear { .. } => ChangeType::Clear,
        }
    }

    /// True for a list add without items. Such records are never emitted by
    /// the tree but can be built by hand.
    pub fn is_empty(&self) -> bool {
        matches!(self, ChangeRecord::ListAdd { items, .. } if items.is_empty())
    }

    /// Render the record as a JSON object, staging pooled literals in `pool`.
    pub fn encode(&self, pool: &ConstantPool) -> Result<Value> {
        let mut out = Map::new();
        out.insert("type".into(), self.change_type().as_str().into());
        out.insert("node".into(), self.node().get().into());
        if let Some(feature) = self.feature() {
            out.insert("feat".into(), feature.get().into());
        }

        match self {
            ChangeRecord::Attach { .. }
            | ChangeRecord::Detach { .. }
            | ChangeRecord::Empty { .. }
            | ChangeRecord::ListClear { .. } => {}
            ChangeRecord::Put { key, value, .. } => {
                out.insert("key".into(), key.as_str().into());
                let (field, encoded) = match value {
                    RecordValue::Literal(value) => ("value", value.clone()),
                    RecordValue::Constant(value) => ("constant", pool.get_id(value)?.into()),
                    RecordValue::Node(id) => ("nodeValue", id.get().into()),
                };
                out.insert(field.into(), encoded);
            }
            ChangeRecord::Remove { key, .. } => {
                out.insert("key".into(), key.as_str().into());
            }
            ChangeRecord::ListAdd { index, items, .. } => {
                out.insert("index".into(), json!(index));
                let (field, encoded) = match items {
                    ListItems::Values(values) => ("add", Value::Array(values.clone())),
                    ListItems::Constants(values) => {
                        let keys = values
                            .iter()
                            .map(|value| pool.get_id(value).map(Value::from))
                            .collect::<Result<Vec<_>>>()?;
                        ("addConstants", Value::Array(keys))
                    }
                    ListItems::Nodes(nodes) => (
                        "addNodes",
                        nodes.iter().map(|id| Value::from(id.get())).collect(),
                    ),
                };
                out.insert(field.into(), encoded);
            }
            ChangeRecord::ListRemove { index, .. } => {
                out.insert("index".into(), json!(index));
                out.insert("remove".into(), json!(1));
            }
        }

        Ok(Value::Object(out))
    }
}

/// Encode a batch of records in order.
pub fn encode_changes(changes: &[ChangeRecord], pool: &ConstantPool) -> Result<Vec<Value>> {
    changes.iter().map(|change| change.encode(pool)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: NodeId = NodeId::new(4);
    const FEAT: FeatureId = FeatureId::new(2);

    #[test]
    fn attach_has_no_feature() {
        let pool = ConstantPool::new();
        let record = ChangeRecord::Attach { node: NODE };
        assert_eq!(record.feature(), None);
        assert_eq!(
            record.encode(&pool).unwrap(),
            json!({"type": "attach", "node": 4})
        );
    }

    #[test]
    fn put_variants() {
        let pool = ConstantPool::new();
        let put = |value| ChangeRecord::Put {
            node: NODE,
            feature: FEAT,
            key: "label".into(),
            value,
        };

        assert_eq!(
            put(RecordValue::Literal(json!("Save"))).encode(&pool).unwrap(),
            json!({"type": "put", "node": 4, "feat": 2, "key": "label", "value": "Save"})
        );
        assert_eq!(
            put(RecordValue::Node(NodeId::new(9))).encode(&pool).unwrap(),
            json!({"type": "put", "node": 4, "feat": 2, "key": "label", "nodeValue": 9})
        );

        let encoded = put(RecordValue::Constant(json!({"color": "red"})))
            .encode(&pool)
            .unwrap();
        let key = pool.get_id(&json!({"color": "red"})).unwrap();
        assert_eq!(encoded["constant"], json!(key.as_str()));
        assert!(encoded.get("value").is_none());
        assert!(pool.has_pending());
    }

    #[test]
    fn splice_variants() {
        let pool = ConstantPool::new();
        let add = ChangeRecord::ListAdd {
            node: NODE,
            feature: FEAT,
            index: 3,
            items: ListItems::Nodes(vec![NodeId::new(5), NodeId::new(6)]),
        };
        assert_eq!(add.change_type(), ChangeType::Splice);
        assert_eq!(
            add.encode(&pool).unwrap(),
            json!({"type": "splice", "node": 4, "feat": 2, "index": 3, "addNodes": [5, 6]})
        );

        let remove = ChangeRecord::ListRemove {
            node: NODE,
            feature: FEAT,
            index: 1,
            removed: RecordValue::Literal(json!("x")),
        };
        assert_eq!(
            remove.encode(&pool).unwrap(),
            json!({"type": "splice", "node": 4, "feat": 2, "index": 1, "remove": 1})
        );

        let constants = ChangeRecord::ListAdd {
            node: NODE,
            feature: FEAT,
            index: 0,
            items: ListItems::Constants(vec![json!("a"), json!("a")]),
        };
        let encoded = constants.encode(&pool).unwrap();
        let keys = encoded["addConstants"].as_array().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], keys[1]);
        assert_eq!(pool.drain_pending().len(), 1);
    }

    #[test]
    fn empty_and_clear_tags() {
        let pool = ConstantPool::new();
        let records = [
            ChangeRecord::Empty {
                node: NODE,
                feature: FEAT,
            },
            ChangeRecord::ListClear {
                node: NODE,
                feature: FEAT,
            },
            ChangeRecord::Detach { node: NODE },
        ];
        let encoded = encode_changes(&records, &pool).unwrap();
        assert_eq!(
            encoded,
            vec![
                json!({"type": "noop", "node": 4, "feat": 2}),
                json!({"type": "clear", "node": 4, "feat": 2}),
                json!({"type": "detach", "node": 4}),
            ]
        );
    }

    #[test]
    fn empty_add_reports_empty() {
        let record = ChangeRecord::ListAdd {
            node: NODE,
            feature: FEAT,
            index: 0,
            items: ListItems::Values(Vec::new()),
        };
        assert!(record.is_empty());
        assert!(!ChangeRecord::Attach { node: NODE }.is_empty());
    }
}
