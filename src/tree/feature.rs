// Feature storage and per-cycle change tracking
//
// A map feature remembers, for every key touched since the last collection,
// the value the key had before the first touch. Collection compares that
// original with the current value, so a put followed by a remove of the same
// key (or a put of the value that was already there) produces nothing.
//
// A list feature keeps an ordered log instead, since list indices depend on
// every earlier operation. The log is kept short while it is written:
// consecutive inserts merge into one add, removing an item the last add
// inserted edits that add, and clear throws away everything before it.

use std::sync::Arc;

use crate::change::{ChangeRecord, ListItems, RecordValue};
use crate::error::{Error, Result};
use crate::hash::FastIndexMap;
use crate::router::{ReactiveEvent, ReactiveEventRouter, SourceId};
use crate::scheduler::Scheduler;
use crate::tree::{FeatureDecl, FeatureId, FeatureKind, NodeId, StateNode, StateValue};

/// Fired by a node after one of its features changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureChangeEvent {
    /// Router of the changed feature.
    pub source: SourceId,
    /// Node the feature belongs to, if the node has an id yet.
    pub node: Option<NodeId>,
    /// The changed feature.
    pub feature: FeatureId,
}

impl ReactiveEvent for FeatureChangeEvent {
    fn source(&self) -> SourceId {
        self.source
    }
}

pub(crate) type FeatureRouter = Arc<ReactiveEventRouter<FeatureChangeEvent>>;

pub(crate) struct Feature {
    pub(crate) decl: FeatureDecl,
    pub(crate) data: FeatureData,
    pub(crate) router: FeatureRouter,
}

pub(crate) enum FeatureData {
    Map(MapFeature),
    List(ListFeature),
}

impl Feature {
    pub(crate) fn new(decl: FeatureDecl, scheduler: &Scheduler) -> Self {
        let data = match decl.kind {
            FeatureKind::Map => FeatureData::Map(MapFeature::default()),
            FeatureKind::List | FeatureKind::NodeList => FeatureData::List(ListFeature::default()),
        };
        Self {
            decl,
            data,
            router: Arc::new(ReactiveEventRouter::new(scheduler)),
        }
    }

    fn mismatch(&self, expected: FeatureKind) -> Error {
        Error::FeatureKindMismatch {
            feature: self.decl.id,
            expected,
            actual: self.decl.kind,
        }
    }

    pub(crate) fn map(&self) -> Result<&MapFeature> {
        match &self.data {
            FeatureData::Map(map) => Ok(map),
            FeatureData::List(_) => Err(self.mismatch(FeatureKind::Map)),
        }
    }

    pub(crate) fn map_mut(&mut self) -> Result<&mut MapFeature> {
        match &mut self.data {
            FeatureData::Map(map) => Ok(map),
            FeatureData::List(_) => Err(Error::FeatureKindMismatch {
                feature: self.decl.id,
                expected: FeatureKind::Map,
                actual: self.decl.kind,
            }),
        }
    }

    pub(crate) fn list(&self) -> Result<&ListFeature> {
        match &self.data {
            FeatureData::List(list) => Ok(list),
            FeatureData::Map(_) => Err(self.mismatch(FeatureKind::List)),
        }
    }

    pub(crate) fn list_mut(&mut self) -> Result<&mut ListFeature> {
        match &mut self.data {
            FeatureData::List(list) => Ok(list),
            FeatureData::Map(_) => Err(Error::FeatureKindMismatch {
                feature: self.decl.id,
                expected: FeatureKind::List,
                actual: self.decl.kind,
            }),
        }
    }

    /// Reject values this feature cannot hold.
    pub(crate) fn check_value(&self, value: &StateValue) -> Result<()> {
        let accepted = match (self.decl.kind, value) {
            (FeatureKind::Map, _) => true,
            (FeatureKind::List, StateValue::Value(_)) => true,
            (FeatureKind::NodeList, StateValue::Node(_)) => true,
            _ => false,
        };
        if accepted {
            Ok(())
        } else {
            Err(Error::UnsupportedValue {
                feature: self.decl.id,
                found: value.describe(),
            })
        }
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = &StateNode> {
        let values: Box<dyn Iterator<Item = &StateValue> + '_> = match &self.data {
            FeatureData::Map(map) => Box::new(map.values.values()),
            FeatureData::List(list) => Box::new(list.items.iter()),
        };
        values.filter_map(StateValue::as_node)
    }

    fn record_value(&self, value: &StateValue) -> Option<RecordValue> {
        match value {
            StateValue::Value(value) if self.decl.pooled => Some(RecordValue::Constant(value.clone())),
            StateValue::Value(value) => Some(RecordValue::Literal(value.clone())),
            StateValue::Node(node) => match node.id() {
                Some(id) => Some(RecordValue::Node(id)),
                None => {
                    tracing::warn!(feature = %self.decl.id, "child node without id skipped");
                    None
                }
            },
        }
    }

    fn list_items(&self, items: &[StateValue]) -> ListItems {
        match self.decl.kind {
            FeatureKind::NodeList => ListItems::Nodes(
                items
                    .iter()
                    .filter_map(|item| item.as_node().and_then(StateNode::id))
                    .collect(),
            ),
            _ => {
                let values = items
                    .iter()
                    .filter_map(StateValue::as_value)
                    .cloned()
                    .collect();
                if self.decl.pooled {
                    ListItems::Constants(values)
                } else {
                    ListItems::Values(values)
                }
            }
        }
    }

    /// Records describing the complete current content, or a single `Empty`.
    pub(crate) fn collect_full(&self, node: NodeId, out: &mut Vec<ChangeRecord>) {
        let feature = self.decl.id;
        let before = out.len();
        match &self.data {
            FeatureData::Map(map) => {
                for (key, value) in &map.values {
                    if let Some(value) = self.record_value(value) {
                        out.push(ChangeRecord::Put {
                            node,
                            feature,
                            key: key.clone(),
                            value,
                        });
                    }
                }
            }
            FeatureData::List(list) => {
                if !list.items.is_empty() {
                    out.push(ChangeRecord::ListAdd {
                        node,
                        feature,
                        index: 0,
                        items: self.list_items(&list.items),
                    });
                }
            }
        }
        if out.len() == before {
            out.push(ChangeRecord::Empty { node, feature });
        }
    }

    /// Records for the changes tracked since the last reset.
    pub(crate) fn collect_pending(&self, node: NodeId, out: &mut Vec<ChangeRecord>) {
        let feature = self.decl.id;
        match &self.data {
            FeatureData::Map(map) => {
                for (key, original) in &map.originals {
                    match (original, map.values.get(key)) {
                        (original, Some(current)) if original.as_ref() != Some(current) => {
                            if let Some(value) = self.record_value(current) {
                                out.push(ChangeRecord::Put {
                                    node,
                                    feature,
                                    key: key.clone(),
                                    value,
                                });
                            }
                        }
                        (Some(_), None) => out.push(ChangeRecord::Remove {
                            node,
                            feature,
                            key: key.clone(),
                        }),
                        _ => {}
                    }
                }
            }
            FeatureData::List(list) => {
                for change in &list.log {
                    match change {
                        ListChange::Add { items, .. } if items.is_empty() => {
                            cov_mark::hit!(empty_list_add_dropped);
                        }
                        ListChange::Add { index, items } => out.push(ChangeRecord::ListAdd {
                            node,
                            feature,
                            index: *index,
                            items: self.list_items(items),
                        }),
                        ListChange::Remove { index, removed } => {
                            if let Some(removed) = self.record_value(removed) {
                                out.push(ChangeRecord::ListRemove {
                                    node,
                                    feature,
                                    index: *index,
                                    removed,
                                });
                            }
                        }
                        ListChange::Clear => out.push(ChangeRecord::ListClear { node, feature }),
                    }
                }
            }
        }
    }

    /// Forget tracked changes; the current content becomes the baseline.
    pub(crate) fn reset(&mut self) {
        match &mut self.data {
            FeatureData::Map(map) => map.originals.clear(),
            FeatureData::List(list) => list.log.clear(),
        }
    }
}

#[derive(Default)]
pub(crate) struct MapFeature {
    values: FastIndexMap<String, StateValue>,
    /// Value before the first change of this cycle, `None` if absent
    originals: FastIndexMap<String, Option<StateValue>>,
}

impl MapFeature {
    pub(crate) fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    fn track(&mut self, key: &str) {
        if !self.originals.contains_key(key) {
            let original = self.values.get(key).cloned();
            self.originals.insert(key.to_owned(), original);
        }
    }

    pub(crate) fn put(&mut self, key: String, value: StateValue) -> Option<StateValue> {
        self.track(&key);
        self.values.insert(key, value)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<StateValue> {
        if !self.values.contains_key(key) {
            return None;
        }
        self.track(key);
        self.values.shift_remove(key)
    }
}

enum ListChange {
    Add { index: usize, items: Vec<StateValue> },
    Remove { index: usize, removed: StateValue },
    Clear,
}

#[derive(Default)]
pub(crate) struct ListFeature {
    items: Vec<StateValue>,
    log: Vec<ListChange>,
}

impl ListFeature {
    pub(crate) fn items(&self) -> &[StateValue] {
        &self.items
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn check_insert(&self, feature: FeatureId, index: usize) -> Result<()> {
        if index > self.items.len() {
            return Err(Error::IndexOutOfBounds {
                feature,
                index,
                len: self.items.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_remove(&self, feature: FeatureId, index: usize) -> Result<()> {
        if index >= self.items.len() {
            return Err(Error::IndexOutOfBounds {
                feature,
                index,
                len: self.items.len(),
            });
        }
        Ok(())
    }

    /// Callers check the index first.
    pub(crate) fn insert(&mut self, index: usize, item: StateValue) {
        self.items.insert(index, item.clone());
        if let Some(ListChange::Add { index: start, items }) = self.log.last_mut() {
            if (*start..=*start + items.len()).contains(&index) {
                items.insert(index - *start, item);
                return;
            }
        }
        self.log.push(ListChange::Add {
            index,
            items: vec![item],
        });
    }

    /// Callers check the index first.
    pub(crate) fn remove(&mut self, index: usize) -> StateValue {
        let removed = self.items.remove(index);
        if let Some(ListChange::Add { index: start, items }) = self.log.last_mut() {
            if (*start..*start + items.len()).contains(&index) {
                cov_mark::hit!(list_remove_edits_pending_add);
                items.remove(index - *start);
                return removed;
            }
        }
        self.log.push(ListChange::Remove {
            index,
            removed: removed.clone(),
        });
        removed
    }

    /// Returns the removed items, or `None` if there was nothing to clear.
    pub(crate) fn clear(&mut self) -> Option<Vec<StateValue>> {
        if self.items.is_empty() && self.log.is_empty() {
            return None;
        }
        self.log.clear();
        self.log.push(ListChange::Clear);
        Some(std::mem::take(&mut self.items))
    }
}
