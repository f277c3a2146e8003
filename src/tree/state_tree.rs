use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::change::ChangeRecord;
use crate::error::Result;
use crate::hash::{FastHashBuilder, FastIndexSet};
use crate::scheduler::Scheduler;
use crate::tree::node::Transition;
use crate::tree::{FeatureDecl, NodeId, StateNode};

/// State shared between the tree handle and the nodes it owns.
pub(crate) struct TreeShared {
    /// Attached nodes by id. Read far more often than written.
    nodes: papaya::HashMap<NodeId, StateNode, FastHashBuilder>,
    dirty: Mutex<FastIndexSet<StateNode>>,
    next_id: AtomicU32,
    scheduler: Scheduler,
}

impl TreeShared {
    /// Give `node` an id if it has none, store it and mark it dirty.
    pub(crate) fn register_node(&self, node: &StateNode) -> Result<NodeId> {
        let id = match node.id() {
            Some(id) => id,
            None => {
                let id = NodeId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
                node.assign_id(id)?;
                id
            }
        };
        self.insert(id, node);
        Ok(id)
    }

    fn insert(&self, id: NodeId, node: &StateNode) {
        self.nodes.pin().insert(id, node.clone());
        self.mark_dirty(node);
    }

    pub(crate) fn mark_dirty(&self, node: &StateNode) {
        self.dirty.lock().insert(node.clone());
    }
}

/// Root of a state tree, with its node registry and dirty set.
///
/// # Example
/// ```ignore
/// const PROPS: FeatureId = FeatureId::new(1);
/// const CHILDREN: FeatureId = FeatureId::new(2);
///
/// let scheduler = Scheduler::new();
/// let tree = StateTree::new(&scheduler, [FeatureDecl::node_list(CHILDREN)]);
///
/// let button = StateNode::new(&scheduler, [FeatureDecl::map(PROPS)]);
/// button.put(PROPS, "label", json!("Save"))?;
/// tree.root().list_push(CHILDREN, &button)?;
///
/// // Attach(1), ListAdd(1, [2]), Attach(2), Put(2, label)
/// let changes = tree.collect_changes();
/// ```
///
/// Clones share the same tree.
#[derive(Clone)]
pub struct StateTree {
    shared: Arc<TreeShared>,
    root: StateNode,
}

impl StateTree {
    /// Create a tree whose root has `root_features`. The root gets
    /// [`NodeId::ROOT`] and is dirty, so the first collection attaches it.
    pub fn new(scheduler: &Scheduler, root_features: impl IntoIterator<Item = FeatureDecl>) -> Self {
        let shared = Arc::new(TreeShared {
            nodes: papaya::HashMap::with_hasher(FastHashBuilder),
            dirty: Mutex::new(FastIndexSet::default()),
            next_id: AtomicU32::new(NodeId::ROOT.get() + 1),
            scheduler: scheduler.clone(),
        });
        let root = StateNode::new_root(scheduler, root_features, Arc::downgrade(&shared));
        shared.insert(NodeId::ROOT, &root);
        Self { shared, root }
    }

    /// The root node.
    pub fn root(&self) -> &StateNode {
        &self.root
    }

    /// The scheduler the tree's nodes report to.
    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Create a detached node on this tree's scheduler.
    pub fn create_node(&self, features: impl IntoIterator<Item = FeatureDecl>) -> StateNode {
        StateNode::new(&self.shared.scheduler, features)
    }

    /// Register `node` with the tree: assign the next sequential id if it has
    /// none, store it and mark it dirty.
    ///
    /// Nodes are registered automatically when they become descendants of the
    /// root; calling this by hand is only needed to reserve an id early.
    pub fn register(&self, node: &StateNode) -> Result<NodeId> {
        self.shared.register_node(node)
    }

    /// Look up a registered node.
    pub fn node_by_id(&self, id: NodeId) -> Option<StateNode> {
        self.shared.nodes.pin().get(&id).cloned()
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.shared.nodes.len()
    }

    /// True if some node changed since the last collection.
    pub fn has_dirty_nodes(&self) -> bool {
        !self.shared.dirty.lock().is_empty()
    }

    /// Collect the changes of every dirty node, in the order the nodes
    /// became dirty.
    pub fn collect_changes(&self) -> Vec<ChangeRecord> {
        let mut changes = Vec::new();
        self.collect_changes_with(|change| changes.push(change));
        changes
    }

    /// Like [`collect_changes`](Self::collect_changes), handing each record to
    /// `emit`.
    ///
    /// The dirty set is swapped out first: nodes marked dirty while `emit`
    /// runs are collected next time. Nodes that are no longer attached leave
    /// the registry but keep their id.
    pub fn collect_changes_with(&self, mut emit: impl FnMut(ChangeRecord)) {
        let dirty = std::mem::take(&mut *self.shared.dirty.lock());
        let dirty_count = dirty.len();

        for node in dirty {
            let (attached, transition) = node.collect_changes(&mut emit);
            if attached {
                continue;
            }
            if let Some(id) = node.id() {
                if transition == Some(Transition::Detached) {
                    cov_mark::hit!(detached_node_unregistered);
                }
                self.shared.nodes.pin().remove(&id);
            }
        }

        tracing::trace!(dirty_count, "changes collected");
    }
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("nodes", &self.shared.nodes.len())
            .field("dirty", &self.shared.dirty.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ListItems, RecordValue};
    use crate::error::Error;
    use crate::tree::FeatureId;
    use serde_json::json;

    const PROPS: FeatureId = FeatureId::new(1);
    const CHILDREN: FeatureId = FeatureId::new(2);

    fn tree() -> StateTree {
        StateTree::new(
            &Scheduler::new(),
            [FeatureDecl::map(PROPS), FeatureDecl::node_list(CHILDREN)],
        )
    }

    fn child(tree: &StateTree) -> StateNode {
        tree.create_node([FeatureDecl::map(PROPS), FeatureDecl::node_list(CHILDREN)])
    }

    #[test]
    fn first_collection_attaches_root() {
        let tree = tree();
        assert_eq!(tree.root().id(), Some(NodeId::ROOT));
        assert!(tree.root().is_attached());
        assert_eq!(
            tree.collect_changes(),
            vec![
                ChangeRecord::Attach { node: NodeId::ROOT },
                ChangeRecord::Empty {
                    node: NodeId::ROOT,
                    feature: PROPS
                },
                ChangeRecord::Empty {
                    node: NodeId::ROOT,
                    feature: CHILDREN
                },
            ]
        );
        assert!(!tree.has_dirty_nodes());
        assert!(tree.collect_changes().is_empty());
    }

    #[test]
    fn ids_are_sequential_and_registered() {
        let tree = tree();
        let a = child(&tree);
        let b = child(&tree);
        a.list_push(CHILDREN, &b).unwrap();
        tree.root().list_push(CHILDREN, &a).unwrap();

        assert_eq!(a.id(), Some(NodeId::new(2)));
        assert_eq!(b.id(), Some(NodeId::new(3)));
        assert_eq!(tree.node_by_id(NodeId::new(3)), Some(b));
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn register_keeps_existing_ids() {
        let tree = tree();
        let node = child(&tree);
        let id = tree.register(&node).unwrap();
        assert_eq!(tree.register(&node).unwrap(), id);
        assert!(matches!(
            node.assign_id(NodeId::new(40)),
            Err(Error::IdAlreadyAssigned { .. })
        ));
    }

    #[test]
    fn attach_emits_child_before_parent_reference() {
        let tree = tree();
        tree.collect_changes();

        let node = child(&tree);
        node.put(PROPS, "a", json!(1)).unwrap();
        tree.root().list_push(CHILDREN, &node).unwrap();

        assert_eq!(
            tree.collect_changes(),
            vec![
                ChangeRecord::Attach { node: NodeId::new(2) },
                ChangeRecord::Put {
                    node: NodeId::new(2),
                    feature: PROPS,
                    key: "a".into(),
                    value: RecordValue::Literal(json!(1)),
                },
                ChangeRecord::Empty {
                    node: NodeId::new(2),
                    feature: CHILDREN
                },
                ChangeRecord::ListAdd {
                    node: NodeId::ROOT,
                    feature: CHILDREN,
                    index: 0,
                    items: ListItems::Nodes(vec![NodeId::new(2)]),
                },
            ]
        );
    }

    #[test]
    fn detach_emits_only_detach_and_unregisters() {
        let tree = tree();
        let node = child(&tree);
        tree.root().list_push(CHILDREN, &node).unwrap();
        tree.collect_changes();

        node.put(PROPS, "ignored", json!(true)).unwrap();
        tree.root().list_remove(CHILDREN, 0).unwrap();

        cov_mark::check!(detached_node_unregistered);
        assert_eq!(
            tree.collect_changes(),
            vec![
                ChangeRecord::Detach { node: NodeId::new(2) },
                ChangeRecord::ListRemove {
                    node: NodeId::ROOT,
                    feature: CHILDREN,
                    index: 0,
                    removed: RecordValue::Node(NodeId::new(2)),
                },
            ]
        );
        assert_eq!(tree.node_by_id(NodeId::new(2)), None);
        assert_eq!(node.id(), Some(NodeId::new(2)));
    }

    #[test]
    fn attach_then_detach_in_one_cycle_is_invisible() {
        let tree = tree();
        tree.collect_changes();

        let node = child(&tree);
        tree.root().put(PROPS, "slot", &node).unwrap();
        tree.root().remove(PROPS, "slot").unwrap();

        assert!(tree.collect_changes().is_empty());
        assert_eq!(tree.node_by_id(NodeId::new(2)), None);
    }

    #[test]
    fn changes_during_emit_go_to_the_next_cycle() {
        let tree = tree();
        let root = tree.root().clone();
        let mut first = Vec::new();
        tree.collect_changes_with(|change| {
            if first.is_empty() {
                root.put(PROPS, "late", json!(1)).unwrap();
            }
            first.push(change);
        });

        assert!(first.iter().all(|c| !matches!(c, ChangeRecord::Put { .. })));
        assert_eq!(
            tree.collect_changes(),
            vec![ChangeRecord::Put {
                node: NodeId::ROOT,
                feature: PROPS,
                key: "late".into(),
                value: RecordValue::Literal(json!(1)),
            }]
        );
    }

    #[test]
    fn nodes_cannot_move_between_trees() {
        let (a, b) = (tree(), tree());
        let moved = child(&a);
        a.root().list_push(CHILDREN, &moved).unwrap();
        let resident = child(&b);
        b.root().list_push(CHILDREN, &resident).unwrap();
        assert_eq!(moved.id(), resident.id());
        a.root().list_remove(CHILDREN, 0).unwrap();

        assert!(matches!(
            b.root().list_push(CHILDREN, &moved),
            Err(Error::ForeignTree { node: Some(id) }) if id == NodeId::new(2)
        ));

        // Parking it under a detached node does not change where it belongs
        let holder = child(&b);
        holder.list_push(CHILDREN, &moved).unwrap();
        assert!(matches!(
            b.root().list_push(CHILDREN, &holder),
            Err(Error::ForeignTree { .. })
        ));

        assert_eq!(b.node_by_id(NodeId::new(2)), Some(resident));
        assert_eq!(b.root().list_len(CHILDREN), 1);
    }

    #[test]
    fn root_starts_registered_and_children_count_from_two() {
        let tree = tree();
        assert_eq!(tree.node_by_id(NodeId::ROOT), Some(tree.root().clone()));
        assert!(tree.has_dirty_nodes());
        assert_eq!(tree.register(&child(&tree)).unwrap(), NodeId::new(2));
    }
}
