use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use crate::change::ChangeRecord;
use crate::error::{Error, Result};
use crate::hash::FastIndexMap;
use crate::listener::Subscription;
use crate::router::SourceId;
use crate::scheduler::Scheduler;
use crate::tree::feature::{Feature, FeatureChangeEvent, FeatureRouter};
use crate::tree::state_tree::TreeShared;
use crate::tree::{FeatureDecl, FeatureId, NodeId, StateValue};

/// Holds the dirty nodes of a detached subtree until it joins a tree.
#[derive(Default)]
pub(crate) struct TemporaryOwner {
    /// Keyed by node address; weak so dropped detached nodes simply vanish
    dirty: Mutex<FastIndexMap<usize, Weak<NodeInner>>>,
}

impl TemporaryOwner {
    fn take_dirty(&self) -> Vec<StateNode> {
        std::mem::take(&mut *self.dirty.lock())
            .into_values()
            .filter_map(|weak| weak.upgrade().map(|inner| StateNode { inner }))
            .collect()
    }
}

#[derive(Clone)]
pub(crate) enum Owner {
    Temporary(Arc<TemporaryOwner>),
    Tree(Weak<TreeShared>),
}

impl Owner {
    fn same(&self, other: &Owner) -> bool {
        match (self, other) {
            (Owner::Temporary(a), Owner::Temporary(b)) => Arc::ptr_eq(a, b),
            (Owner::Tree(a), Owner::Tree(b)) => Weak::ptr_eq(a, b),
            _ => false,
        }
    }

    fn mark_dirty(&self, node: &StateNode) {
        match self {
            Owner::Temporary(owner) => {
                owner
                    .dirty
                    .lock()
                    .entry(node.addr())
                    .or_insert_with(|| Arc::downgrade(&node.inner));
            }
            Owner::Tree(tree) => {
                if let Some(tree) = tree.upgrade() {
                    tree.mark_dirty(node);
                }
            }
        }
    }
}

/// Attachment change observed by one collection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    Attached,
    Detached,
}

pub(crate) struct NodeInner {
    id: OnceLock<NodeId>,
    is_root: bool,
    scheduler: Scheduler,
    state: Mutex<NodeState>,
}

struct NodeState {
    owner: Owner,
    parent: Option<Weak<NodeInner>>,
    features: FastIndexMap<FeatureId, Feature>,
    /// Attachment seen by the previous collection
    was_attached: bool,
}

impl NodeState {
    fn feature(&self, id: FeatureId) -> Result<&Feature> {
        self.features
            .get(&id)
            .ok_or(Error::UnknownFeature { feature: id })
    }

    fn feature_mut(&mut self, id: FeatureId) -> Result<&mut Feature> {
        self.features
            .get_mut(&id)
            .ok_or(Error::UnknownFeature { feature: id })
    }
}

/// A node of the state tree.
///
/// A node holds the features it was declared with. Writes go through the
/// node so that it can track them, keep parent links straight and notify
/// readers; reads made inside a computation make it depend on the feature
/// that was read.
///
/// Handles are cheap to clone and compare by identity.
#[derive(Clone)]
pub struct StateNode {
    inner: Arc<NodeInner>,
}

impl StateNode {
    /// Create a detached node with the given features.
    ///
    /// When a feature id is declared twice the last declaration wins.
    pub fn new(scheduler: &Scheduler, features: impl IntoIterator<Item = FeatureDecl>) -> Self {
        Self::build(
            scheduler,
            features,
            Owner::Temporary(Arc::default()),
            None,
        )
    }

    pub(crate) fn new_root(
        scheduler: &Scheduler,
        features: impl IntoIterator<Item = FeatureDecl>,
        tree: Weak<TreeShared>,
    ) -> Self {
        Self::build(scheduler, features, Owner::Tree(tree), Some(NodeId::ROOT))
    }

    fn build(
        scheduler: &Scheduler,
        features: impl IntoIterator<Item = FeatureDecl>,
        owner: Owner,
        root_id: Option<NodeId>,
    ) -> Self {
        let features = features
            .into_iter()
            .map(|decl| (decl.id, Feature::new(decl, scheduler)))
            .collect();
        Self {
            inner: Arc::new(NodeInner {
                id: root_id.map_or_else(OnceLock::new, OnceLock::from),
                is_root: root_id.is_some(),
                scheduler: scheduler.clone(),
                state: Mutex::new(NodeState {
                    owner,
                    parent: None,
                    features,
                    was_attached: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.inner.state.lock()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Id within the tree, once the node was attached for the first time.
    pub fn id(&self) -> Option<NodeId> {
        self.inner.id.get().copied()
    }

    pub(crate) fn assign_id(&self, id: NodeId) -> Result<()> {
        self.inner
            .id
            .set(id)
            .map_err(|requested| Error::IdAlreadyAssigned {
                existing: self.id().unwrap_or(requested),
                requested,
            })
    }

    /// True for the root of a tree.
    pub fn is_root(&self) -> bool {
        self.inner.is_root
    }

    /// The scheduler this node's features report to.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// The parent node, if any.
    pub fn parent(&self) -> Option<StateNode> {
        self.lock()
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| StateNode { inner })
    }

    /// True if the parent chain reaches a tree root.
    pub fn is_attached(&self) -> bool {
        let mut cursor = self.clone();
        loop {
            if cursor.inner.is_root {
                return true;
            }
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }

    /// Direct child nodes, in feature order.
    pub fn children(&self) -> Vec<StateNode> {
        let state = self.lock();
        state
            .features
            .values()
            .flat_map(Feature::children)
            .cloned()
            .collect()
    }

    /// Declared features, in declaration order.
    pub fn features(&self) -> Vec<FeatureDecl> {
        self.lock().features.values().map(|f| f.decl).collect()
    }

    /// True if `feature` is declared on this node.
    pub fn has_feature(&self, feature: FeatureId) -> bool {
        self.lock().features.contains_key(&feature)
    }

    /// Reactive source id of `feature`.
    pub fn feature_source(&self, feature: FeatureId) -> Option<SourceId> {
        self.router(feature).map(|router| router.owner())
    }

    fn router(&self, feature: FeatureId) -> Option<FeatureRouter> {
        self.lock().features.get(&feature).map(|f| f.router.clone())
    }

    /// Run a read against `feature` and register the read with the current
    /// computation. Unknown features and kind mismatches read as `None`.
    fn read<R>(&self, feature: FeatureId, f: impl FnOnce(&Feature) -> Option<R>) -> Option<R> {
        let (result, router) = {
            let state = self.lock();
            let feat = state.features.get(&feature)?;
            (f(feat), feat.router.clone())
        };
        router.register_read();
        result
    }

    /// Value stored under `key` in a map feature.
    pub fn get(&self, feature: FeatureId, key: &str) -> Option<StateValue> {
        self.read(feature, |f| f.map().ok()?.get(key).cloned())
    }

    /// True if a map feature has `key`.
    pub fn contains_key(&self, feature: FeatureId, key: &str) -> bool {
        self.read(feature, |f| Some(f.map().ok()?.get(key).is_some()))
            .unwrap_or(false)
    }

    /// Keys of a map feature, in insertion order.
    pub fn keys(&self, feature: FeatureId) -> Vec<String> {
        self.read(feature, |f| Some(f.map().ok()?.keys().cloned().collect()))
            .unwrap_or_default()
    }

    /// Items of a list feature.
    pub fn list_items(&self, feature: FeatureId) -> Vec<StateValue> {
        self.read(feature, |f| Some(f.list().ok()?.items().to_vec()))
            .unwrap_or_default()
    }

    /// Length of a list feature.
    pub fn list_len(&self, feature: FeatureId) -> usize {
        self.read(feature, |f| Some(f.list().ok()?.len()))
            .unwrap_or(0)
    }

    /// Set `key` in a map feature, returning the previous value.
    ///
    /// Storing a node makes it a child of this node. The node must not have a
    /// parent yet; a node replaced or removed from its slot loses its parent.
    pub fn put(
        &self,
        feature: FeatureId,
        key: impl Into<String>,
        value: impl Into<StateValue>,
    ) -> Result<Option<StateValue>> {
        let key = key.into();
        let value = value.into();

        let unchanged_node = {
            let state = self.lock();
            let feat = state.feature(feature)?;
            let current = feat.map()?.get(&key);
            feat.check_value(&value)?;
            matches!((&value, current), (StateValue::Node(_), Some(current)) if *current == value)
        };
        if let (StateValue::Node(child), false) = (&value, unchanged_node) {
            self.check_adoptable(child)?;
        }

        let (previous, router) = {
            let mut state = self.lock();
            let feat = state.feature_mut(feature)?;
            let previous = feat.map_mut()?.put(key, value.clone());
            (previous, feat.router.clone())
        };

        if !unchanged_node {
            if let Some(StateValue::Node(old)) = &previous {
                self.unlink_child(old);
            }
            if let StateValue::Node(child) = &value {
                self.link_child(child)?;
            }
        }
        self.changed(feature, &router);
        Ok(previous)
    }

    /// Remove `key` from a map feature, returning the removed value.
    pub fn remove(&self, feature: FeatureId, key: &str) -> Result<Option<StateValue>> {
        let (removed, router) = {
            let mut state = self.lock();
            let feat = state.feature_mut(feature)?;
            let removed = feat.map_mut()?.remove(key);
            (removed, feat.router.clone())
        };
        match &removed {
            None => return Ok(None),
            Some(StateValue::Node(old)) => self.unlink_child(old),
            Some(StateValue::Value(_)) => {}
        }
        self.changed(feature, &router);
        Ok(removed)
    }

    /// Insert into a list feature at `index`.
    pub fn list_insert(
        &self,
        feature: FeatureId,
        index: usize,
        value: impl Into<StateValue>,
    ) -> Result<()> {
        let value = value.into();
        {
            let state = self.lock();
            let feat = state.feature(feature)?;
            feat.list()?.check_insert(feature, index)?;
            feat.check_value(&value)?;
        }
        if let StateValue::Node(child) = &value {
            self.check_adoptable(child)?;
        }

        let router = {
            let mut state = self.lock();
            let feat = state.feature_mut(feature)?;
            feat.list_mut()?.insert(index, value.clone());
            feat.router.clone()
        };

        if let StateValue::Node(child) = &value {
            self.link_child(child)?;
        }
        self.changed(feature, &router);
        Ok(())
    }

    /// Append to a list feature.
    pub fn list_push(&self, feature: FeatureId, value: impl Into<StateValue>) -> Result<()> {
        let len = {
            let state = self.lock();
            state.feature(feature)?.list()?.len()
        };
        self.list_insert(feature, len, value)
    }

    /// Remove the item at `index` from a list feature.
    pub fn list_remove(&self, feature: FeatureId, index: usize) -> Result<StateValue> {
        let (removed, router) = {
            let mut state = self.lock();
            let feat = state.feature_mut(feature)?;
            let list = feat.list_mut()?;
            list.check_remove(feature, index)?;
            (list.remove(index), feat.router.clone())
        };
        if let StateValue::Node(old) = &removed {
            self.unlink_child(old);
        }
        self.changed(feature, &router);
        Ok(removed)
    }

    /// Remove every item from a list feature.
    pub fn list_clear(&self, feature: FeatureId) -> Result<()> {
        let (removed, router) = {
            let mut state = self.lock();
            let feat = state.feature_mut(feature)?;
            let removed = feat.list_mut()?.clear();
            (removed, feat.router.clone())
        };
        let Some(removed) = removed else {
            return Ok(());
        };
        for old in removed.iter().filter_map(StateValue::as_node) {
            self.unlink_child(old);
        }
        self.changed(feature, &router);
        Ok(())
    }

    /// Listen for changes of `feature`.
    pub fn add_feature_listener<F>(&self, feature: FeatureId, listener: F) -> Result<Subscription>
    where
        F: Fn(&FeatureChangeEvent) + Send + Sync + 'static,
    {
        let router = self
            .router(feature)
            .ok_or(Error::UnknownFeature { feature })?;
        Ok(router.add_listener(listener))
    }

    /// Mark dirty, then notify readers of `feature`.
    fn changed(&self, feature: FeatureId, router: &FeatureRouter) {
        self.mark_dirty();
        router.notify(&FeatureChangeEvent {
            source: router.owner(),
            node: self.id(),
            feature,
        });
    }

    pub(crate) fn mark_dirty(&self) {
        let owner = self.lock().owner.clone();
        owner.mark_dirty(self);
    }

    /// This node and all its descendants, parents before children.
    fn subtree(&self) -> Vec<StateNode> {
        let mut nodes = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            let mut children = node.children();
            children.reverse();
            stack.extend(children);
            nodes.push(node);
        }
        nodes
    }

    fn check_adoptable(&self, child: &StateNode) -> Result<()> {
        if child.is_root() {
            return Err(Error::RootReparent);
        }
        let mut cursor = Some(self.clone());
        while let Some(node) = cursor {
            if node == *child {
                return Err(Error::CyclicAttach);
            }
            cursor = node.parent();
        }
        if child.parent().is_some() {
            return Err(Error::AlreadyParented);
        }

        // Ids are only valid within the tree that assigned them
        let target = self.lock().owner.clone();
        if let Owner::Tree(target) = &target {
            for node in child.subtree() {
                if let Owner::Tree(tree) = &node.lock().owner {
                    if !Weak::ptr_eq(tree, target) {
                        return Err(Error::ForeignTree { node: node.id() });
                    }
                }
            }
        }
        Ok(())
    }

    fn link_child(&self, child: &StateNode) -> Result<()> {
        child.lock().parent = Some(Arc::downgrade(&self.inner));
        let subtree = child.subtree();
        let owner = self.lock().owner.clone();
        adopt(&subtree, &owner)?;
        for node in &subtree {
            node.mark_dirty();
        }
        Ok(())
    }

    fn unlink_child(&self, child: &StateNode) {
        {
            let mut state = child.lock();
            let ours = state
                .parent
                .as_ref()
                .is_some_and(|parent| parent.as_ptr() == Arc::as_ptr(&self.inner));
            if ours {
                state.parent = None;
            }
        }
        for node in child.subtree() {
            node.mark_dirty();
        }
    }

    /// Emit this node's records for the current cycle and reset its tracking.
    ///
    /// Returns the attachment transition, if one happened. Records are built
    /// under the node lock and emitted after releasing it.
    pub(crate) fn collect_changes(
        &self,
        emit: &mut dyn FnMut(ChangeRecord),
    ) -> (bool, Option<Transition>) {
        let attached = self.is_attached();
        let mut records = Vec::new();
        let transition = {
            let mut state = self.lock();
            let was_attached = std::mem::replace(&mut state.was_attached, attached);
            let transition = match (was_attached, attached) {
                (false, true) => Some(Transition::Attached),
                (true, false) => Some(Transition::Detached),
                _ => None,
            };

            match self.id() {
                Some(node) => match transition {
                    Some(Transition::Attached) => {
                        records.push(ChangeRecord::Attach { node });
                        for feature in state.features.values() {
                            feature.collect_full(node, &mut records);
                        }
                    }
                    Some(Transition::Detached) => records.push(ChangeRecord::Detach { node }),
                    None if attached => {
                        for feature in state.features.values() {
                            feature.collect_pending(node, &mut records);
                        }
                    }
                    None => {}
                },
                None if attached => {
                    tracing::warn!("attached node without id, changes dropped");
                }
                None => {}
            }

            for feature in state.features.values_mut() {
                feature.reset();
            }
            transition
        };

        tracing::trace!(node = ?self.id(), ?transition, records = records.len(), "node collected");
        for record in records {
            emit(record);
        }
        (attached, transition)
    }
}

/// Move `nodes` to `target`, registering them when `target` is a tree.
///
/// Nodes that already belong to a tree keep it while parked under a
/// detached node. Dirty nodes of every temporary owner left behind are
/// merged into the target, so changes made while detached are collected in
/// their original order.
fn adopt(nodes: &[StateNode], target: &Owner) -> Result<()> {
    let mut left: Vec<Arc<TemporaryOwner>> = Vec::new();
    for node in nodes {
        let mut state = node.lock();
        let stays = state.owner.same(target)
            || matches!((&state.owner, target), (Owner::Tree(_), Owner::Temporary(_)));
        if stays {
            continue;
        }
        if let Owner::Temporary(old) = std::mem::replace(&mut state.owner, target.clone()) {
            if !left.iter().any(|known| Arc::ptr_eq(known, &old)) {
                left.push(old);
            }
        }
    }

    if let Owner::Tree(tree) = target {
        if let Some(tree) = tree.upgrade() {
            for node in nodes {
                tree.register_node(node)?;
            }
        }
    }

    for old in left {
        let dirty = old.take_dirty();
        cov_mark::hit!(temporary_dirty_merged);
        tracing::trace!(count = dirty.len(), "merging dirty nodes of a detached subtree");
        for node in &dirty {
            target.mark_dirty(node);
        }
    }
    Ok(())
}

impl PartialEq for StateNode {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for StateNode {}

impl Hash for StateNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for StateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNode")
            .field("id", &self.id())
            .field("root", &self.inner.is_root)
            .finish_non_exhaustive()
    }
}
