//! One peer session: scheduler, state tree and constant pool together.
//!
//! The transport layer drives a session in cycles. Each cycle it applies
//! incoming events to the tree (usually from inside computations or plain
//! application code), then calls [`SyncSession::sync`] and ships the returned
//! [`SyncMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::change::{ChangeRecord, encode_changes};
use crate::constant_pool::{ConstantPool, DEFAULT_KEY_BYTES};
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::tree::{FeatureDecl, StateNode, StateTree};

/// Builder for a [`SyncSession`].
///
/// Also deserializable, so hosts can embed it in their own configuration:
///
/// ```ignore
/// // session.toml
/// // constant_key_bytes = 12
/// // [[root_features]]
/// // id = 1
/// // kind = "node_list"
///
/// let config: SessionConfig = toml::from_str(&text)?;
/// let session = SyncSession::new(config);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    constant_key_bytes: usize,
    root_features: Vec<FeatureDecl>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    /// Create a new session builder with default settings.
    ///
    /// Defaults:
    /// - `constant_key_bytes`: 8
    /// - `root_features`: none
    pub fn new() -> Self {
        Self {
            constant_key_bytes: DEFAULT_KEY_BYTES,
            root_features: Vec::new(),
        }
    }

    /// Set how many digest bytes a constant key keeps (4 to 32).
    pub fn constant_key_bytes(mut self, bytes: usize) -> Self {
        self.constant_key_bytes = bytes;
        self
    }

    /// Declare a feature of the root node.
    pub fn root_feature(mut self, feature: FeatureDecl) -> Self {
        self.root_features.push(feature);
        self
    }

    /// Declare several features of the root node.
    pub fn root_features(mut self, features: impl IntoIterator<Item = FeatureDecl>) -> Self {
        self.root_features.extend(features);
        self
    }

    /// Build the session on a fresh scheduler.
    pub fn build(self) -> SyncSession {
        SyncSession::new(self)
    }
}

/// Payload of one sync cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SyncMessage {
    /// Encoded change records, in application order.
    pub changes: Vec<Value>,
    /// Constants referenced for the first time by `changes`.
    pub constants: Map<String, Value>,
}

impl SyncMessage {
    /// True if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.constants.is_empty()
    }
}

/// State of one peer session.
#[derive(Debug)]
pub struct SyncSession {
    scheduler: Scheduler,
    tree: StateTree,
    constants: ConstantPool,
}

impl SyncSession {
    /// Create a session with its own scheduler.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_scheduler(&Scheduler::new(), config)
    }

    /// Create a session on an existing scheduler.
    pub fn with_scheduler(scheduler: &Scheduler, config: SessionConfig) -> Self {
        Self {
            scheduler: scheduler.clone(),
            tree: StateTree::new(scheduler, config.root_features),
            constants: ConstantPool::with_key_bytes(config.constant_key_bytes),
        }
    }

    /// The session scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The session tree.
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Root of the session tree.
    pub fn root(&self) -> &StateNode {
        self.tree.root()
    }

    /// The session constant pool.
    pub fn constants(&self) -> &ConstantPool {
        &self.constants
    }

    /// Changes since the previous collection, unencoded.
    pub fn collect_changes(&self) -> Vec<ChangeRecord> {
        self.tree.collect_changes()
    }

    /// True if encoded records referenced constants that were not dumped yet.
    pub fn has_new_constants(&self) -> bool {
        self.constants.has_pending()
    }

    /// Constants not dumped yet. Call once per outgoing message.
    pub fn dump_constants(&self) -> Map<String, Value> {
        self.constants.dump()
    }

    /// Run one full cycle: flush pending computations, collect the tree
    /// changes, encode them and dump the constants they introduced.
    pub fn sync(&self) -> Result<SyncMessage> {
        self.scheduler.flush()?;
        let records = self.tree.collect_changes();
        let changes = encode_changes(&records, &self.constants)?;
        let constants = self.constants.dump();
        tracing::debug!(
            changes = changes.len(),
            constants = constants.len(),
            "sync cycle complete"
        );
        Ok(SyncMessage { changes, constants })
    }
}
