//! Error types for the reactive core and the state tree.
//!
//! Contract violations by calling code (assigning a node id twice, firing an
//! event through the wrong router, malformed tree edits) are reported as
//! variants of [`Error`] from the operation that caused them. Failures of user
//! recompute bodies travel as [`Error::Recompute`] out of
//! [`Scheduler::flush`](crate::Scheduler::flush).

use thiserror::Error;

use crate::router::SourceId;
use crate::tree::{FeatureId, FeatureKind, NodeId};

/// Boxed error produced by user code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A state node already carries an id.
    #[error("state node already has id {existing}, refusing to assign {requested}")]
    IdAlreadyAssigned {
        /// Id the node already has.
        existing: NodeId,
        /// Id that was about to be assigned.
        requested: NodeId,
    },

    /// An event was fired through a router that does not own its source.
    #[error("event from source {event_source} fired through the router of {router_owner}")]
    ForeignEventSource {
        /// Source the event declares.
        event_source: SourceId,
        /// Owner of the router it was fired through.
        router_owner: SourceId,
    },

    /// The node has no feature with this id.
    #[error("feature {feature} is not declared on this node")]
    UnknownFeature {
        /// Requested feature.
        feature: FeatureId,
    },

    /// A map operation was used on a list feature or the other way around.
    #[error("feature {feature} is a {actual} feature, expected a {expected} feature")]
    FeatureKindMismatch {
        /// Requested feature.
        feature: FeatureId,
        /// Kind the operation needs.
        expected: FeatureKind,
        /// Kind the feature was declared with.
        actual: FeatureKind,
    },

    /// The value cannot be stored in this feature.
    #[error("feature {feature} does not accept {found} values")]
    UnsupportedValue {
        /// Target feature.
        feature: FeatureId,
        /// Short description of the rejected value.
        found: &'static str,
    },

    /// A list index was past the end of the list.
    #[error("index {index} is out of bounds for feature {feature} of length {len}")]
    IndexOutOfBounds {
        /// Target feature.
        feature: FeatureId,
        /// Offending index.
        index: usize,
        /// Current list length.
        len: usize,
    },

    /// The node is already the child of another node.
    #[error("state node already has a parent")]
    AlreadyParented,

    /// The node would become its own ancestor.
    #[error("attaching the node here would make it its own ancestor")]
    CyclicAttach,

    /// The tree root cannot be given a parent.
    #[error("the tree root cannot be attached under another node")]
    RootReparent,

    /// The node, or a node below it, belongs to a different state tree.
    #[error("state node {node:?} belongs to another state tree")]
    ForeignTree {
        /// Id the node got from its own tree.
        node: Option<NodeId>,
    },

    /// A constant could not be converted to its canonical encoding.
    #[error("constant could not be encoded")]
    ConstantEncoding(#[from] serde_json::Error),

    /// A recompute body or flush listener failed.
    #[error("recompute failed")]
    Recompute(#[source] BoxError),
}

impl Error {
    /// Wrap an error raised by a recompute body.
    pub fn recompute(err: impl Into<BoxError>) -> Self {
        Error::Recompute(err.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
