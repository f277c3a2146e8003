#![warn(missing_docs)]

//! Automatic dependency tracking and minimal state-tree diffs.
//!
//! Server-side application logic declares computations that read shared
//! state; the crate records what each computation read and runs it again,
//! lazily and once per flush, after any of it changed. Next to that engine
//! sits a tree of state nodes whose mutations are captured per cycle as a
//! short, ordered list of change records for a remote renderer.
//!
//! # Quick Start
//!
//! ```ignore
//! use statesync::{FeatureDecl, FeatureId, ReactiveValue, SessionConfig, StateNode};
//! use serde_json::json;
//!
//! const PROPS: FeatureId = FeatureId::new(1);
//! const CHILDREN: FeatureId = FeatureId::new(2);
//!
//! let session = SessionConfig::new()
//!     .root_feature(FeatureDecl::node_list(CHILDREN))
//!     .build();
//!
//! let label = StateNode::new(session.scheduler(), [FeatureDecl::map(PROPS)]);
//! session.root().list_push(CHILDREN, &label)?;
//!
//! // Keep the label in sync with a counter
//! let count = ReactiveValue::new(session.scheduler(), 0);
//! let (c, l) = (count.clone(), label.clone());
//! session.scheduler().run_when_dependencies_change(move || {
//!     l.put(PROPS, "text", json!(format!("clicked {} times", c.get())))?;
//!     Ok(())
//! });
//!
//! let message = session.sync()?;   // attach root, attach label, text
//! count.set(1);
//! count.set(2);
//! let message = session.sync()?;   // one put: "clicked 2 times"
//! ```
//!
//! # Core Types
//!
//! - [`Scheduler`] - Per-session context: current computation, flush queues.
//! - [`Computation`] - Re-runs its body when something it read changed.
//! - [`ReactiveEventRouter`] - Building block for reactive sources.
//! - [`ReactiveValue`] - A single reactive cell.
//! - [`StateTree`] / [`StateNode`] - Hierarchical state with change capture.
//! - [`ChangeRecord`] - One captured change, see [`ChangeRecord::encode`].
//! - [`ConstantPool`] - Sends repeated literals once per session.
//! - [`SyncSession`] - All of the above for one peer.
//!
//! # Flushing
//!
//! ```ignore
//! scheduler.flush()?;                 // Run pending recomputes now
//! scheduler.has_pending_work();       // Check if anything is queued
//! scheduler.untracked(|| { ... });    // Run without tracking dependencies
//! ```
//!
//! A scheduler is not meant to be driven by several threads at once. All
//! handles are `Send + Sync`, but one session runs one flush cycle at a time.

mod change;
mod computation;
mod constant_pool;
mod error;
mod hash;
mod listener;
mod router;
mod scheduler;
mod session;
mod tree;
mod value;

// Reactive core
pub use computation::{Computation, ComputationStatus, InvalidateEvent, RecomputeBody};
pub use listener::{ListenerKey, ListenerRegistry, Subscription};
pub use router::{
    ChangeListener, ReactiveEvent, ReactiveEventRouter, ReactiveSource, SourceId,
    ValueChangeEvent,
};
pub use scheduler::{EventCollector, FlushListener, Scheduler};
pub use value::ReactiveValue;

// State tree and change capture
pub use change::{ChangeRecord, ChangeType, ListItems, RecordValue, encode_changes};
pub use constant_pool::{ConstantKey, ConstantPool, DEFAULT_KEY_BYTES};
pub use tree::{
    FeatureChangeEvent, FeatureDecl, FeatureId, FeatureKind, NodeId, StateNode, StateTree,
    StateValue,
};

// Sessions
pub use session::{SessionConfig, SyncMessage, SyncSession};

pub use error::{BoxError, Error, Result};

#[cfg(test)]
mod tests;
