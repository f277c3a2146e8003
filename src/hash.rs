//! Deterministic hashing for the crate's internal collections.
//!
//! Everything hashed here is a small integer id or a pointer identity (dirty
//! node sets, dependency maps, the node registry), so HashDoS resistance is
//! not a concern. `FastHashBuilder` is zero-sized and uses foldhash with a
//! fixed seed, and the aliases below pin the hasher for the ordered
//! collections used throughout the crate.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized BuildHasher that uses foldhash with a fixed seed.
///
/// The fixed seed means all instances produce identical hash values, which
/// keeps iteration order of the non-indexed collections stable between runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x517cc1b727220a95).build_hasher()
    }
}

/// Insertion-ordered set. Dirty sets rely on the ordering.
pub type FastIndexSet<T> = indexmap::IndexSet<T, FastHashBuilder>;

/// Insertion-ordered map.
pub type FastIndexMap<K, V> = indexmap::IndexMap<K, V, FastHashBuilder>;

/// Unordered set for membership checks only.
pub type FastHashSet<T> = std::collections::HashSet<T, FastHashBuilder>;
