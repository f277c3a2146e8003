//! Content-addressed deduplication of literal values for one peer session.
//!
//! A pooled value is sent once, in the `constants` part of an outgoing
//! message, and referenced by key from then on. The key is derived from the
//! content only:
//!
//! 1. the value is converted to a `serde_json::Value`, whose objects keep
//!    their keys sorted, and serialized; equal content gives equal bytes;
//! 2. the bytes are hashed with blake3;
//! 3. the first few digest bytes are rendered as unpadded base64url.
//!
//! Collisions are possible in principle and accepted as negligible.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::Result;
use crate::hash::{FastHashSet, FastIndexMap};

/// Digest bytes kept in a key by default.
pub const DEFAULT_KEY_BYTES: usize = 8;

const MIN_KEY_BYTES: usize = 4;
const MAX_KEY_BYTES: usize = 32;

/// Key of a pooled constant.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConstantKey(String);

impl ConstantKey {
    /// The key as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConstantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ConstantKey> for Value {
    fn from(key: ConstantKey) -> Self {
        Value::String(key.0)
    }
}

/// Per-session constant pool.
pub struct ConstantPool {
    key_bytes: usize,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    /// Every key handed out this session
    known: FastHashSet<ConstantKey>,
    /// Keys not yet dumped, with their canonical value
    pending: FastIndexMap<ConstantKey, Value>,
}

impl ConstantPool {
    /// Pool with [`DEFAULT_KEY_BYTES`]-byte keys.
    pub fn new() -> Self {
        Self::with_key_bytes(DEFAULT_KEY_BYTES)
    }

    /// Pool keeping `key_bytes` digest bytes per key, clamped to 4..=32.
    pub fn with_key_bytes(key_bytes: usize) -> Self {
        let clamped = key_bytes.clamp(MIN_KEY_BYTES, MAX_KEY_BYTES);
        if clamped != key_bytes {
            tracing::warn!(requested = key_bytes, used = clamped, "constant key length clamped");
        }
        Self {
            key_bytes: clamped,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Digest bytes per key.
    pub fn key_bytes(&self) -> usize {
        self.key_bytes
    }

    /// Key for `value`, staging it for the next dump the first time it is seen.
    pub fn get_id<T: Serialize + ?Sized>(&self, value: &T) -> Result<ConstantKey> {
        let canonical = serde_json::to_value(value)?;
        let encoded = serde_json::to_vec(&canonical)?;
        let digest = blake3::hash(&encoded);
        let key = ConstantKey(URL_SAFE_NO_PAD.encode(&digest.as_bytes()[..self.key_bytes]));

        let mut state = self.state.lock();
        if state.known.insert(key.clone()) {
            tracing::trace!(%key, bytes = encoded.len(), "new constant staged");
            state.pending.insert(key.clone(), canonical);
        }
        Ok(key)
    }

    /// True if a key was handed out since the last dump.
    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Take the staged constants. They are never staged again.
    pub fn drain_pending(&self) -> FastIndexMap<ConstantKey, Value> {
        std::mem::take(&mut self.state.lock().pending)
    }

    /// Take the staged constants as a JSON object, in first-use order.
    pub fn dump(&self) -> Map<String, Value> {
        self.drain_pending()
            .into_iter()
            .map(|(key, value)| (key.0, value))
            .collect()
    }

    /// Number of keys handed out this session.
    pub fn len(&self) -> usize {
        self.state.lock().known.len()
    }

    /// True if no key was handed out yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `key` was handed out this session.
    pub fn contains(&self, key: &ConstantKey) -> bool {
        self.state.lock().known.contains(key)
    }
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConstantPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConstantPool")
            .field("key_bytes", &self.key_bytes)
            .field("known", &state.known.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn equal_content_gives_equal_keys() {
        let pool = ConstantPool::new();
        let a = pool.get_id(&json!({"b": 1, "a": [true, null]})).unwrap();
        let b = pool.get_id(&json!({"a": [true, null], "b": 1})).unwrap();
        assert_eq!(a, b);

        // Same content through a different Rust type
        let mut map = BTreeMap::new();
        map.insert("b", json!(1));
        map.insert("a", json!([true, null]));
        assert_eq!(pool.get_id(&map).unwrap(), a);

        assert_ne!(pool.get_id(&json!({"a": 1})).unwrap(), a);
    }

    #[test]
    fn keys_are_stable_across_pools() {
        let first = ConstantPool::new().get_id("hello").unwrap();
        let second = ConstantPool::new().get_id("hello").unwrap();
        assert_eq!(first, second);
        // 8 bytes of digest in unpadded base64
        assert_eq!(first.as_str().len(), 11);
    }

    #[test]
    fn each_key_is_dumped_once() {
        let pool = ConstantPool::new();
        let key = pool.get_id(&json!([1, 2, 3])).unwrap();
        pool.get_id(&json!([1, 2, 3])).unwrap();

        let dump = pool.dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[key.as_str()], json!([1, 2, 3]));
        assert!(!pool.has_pending());

        pool.get_id(&json!([1, 2, 3])).unwrap();
        assert!(!pool.has_pending());
        assert!(pool.dump().is_empty());
        assert!(pool.contains(&key));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn key_length_is_clamped() {
        assert_eq!(ConstantPool::with_key_bytes(1).key_bytes(), 4);
        assert_eq!(ConstantPool::with_key_bytes(64).key_bytes(), 32);
        let key = ConstantPool::with_key_bytes(32).get_id(&1).unwrap();
        assert_eq!(key.as_str().len(), 43);
    }
}
