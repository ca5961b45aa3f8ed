//! Registry of live, in-process results.
//!
//! Values are kept as `Arc<dyn Any>` under string ids so a consumer sharing
//! the kernel's address space can fetch the original object instead of a
//! serialized rendering.

use std::any::Any;
use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashMap;

/// A stored value.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Id → value map of live results.
pub trait ResultRegistry: Send + Sync {
    /// Store `value` under `id`, replacing any previous value.
    fn put(&self, id: &str, value: AnyValue);

    /// Store `value` under a fresh id and return the id.
    fn generate(&self, value: AnyValue) -> String;

    /// Fetch the raw value under `id`.
    fn get_raw(&self, id: &str) -> Option<AnyValue>;

    /// Remove the value under `id`. Returns whether something was removed.
    fn remove(&self, id: &str) -> bool;

    /// Number of live entries.
    fn size(&self) -> usize;
}

impl<'a> dyn ResultRegistry + 'a {
    /// Fetch the value under `id` if it has type `T`.
    ///
    /// Absence and type mismatch both yield `None`.
    pub fn get<T: Any + Send + Sync>(&self, id: &str) -> Option<Arc<T>> {
        self.get_raw(id)?.downcast::<T>().ok()
    }
}

/// Registry backed by a locked hash map.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<FxHashMap<String, AnyValue>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultRegistry for InMemoryRegistry {
    fn put(&self, id: &str, value: AnyValue) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(id.to_string(), value);
    }

    fn generate(&self, value: AnyValue) -> String {
        // v4 ids do not collide in practice, and the "generated-" prefix keeps
        // them apart from caller-chosen ids.
        let id = format!("generated-{}", uuid::Uuid::new_v4());
        self.put(&id, value);
        id
    }

    fn get_raw(&self, id: &str) -> Option<AnyValue> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(id).cloned()
    }

    fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(id).is_some()
    }

    fn size(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Registry for sessions where nobody can reach raw objects.
///
/// Stores nothing; ids are still minted so rendering code stays uniform.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpRegistry;

impl ResultRegistry for NoOpRegistry {
    fn put(&self, _id: &str, _value: AnyValue) {}

    fn generate(&self, _value: AnyValue) -> String {
        format!("generated-{}", uuid::Uuid::new_v4())
    }

    fn get_raw(&self, _id: &str) -> Option<AnyValue> {
        None
    }

    fn remove(&self, _id: &str) -> bool {
        false
    }

    fn size(&self) -> usize {
        0
    }
}
