//! Keep-alive set - wrappers held strongly on behalf of native code
//!
//! While a native object has owners besides its toggle reference, its
//! wrapper must survive script-side collection. Rooting stores a strong
//! `Arc<Wrapper>` here, keyed by object address.

use super::object::ObjectPtr;
use super::wrapper::Wrapper;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Root set keyed by object address (lock-free concurrent map)
pub(crate) struct KeepAlive {
    roots: DashMap<usize, (ObjectPtr, Arc<Wrapper>)>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self {
            roots: DashMap::with_capacity(128),
        }
    }

    /// Root `wrapper`; false if the object was already rooted
    #[inline]
    pub fn root(&self, object: ObjectPtr, wrapper: Arc<Wrapper>) -> bool {
        match self.roots.entry(object.addr()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert((object, wrapper));
                true
            }
        }
    }

    /// Unroot, handing back the strong hold
    #[inline]
    pub fn unroot(&self, object: ObjectPtr) -> Option<Arc<Wrapper>> {
        self.roots.remove(&object.addr()).map(|(_, (_, wrapper))| wrapper)
    }

    #[inline]
    pub fn is_rooted(&self, object: ObjectPtr) -> bool {
        self.roots.contains_key(&object.addr())
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Remove every entry
    pub fn drain(&self) -> Vec<(ObjectPtr, Arc<Wrapper>)> {
        let keys: Vec<usize> = self.roots.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.roots.remove(&key).map(|(_, entry)| entry))
            .collect()
    }
}
