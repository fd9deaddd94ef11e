//! Script-side wrapper of a native object
//!
//! A wrapper is the script engine's view of one `NativeObject`. It keeps the
//! object alive through a toggle reference installed by `ToggleBridge`;
//! dropping the last `Arc<Wrapper>` is the wrapper's finalization.

use super::object::{NativeObject, ObjectPtr};
use super::toggle::{finalize_detached, ToggleCore};
use crate::error::{BridgeError, Result};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

pub struct Wrapper {
    object: AtomicPtr<NativeObject>,
    class: Arc<str>,
    unreachable: AtomicBool,
    bridge: Weak<ToggleCore>,
}

impl Wrapper {
    pub(crate) fn new(object: ObjectPtr, class: Arc<str>, bridge: Weak<ToggleCore>) -> Self {
        Self {
            object: AtomicPtr::new(object.as_raw()),
            class,
            unreachable: AtomicBool::new(false),
            bridge,
        }
    }

    #[inline]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// The wrapped object, unless the wrapper was disassociated
    #[inline]
    pub fn object(&self) -> Option<ObjectPtr> {
        unsafe { ObjectPtr::from_raw(self.object.load(Ordering::Acquire)) }
    }

    /// Like `object`, but as the error script code sees
    pub fn require_object(&self) -> Result<ObjectPtr> {
        self.object().ok_or_else(|| {
            BridgeError::Type(format!(
                "Object {} (wrapper {:p}) has been already deallocated - impossible to access it",
                self.class, self
            ))
        })
    }

    #[inline]
    pub fn is_associated(&self) -> bool {
        !self.object.load(Ordering::Acquire).is_null()
    }

    /// Marked by the collector as garbage in the current sweep
    #[inline]
    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unreachable(&self) {
        self.unreachable.store(true, Ordering::Release);
    }

    /// Forget the object without releasing anything
    pub(crate) fn detach(&self) -> Option<ObjectPtr> {
        unsafe { ObjectPtr::from_raw(self.object.swap(core::ptr::null_mut(), Ordering::AcqRel)) }
    }
}

impl Drop for Wrapper {
    fn drop(&mut self) {
        let Some(object) = self.detach() else {
            return;
        };

        let this = self as *const Wrapper;
        match self.bridge.upgrade() {
            Some(core) => core.finalize_wrapper(object, this),
            None => unsafe { finalize_detached(object, this) },
        }
    }
}

impl std::fmt::Debug for Wrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wrapper")
            .field("class", &self.class)
            .field("object", &self.object.load(Ordering::Relaxed))
            .field("unreachable", &self.is_unreachable())
            .finish()
    }
}
