//! Refcounted native objects with toggle references
//!
//! A toggle reference is a reference with a notification: the observer is
//! told whenever the object's count crosses between 1 (only the toggle
//! reference remains) and 2 (someone else holds the object too).
//! Hot path operations are always inlined.

use super::wrapper::Wrapper;
use crate::logging::trace;
use core::ops::Deref;
use core::ptr::NonNull;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Receives toggle notifications from any thread
pub trait ToggleObserver: Send + Sync {
    /// `is_last_ref` is true when the toggle reference became the only one
    fn toggled(&self, object: ObjectPtr, is_last_ref: bool);
}

/// Association between a native object and its script wrapper
#[derive(Debug, Default)]
pub enum Binding {
    #[default]
    Empty,
    Bound(Weak<Wrapper>),
    /// The wrapper was finalized while the object survived
    Poisoned,
}

impl Binding {
    /// Whether this binding points at `wrapper`
    #[inline]
    pub fn is_bound_to(&self, wrapper: *const Wrapper) -> bool {
        matches!(self, Self::Bound(weak) if weak.as_ptr() == wrapper)
    }
}

/// Direction of a toggle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Up,
    Down,
}

impl Toggle {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

/// Queued-task flags, shared with the tasks themselves
#[derive(Debug, Default)]
pub struct ToggleState {
    up_queued: AtomicBool,
    down_queued: AtomicBool,
}

impl ToggleState {
    #[inline]
    fn flag(&self, toggle: Toggle) -> &AtomicBool {
        match toggle {
            Toggle::Up => &self.up_queued,
            Toggle::Down => &self.down_queued,
        }
    }

    #[inline]
    pub fn is_queued(&self, toggle: Toggle) -> bool {
        self.flag(toggle).load(Ordering::Acquire)
    }

    /// Set the flag; false if it was already set
    #[inline]
    pub fn mark_queued(&self, toggle: Toggle) -> bool {
        !self.flag(toggle).swap(true, Ordering::AcqRel)
    }

    /// Clear the flag, returning whether it was set
    #[inline]
    pub fn take(&self, toggle: Toggle) -> bool {
        self.flag(toggle).swap(false, Ordering::AcqRel)
    }
}

type Finalizer = Box<dyn FnOnce() + Send>;

/// Refcounted native object
pub struct NativeObject {
    refcount: AtomicU32,
    class: Arc<str>,
    toggle: RwLock<Option<Arc<dyn ToggleObserver>>>,
    binding: Mutex<Binding>,
    state: Arc<ToggleState>,
    finalizer: Mutex<Option<Finalizer>>,
}

impl NativeObject {
    /// Allocate an object holding one reference owned by the caller
    pub fn new(class: &str) -> ObjectRef {
        let object = Box::new(Self {
            refcount: AtomicU32::new(1),
            class: class.into(),
            toggle: RwLock::new(None),
            binding: Mutex::new(Binding::Empty),
            state: Arc::new(ToggleState::default()),
            finalizer: Mutex::new(None),
        });

        let ptr = ObjectPtr(NonNull::from(Box::leak(object)));
        trace!(event = "object_new", address = ?ptr.as_raw(), class = class);
        ObjectRef { ptr }
    }

    #[inline]
    pub fn class(&self) -> &str {
        &self.class
    }

    pub(crate) fn class_name(&self) -> Arc<str> {
        self.class.clone()
    }

    /// Current reference count (for debugging)
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Run `f` right before the object is freed
    pub fn set_finalizer(&self, f: impl FnOnce() + Send + 'static) {
        *self.finalizer.lock() = Some(Box::new(f));
    }

    pub fn has_toggle_ref(&self) -> bool {
        self.toggle.read().is_some()
    }

    pub(crate) fn binding(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock()
    }

    pub(crate) fn toggle_state(&self) -> &Arc<ToggleState> {
        &self.state
    }

    fn observer(&self) -> Option<Arc<dyn ToggleObserver>> {
        self.toggle.read().clone()
    }
}

/// Borrowed pointer to a live `NativeObject`
///
/// Validity is the caller's contract: whoever creates one must hold, or be
/// about to take, a reference on the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectPtr(NonNull<NativeObject>);

// The pointee is only mutated through atomics and locks
unsafe impl Send for ObjectPtr {}
unsafe impl Sync for ObjectPtr {}

impl ObjectPtr {
    /// # Safety
    /// `ptr` must be null or point to a live object.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut NativeObject) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    #[inline]
    pub fn as_raw(self) -> *mut NativeObject {
        self.0.as_ptr()
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// The object must still be alive for `'a`.
    #[inline]
    pub(crate) unsafe fn get<'a>(self) -> &'a NativeObject {
        &*self.0.as_ptr()
    }

    /// Take a reference (hot path, always inlined)
    ///
    /// # Safety
    /// The object must be alive.
    #[inline(always)]
    pub unsafe fn inc(self) {
        let obj = self.get();
        let old = obj.refcount.fetch_add(1, Ordering::Relaxed);

        debug_assert!(old > 0 && old < u32::MAX, "refcount out of range");

        if old == 1 {
            if let Some(observer) = obj.observer() {
                observer.toggled(self, false);
            }
        }
    }

    /// Drop a reference, destroying the object at zero
    ///
    /// # Safety
    /// The caller must own the reference being dropped.
    #[inline(always)]
    pub unsafe fn dec(self) {
        let obj = self.get();
        let old = obj.refcount.fetch_sub(1, Ordering::Release);

        debug_assert!(old > 0, "refcount underflow");

        match old {
            1 => {
                // Synchronize with all previous decrements
                fence(Ordering::Acquire);
                destroy(self);
            }
            2 => {
                if let Some(observer) = obj.observer() {
                    observer.toggled(self, true);
                }
            }
            _ => {}
        }
    }

    /// Install a toggle reference owned by `observer`
    ///
    /// # Safety
    /// The object must be alive and have no toggle reference yet.
    pub(crate) unsafe fn add_toggle_ref(self, observer: Arc<dyn ToggleObserver>) {
        let obj = self.get();
        // Count first so installing the observer never notifies
        obj.refcount.fetch_add(1, Ordering::Relaxed);
        let previous = obj.toggle.write().replace(observer);
        debug_assert!(previous.is_none(), "object already has a toggle reference");
    }

    /// Drop the toggle reference; the object may be freed
    ///
    /// # Safety
    /// The toggle reference must be held.
    pub(crate) unsafe fn remove_toggle_ref(self) {
        let obj = self.get();
        if obj.toggle.write().take().is_some() {
            self.dec();
        }
    }
}

#[cold]
#[inline(never)]
unsafe fn destroy(ptr: ObjectPtr) {
    trace!(event = "object_destroy", address = ?ptr.as_raw());

    let object = Box::from_raw(ptr.as_raw());
    let finalizer = object.finalizer.lock().take();
    if let Some(finalize) = finalizer {
        finalize();
    }
    drop(object);
}

/// Owned strong reference to a `NativeObject`
pub struct ObjectRef {
    ptr: ObjectPtr,
}

impl ObjectRef {
    /// Take a new reference on `ptr`
    ///
    /// # Safety
    /// The object must be alive.
    #[inline]
    pub unsafe fn retain(ptr: ObjectPtr) -> Self {
        ptr.inc();
        Self { ptr }
    }

    /// Adopt a reference the caller already owns
    ///
    /// # Safety
    /// The caller must own one reference, which moves into the result.
    #[inline]
    pub unsafe fn from_raw(ptr: ObjectPtr) -> Self {
        Self { ptr }
    }

    /// Give up ownership without dropping the reference
    #[inline]
    pub fn into_raw(self) -> *mut NativeObject {
        let ptr = self.ptr.as_raw();
        core::mem::forget(self);
        ptr
    }

    #[inline]
    pub fn as_ptr(&self) -> ObjectPtr {
        self.ptr
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.refcount()
    }
}

impl Clone for ObjectRef {
    #[inline]
    fn clone(&self) -> Self {
        unsafe { Self::retain(self.ptr) }
    }
}

impl Drop for ObjectRef {
    #[inline]
    fn drop(&mut self) {
        unsafe { self.ptr.dec() }
    }
}

impl Deref for ObjectRef {
    type Target = NativeObject;

    #[inline]
    fn deref(&self) -> &NativeObject {
        unsafe { self.ptr.get() }
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectRef({} @ {:p}, count {})", self.class(), self.ptr.as_raw(), self.count())
    }
}
