//! Object lifecycle - C API for native objects
//!
//! Native libraries under test create, retain, and release bridge objects
//! through these entry points. Toggle notifications fire from inside
//! `bridge_object_ref`/`bridge_object_unref`, on whatever thread calls them.

use crate::gc::{NativeObject, ObjectPtr};
use core::ffi::c_char;
use std::ffi::CStr;

/// Allocate an object holding one reference owned by the caller
///
/// # Safety
/// - `class` may be null (anonymous class), otherwise NUL-terminated
#[no_mangle]
pub unsafe extern "C" fn bridge_object_new(class: *const c_char) -> *mut NativeObject {
    let class = if class.is_null() {
        std::borrow::Cow::Borrowed("Object")
    } else {
        CStr::from_ptr(class).to_string_lossy()
    };
    NativeObject::new(&class).into_raw()
}

/// Take a reference
///
/// # Safety
/// - Null-safe (no-op for null pointers)
/// - Object must be alive
#[no_mangle]
pub unsafe extern "C" fn bridge_object_ref(obj: *mut NativeObject) -> *mut NativeObject {
    if let Some(ptr) = ObjectPtr::from_raw(obj) {
        ptr.inc();
    }
    obj
}

/// Drop a reference, destroying the object at zero
///
/// # Safety
/// - Null-safe (no-op for null pointers)
/// - Caller must own the reference being dropped
#[no_mangle]
pub unsafe extern "C" fn bridge_object_unref(obj: *mut NativeObject) {
    if let Some(ptr) = ObjectPtr::from_raw(obj) {
        ptr.dec();
    }
}

/// Current reference count (for debugging/testing)
///
/// # Safety
/// - Returns 0 for null pointers
/// - Object must be alive
#[no_mangle]
pub unsafe extern "C" fn bridge_object_refcount(obj: *const NativeObject) -> u32 {
    match ObjectPtr::from_raw(obj as *mut NativeObject) {
        Some(ptr) => ptr.get().refcount(),
        None => 0,
    }
}
