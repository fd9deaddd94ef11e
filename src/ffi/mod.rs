//! C FFI - Stable ABI for native libraries talking back to the bridge
//!
//! Design: null-safe `extern "C"` entry points for
//! object lifecycle and reference counting, plus the error objects
//! written through a throwing callable's trailing error slot.

mod error;
mod object;

pub use error::{bridge_error_free, bridge_error_new, NativeError, SCRIPT_ERROR_DOMAIN};
pub use object::{bridge_object_new, bridge_object_ref, bridge_object_refcount, bridge_object_unref};

pub(crate) use error::{native_error_for, take_native_error};

use crate::logging::debug;
use core::ffi::c_char;

/// Free a string the bridge handed to native code
///
/// # Safety
/// - Null-safe
/// - `s` must come from the bridge's allocator (`malloc`)
#[no_mangle]
pub unsafe extern "C" fn bridge_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    debug!(event = "string_free", address = ?s);
    libc::free(s as *mut libc::c_void);
}
