//! Native error channel - the trailing error slot of throwing callables

use crate::error::BridgeError;
use core::ffi::c_char;
use std::ffi::CStr;

/// Domain stamped on errors raised by script callbacks
pub const SCRIPT_ERROR_DOMAIN: u32 = 0x5343;

/// Error reported through a callable's error slot
#[repr(C)]
#[derive(Debug)]
pub struct NativeError {
    pub domain: u32,
    pub code: i32,
    /// NUL-terminated, owned by the error
    pub message: *mut c_char,
}

/// Allocate an error
///
/// # Safety
/// - `message` may be null, otherwise a NUL-terminated string
/// - Release with `bridge_error_free`
#[no_mangle]
pub unsafe extern "C" fn bridge_error_new(domain: u32, code: i32, message: *const c_char) -> *mut NativeError {
    let message = if message.is_null() {
        core::ptr::null_mut()
    } else {
        libc::strdup(message)
    };
    Box::into_raw(Box::new(NativeError { domain, code, message }))
}

/// Free an error from `bridge_error_new`
///
/// # Safety
/// - Null-safe
/// - Must not be freed twice
#[no_mangle]
pub unsafe extern "C" fn bridge_error_free(error: *mut NativeError) {
    if error.is_null() {
        return;
    }
    let error = Box::from_raw(error);
    libc::free(error.message as *mut libc::c_void);
}

/// Convert and free a reported error
///
/// # Safety
/// `error` must come from `bridge_error_new` and not be used afterwards.
pub(crate) unsafe fn take_native_error(error: *mut NativeError) -> BridgeError {
    let (domain, code) = ((*error).domain, (*error).code);
    let message = if (*error).message.is_null() {
        String::from("unknown error")
    } else {
        CStr::from_ptr((*error).message).to_string_lossy().into_owned()
    };
    bridge_error_free(error);
    BridgeError::Native { domain, code, message }
}

/// Allocate the native form of a script-side failure
pub(crate) fn native_error_for(err: &BridgeError) -> *mut NativeError {
    let (domain, code) = match err {
        BridgeError::Native { domain, code, .. } => (*domain, *code),
        _ => (SCRIPT_ERROR_DOMAIN, 0),
    };
    let message = err.to_string().replace('\0', " ");
    let message = std::ffi::CString::new(message).unwrap_or_default();
    unsafe { bridge_error_new(domain, code, message.as_ptr()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_roundtrip_through_slot() {
        let message = std::ffi::CString::new("file not found").unwrap();
        let raw = unsafe { bridge_error_new(7, 2, message.as_ptr()) };

        match unsafe { take_native_error(raw) } {
            BridgeError::Native { domain, code, message } => {
                assert_eq!(domain, 7);
                assert_eq!(code, 2);
                assert_eq!(message, "file not found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_script_error_domain() {
        let raw = native_error_for(&BridgeError::Thrown("boom".into()));
        unsafe {
            assert_eq!((*raw).domain, SCRIPT_ERROR_DOMAIN);
            assert_eq!(CStr::from_ptr((*raw).message).to_str().unwrap(), "boom");
            bridge_error_free(raw);
        }
    }

    #[test]
    fn test_null_message() {
        let raw = unsafe { bridge_error_new(1, 1, core::ptr::null()) };
        let err = unsafe { take_native_error(raw) };
        assert_eq!(err.to_string(), "unknown error");
    }
}
