//! Dynamic library loading and symbol resolution
//!
//! Thin wrapper around dlopen/dlsym used to resolve descriptor symbols.

use super::descriptor::CodeAddress;
use core::ffi::c_void;
use core::ptr::NonNull;
use std::ffi::{CStr, CString};

/// Handle to dynamically loaded library
pub struct Library {
    handle: NonNull<c_void>,
}

impl Library {
    /// Load library by name or path
    pub fn open(name: &str) -> Result<Self, LoadError> {
        let cname = CString::new(name).map_err(|_| LoadError::InvalidName)?;
        Self::open_raw(cname.as_ptr())
    }

    /// Symbols already linked into the running process
    pub fn this_process() -> Result<Self, LoadError> {
        Self::open_raw(core::ptr::null())
    }

    fn open_raw(name: *const libc::c_char) -> Result<Self, LoadError> {
        unsafe {
            let handle = libc::dlopen(name, libc::RTLD_NOW);
            NonNull::new(handle)
                .map(|handle| Self { handle })
                .ok_or_else(|| LoadError::LoadFailed(last_error()))
        }
    }

    /// Get function pointer by symbol name
    pub fn symbol(&self, name: &str) -> Result<CodeAddress, SymbolError> {
        let cname = CString::new(name).map_err(|_| SymbolError::InvalidName)?;

        let ptr = unsafe { libc::dlsym(self.handle.as_ptr(), cname.as_ptr()) };
        CodeAddress::new(ptr as *const c_void)
            .ok_or_else(|| SymbolError::NotFound(name.to_string()))
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}

unsafe impl Send for Library {}
unsafe impl Sync for Library {}

fn last_error() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "Unknown error".into()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// Library loading errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("Invalid library name")]
    InvalidName,
    #[error("Failed to load library: {0}")]
    LoadFailed(String),
}

/// Symbol lookup errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SymbolError {
    #[error("Invalid symbol name")]
    InvalidName,
    #[error("Symbol not found: {0}")]
    NotFound(String),
}
