//! Dynamic function calling
//!
//! `CallPrimitive` is the single point where control enters native code.
//! The invocation engine only ever calls through it, so embedders and
//! tests can observe or replace the transfer.

use super::abi::Signature;
use super::descriptor::CodeAddress;
use core::ffi::c_void;
use libffi::middle::CodePtr;

/// Performs the machine-level call
pub trait CallPrimitive {
    /// Call `code` with `args` (one pointer per native argument, each
    /// pointing at its value), writing the raw return into `result`
    ///
    /// # Safety
    /// `signature` must describe `code`, `args` must match it, and
    /// `result` must hold at least a register-sized value.
    unsafe fn call(
        &self,
        signature: &Signature,
        code: CodeAddress,
        result: *mut c_void,
        args: &mut [*mut c_void],
    );
}

/// Calls through libffi
#[derive(Debug, Default, Clone, Copy)]
pub struct LibffiCaller;

impl CallPrimitive for LibffiCaller {
    #[inline]
    unsafe fn call(
        &self,
        signature: &Signature,
        code: CodeAddress,
        result: *mut c_void,
        args: &mut [*mut c_void],
    ) {
        debug_assert_eq!(args.len(), signature.arg_types().len());
        let code = CodePtr(code.as_ptr() as *mut c_void);
        libffi::raw::ffi_call(
            signature.cif().as_raw_ptr(),
            Some(*code.as_safe_fun()),
            result,
            args.as_mut_ptr(),
        );
    }
}
