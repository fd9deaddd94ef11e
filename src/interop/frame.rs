//! Per-call argument storage
//!
//! One `CallFrame` lives for exactly one native call. Every vector is
//! sized once in `new` and never grows afterwards: out-slots and the
//! pointer array hold addresses into them.

use super::trampoline::Trampoline;
use super::types::NativeArg;
use crate::ffi::NativeError;
use core::ffi::c_void;
use core::ptr;

pub(crate) struct CallFrame {
    /// Values handed to the callee, by native slot
    pub in_args: Vec<NativeArg>,
    /// Scratch cells written by the callee for Out/Inout slots
    pub out_args: Vec<NativeArg>,
    /// Inout values as converted, before the callee could replace them
    pub originals: Vec<NativeArg>,
    /// What libffi receives: one pointer per native slot
    pub ffi_args: Vec<*mut c_void>,
    /// Frame references to trampolines, by parameter index
    pub trampolines: Vec<Option<Trampoline>>,
    /// Native slot of parameter 0
    pub offset: usize,
    throws: bool,
    error: Box<*mut NativeError>,
}

impl CallFrame {
    pub fn new(n_params: usize, has_instance: bool, throws: bool) -> Self {
        let offset = usize::from(has_instance);
        let slots = offset + n_params + usize::from(throws);
        Self {
            in_args: vec![NativeArg::zeroed(); slots],
            out_args: vec![NativeArg::zeroed(); slots],
            originals: vec![NativeArg::zeroed(); slots],
            ffi_args: vec![ptr::null_mut(); slots],
            trampolines: (0..n_params).map(|_| None).collect(),
            offset,
            throws,
            error: Box::new(ptr::null_mut()),
        }
    }

    /// Native slot of parameter `index`
    #[inline]
    pub fn slot(&self, index: usize) -> usize {
        index + self.offset
    }

    /// Pass the slot's scratch cell by pointer
    pub fn set_out_pointer(&mut self, slot: usize) {
        let cell: *mut NativeArg = &mut self.out_args[slot];
        self.in_args[slot] = NativeArg::from_ptr(cell as *mut c_void);
    }

    /// Move a converted Inout value into its scratch cell and remember it
    pub fn inout_snapshot(&mut self, slot: usize, value: NativeArg) {
        self.out_args[slot] = value;
        self.originals[slot] = value;
        self.set_out_pointer(slot);
    }

    /// Point every libffi argument at its slot, and wire the error slot
    pub fn finalize_pointers(&mut self) {
        if self.throws {
            let last = self.in_args.len() - 1;
            *self.error = ptr::null_mut();
            let holder: *mut *mut NativeError = &mut *self.error;
            self.in_args[last] = NativeArg::from_ptr(holder as *mut c_void);
        }
        for (pointer, arg) in self.ffi_args.iter_mut().zip(self.in_args.iter_mut()) {
            *pointer = arg as *mut NativeArg as *mut c_void;
        }
    }

    /// Error written by the callee, if any; the frame forgets it
    pub fn take_error(&mut self) -> Option<*mut NativeError> {
        let error = core::mem::replace(&mut *self.error, ptr::null_mut());
        (!error.is_null()).then_some(error)
    }
}
