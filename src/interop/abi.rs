//! ABI handling - call interfaces and return-value widening
//!
//! A `Signature` is the prepared libffi call interface for one callable.
//! Return values come back in a register-sized slot; small integers are
//! widened by the ABI and must be narrowed again by declared type, and a
//! closure writing its result must widen the same way.

use super::descriptor::CallableDescriptor;
use super::types::{Direction, FfiType, NativeArg};
use core::ffi::c_void;
use libffi::middle::{Cif, Type};

impl FfiType {
    /// libffi type descriptor for this storage class
    pub fn libffi_type(self) -> Type {
        match self {
            Self::Void => Type::void(),
            Self::I8 => Type::i8(),
            Self::U8 => Type::u8(),
            Self::I16 => Type::i16(),
            Self::U16 => Type::u16(),
            Self::I32 => Type::i32(),
            Self::U32 => Type::u32(),
            Self::I64 => Type::i64(),
            Self::U64 => Type::u64(),
            Self::F32 => Type::f32(),
            Self::F64 => Type::f64(),
            Self::Pointer => Type::pointer(),
        }
    }
}

/// Register-sized landing area for a native return value
#[repr(C)]
pub union ReturnSlot {
    word: u64,
    float: f32,
    double: f64,
    ptr: *mut c_void,
}

impl ReturnSlot {
    #[inline]
    pub const fn zeroed() -> Self {
        Self { word: 0 }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self as *mut Self as *mut c_void
    }

    /// Narrow the widened value back to its declared class
    pub fn into_arg(self, ty: FfiType) -> NativeArg {
        let mut arg = NativeArg::zeroed();
        unsafe {
            match ty {
                FfiType::Void => {}
                FfiType::I8 => arg.i8 = self.word as i8,
                FfiType::U8 => arg.u8 = self.word as u8,
                FfiType::I16 => arg.i16 = self.word as i16,
                FfiType::U16 => arg.u16 = self.word as u16,
                FfiType::I32 => arg.i32 = self.word as i32,
                FfiType::U32 => arg.u32 = self.word as u32,
                FfiType::I64 => arg.i64 = self.word as i64,
                FfiType::U64 => arg.u64 = self.word,
                FfiType::F32 => arg.f32 = self.float,
                FfiType::F64 => arg.f64 = self.double,
                FfiType::Pointer => arg.ptr = self.ptr,
            }
        }
        arg
    }
}

/// Write a closure's result into libffi's return buffer
///
/// # Safety
/// `result` must be libffi's closure return buffer (at least 8 bytes).
pub unsafe fn store_closure_result(result: *mut u64, arg: &NativeArg, ty: FfiType) {
    match ty {
        FfiType::Void => {}
        FfiType::I8 => *result = arg.i8 as i64 as u64,
        FfiType::U8 => *result = u64::from(arg.u8),
        FfiType::I16 => *result = arg.i16 as i64 as u64,
        FfiType::U16 => *result = u64::from(arg.u16),
        FfiType::I32 => *result = arg.i32 as i64 as u64,
        FfiType::U32 => *result = u64::from(arg.u32),
        FfiType::I64 => *result = arg.i64 as u64,
        FfiType::U64 => *result = arg.u64,
        FfiType::F32 => *(result as *mut f32) = arg.f32,
        FfiType::F64 => *(result as *mut f64) = arg.f64,
        FfiType::Pointer => *(result as *mut *mut c_void) = arg.ptr,
    }
}

/// Prepared call interface for a callable
#[derive(Clone)]
pub struct Signature {
    cif: Cif,
    args: Vec<FfiType>,
    ret: FfiType,
}

impl Signature {
    pub fn new(args: Vec<FfiType>, ret: FfiType) -> Self {
        let cif = Cif::new(args.iter().map(|ty| ty.libffi_type()), ret.libffi_type());
        Self { cif, args, ret }
    }

    /// Native layout of `desc`: receiver first, then every declared
    /// parameter (outputs by pointer), then the error slot if it can throw
    pub fn for_callable(desc: &CallableDescriptor) -> Self {
        let mut args = Vec::with_capacity(native_arity(desc));
        if desc.instance().is_some() {
            args.push(FfiType::Pointer);
        }
        for arg in desc.args() {
            args.push(match arg.direction {
                Direction::In => arg.ty.ffi_type(),
                Direction::Out | Direction::InOut => FfiType::Pointer,
            });
        }
        if desc.can_throw() {
            args.push(FfiType::Pointer);
        }
        Self::new(args, desc.return_info().ty.ffi_type())
    }

    #[inline]
    pub fn cif(&self) -> &Cif {
        &self.cif
    }

    #[inline]
    pub fn arg_types(&self) -> &[FfiType] {
        &self.args
    }

    #[inline]
    pub fn return_type(&self) -> FfiType {
        self.ret
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signature")
            .field("args", &self.args)
            .field("ret", &self.ret)
            .finish()
    }
}

/// Native argument count: receiver + parameters + error slot
pub fn native_arity(desc: &CallableDescriptor) -> usize {
    usize::from(desc.instance().is_some()) + desc.n_args() + usize::from(desc.can_throw())
}
