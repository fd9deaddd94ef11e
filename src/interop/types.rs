//! Type definitions for reflected callables
//!
//! `TypeTag` is the closed set of reflected types the bridge understands;
//! every conversion site matches it exhaustively. `FfiType` is the machine
//! storage class a tag occupies in a native argument slot.

use super::descriptor::CallableDescriptor;
use core::ffi::c_void;
use std::fmt;
use std::sync::Arc;

/// Machine storage class of a native argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FfiType {
    Void,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Pointer,
}

impl FfiType {
    /// Get size of type in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Void => 0,
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Pointer => core::mem::size_of::<*mut c_void>(),
        }
    }
}

/// Layout of a struct or union crossing the boundary by pointer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructInfo {
    pub name: Arc<str>,
    pub size: usize,
    /// Registered with a copy function; ownership can be transferred
    pub boxed: bool,
}

impl StructInfo {
    pub fn plain(name: &str, size: usize) -> Self {
        Self { name: name.into(), size, boxed: false }
    }

    pub fn boxed(name: &str, size: usize) -> Self {
        Self { name: name.into(), size, boxed: true }
    }
}

/// C array shape
#[derive(Debug, Clone)]
pub struct ArrayInfo {
    pub element: Box<TypeTag>,
    /// Index of the sibling parameter carrying the length
    pub length: Option<usize>,
    pub zero_terminated: bool,
    pub fixed_size: Option<usize>,
}

impl ArrayInfo {
    /// Array whose length travels in another parameter
    pub fn with_length(element: TypeTag, length: usize) -> Self {
        Self { element: Box::new(element), length: Some(length), zero_terminated: false, fixed_size: None }
    }

    /// NULL/zero-terminated array
    pub fn zero_terminated(element: TypeTag) -> Self {
        Self { element: Box::new(element), length: None, zero_terminated: true, fixed_size: None }
    }

    pub fn fixed(element: TypeTag, size: usize) -> Self {
        Self { element: Box::new(element), length: None, zero_terminated: false, fixed_size: Some(size) }
    }
}

/// Reflected type of a parameter or return value
#[derive(Debug, Clone)]
pub enum TypeTag {
    Void,
    /// C int used as a truth value
    Boolean,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    /// NUL-terminated UTF-8 string
    Utf8,
    /// Opaque `void*`
    Pointer,
    Enum,
    Flags,
    Struct(StructInfo),
    Union(StructInfo),
    /// Refcounted native object of the named class
    Object(Arc<str>),
    Callback(Arc<CallableDescriptor>),
    DestroyNotify,
    Array(ArrayInfo),
}

impl TypeTag {
    /// Storage class of a value of this type
    pub fn ffi_type(&self) -> FfiType {
        match self {
            Self::Void => FfiType::Void,
            Self::Boolean | Self::Int32 | Self::Enum => FfiType::I32,
            Self::Int8 => FfiType::I8,
            Self::UInt8 => FfiType::U8,
            Self::Int16 => FfiType::I16,
            Self::UInt16 => FfiType::U16,
            Self::UInt32 | Self::Flags => FfiType::U32,
            Self::Int64 => FfiType::I64,
            Self::UInt64 => FfiType::U64,
            Self::Float => FfiType::F32,
            Self::Double => FfiType::F64,
            Self::Utf8
            | Self::Pointer
            | Self::Struct(_)
            | Self::Union(_)
            | Self::Object(_)
            | Self::Callback(_)
            | Self::DestroyNotify
            | Self::Array(_) => FfiType::Pointer,
        }
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Callback-shaped type the invocation engine turns into a trampoline
    #[inline]
    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }

    pub fn array(&self) -> Option<&ArrayInfo> {
        match self {
            Self::Array(info) => Some(info),
            _ => None,
        }
    }

    /// Name used in error messages
    pub fn name(&self) -> &str {
        match self {
            Self::Void => "void",
            Self::Boolean => "gboolean",
            Self::Int8 => "gint8",
            Self::UInt8 => "guint8",
            Self::Int16 => "gint16",
            Self::UInt16 => "guint16",
            Self::Int32 => "gint32",
            Self::UInt32 => "guint32",
            Self::Int64 => "gint64",
            Self::UInt64 => "guint64",
            Self::Float => "gfloat",
            Self::Double => "gdouble",
            Self::Utf8 => "utf8",
            Self::Pointer => "gpointer",
            Self::Enum => "enum",
            Self::Flags => "flags",
            Self::Struct(info) | Self::Union(info) => &info.name,
            Self::Object(class) => class,
            Self::Callback(desc) => desc.name(),
            Self::DestroyNotify => "GDestroyNotify",
            Self::Array(_) => "array",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side produces a parameter's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    #[inline]
    pub const fn is_input(self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    #[inline]
    pub const fn is_output(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// Ownership handed across the boundary with a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Nothing,
    Container,
    Everything,
}

/// Validity of a callback registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Valid for the duration of the call
    PerCall,
    /// Valid until the paired destroy-notify fires
    Notified,
    /// Invoked once, at some later point
    Async,
}

impl Scope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PerCall => "call",
            Self::Notified => "notified",
            Self::Async => "async",
        }
    }
}

/// Native argument slot (untagged union)
#[repr(C)]
pub union NativeArg {
    pub i8: i8,
    pub i16: i16,
    pub i32: i32,
    pub i64: i64,
    pub u8: u8,
    pub u16: u16,
    pub u32: u32,
    pub u64: u64,
    pub f32: f32,
    pub f64: f64,
    pub ptr: *mut c_void,
}

impl NativeArg {
    /// All-zero slot
    #[inline]
    pub const fn zeroed() -> Self {
        Self { u64: 0 }
    }

    /// Create from pointer
    #[inline]
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        let mut arg = Self::zeroed();
        arg.ptr = ptr;
        arg
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        unsafe { self.ptr }
    }

    /// Read a value of storage class `ty` from `src`
    ///
    /// # Safety
    /// `src` must point to a readable value of that class.
    pub unsafe fn load(src: *const c_void, ty: FfiType) -> Self {
        let mut arg = Self::zeroed();
        match ty {
            FfiType::Void => {}
            FfiType::I8 => arg.i8 = *(src as *const i8),
            FfiType::U8 => arg.u8 = *(src as *const u8),
            FfiType::I16 => arg.i16 = *(src as *const i16),
            FfiType::U16 => arg.u16 = *(src as *const u16),
            FfiType::I32 => arg.i32 = *(src as *const i32),
            FfiType::U32 => arg.u32 = *(src as *const u32),
            FfiType::I64 => arg.i64 = *(src as *const i64),
            FfiType::U64 => arg.u64 = *(src as *const u64),
            FfiType::F32 => arg.f32 = *(src as *const f32),
            FfiType::F64 => arg.f64 = *(src as *const f64),
            FfiType::Pointer => arg.ptr = *(src as *const *mut c_void),
        }
        arg
    }

    /// Write this value as storage class `ty` to `dst`
    ///
    /// # Safety
    /// `dst` must point to writable storage of that class.
    pub unsafe fn store(&self, dst: *mut c_void, ty: FfiType) {
        match ty {
            FfiType::Void => {}
            FfiType::I8 => *(dst as *mut i8) = self.i8,
            FfiType::U8 => *(dst as *mut u8) = self.u8,
            FfiType::I16 => *(dst as *mut i16) = self.i16,
            FfiType::U16 => *(dst as *mut u16) = self.u16,
            FfiType::I32 => *(dst as *mut i32) = self.i32,
            FfiType::U32 => *(dst as *mut u32) = self.u32,
            FfiType::I64 => *(dst as *mut i64) = self.i64,
            FfiType::U64 => *(dst as *mut u64) = self.u64,
            FfiType::F32 => *(dst as *mut f32) = self.f32,
            FfiType::F64 => *(dst as *mut f64) = self.f64,
            FfiType::Pointer => *(dst as *mut *mut c_void) = self.ptr,
        }
    }

    /// Interpret an integer slot as an array length
    pub fn to_length(&self, ty: FfiType) -> usize {
        unsafe {
            match ty {
                FfiType::I8 => self.i8.max(0) as usize,
                FfiType::U8 => self.u8 as usize,
                FfiType::I16 => self.i16.max(0) as usize,
                FfiType::U16 => self.u16 as usize,
                FfiType::I32 => self.i32.max(0) as usize,
                FfiType::U32 => self.u32 as usize,
                FfiType::I64 => self.i64.max(0) as usize,
                FfiType::U64 => self.u64 as usize,
                FfiType::Void | FfiType::F32 | FfiType::F64 | FfiType::Pointer => 0,
            }
        }
    }

    /// Integer slot holding `len`, or `None` if `ty` cannot represent it
    pub fn from_length(len: usize, ty: FfiType) -> Option<Self> {
        let mut arg = Self::zeroed();
        match ty {
            FfiType::I8 => arg.i8 = i8::try_from(len).ok()?,
            FfiType::U8 => arg.u8 = u8::try_from(len).ok()?,
            FfiType::I16 => arg.i16 = i16::try_from(len).ok()?,
            FfiType::U16 => arg.u16 = u16::try_from(len).ok()?,
            FfiType::I32 => arg.i32 = i32::try_from(len).ok()?,
            FfiType::U32 => arg.u32 = u32::try_from(len).ok()?,
            FfiType::I64 => arg.i64 = i64::try_from(len).ok()?,
            FfiType::U64 => arg.u64 = u64::try_from(len).ok()?,
            FfiType::Void | FfiType::F32 | FfiType::F64 | FfiType::Pointer => return None,
        }
        Some(arg)
    }
}

impl Default for NativeArg {
    #[inline]
    fn default() -> Self {
        Self::zeroed()
    }
}

// Manual implementations for Copy, Clone, and Debug since union doesn't auto-derive
impl Copy for NativeArg {}
impl Clone for NativeArg {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl fmt::Debug for NativeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeArg({:#018x})", unsafe { self.u64 })
    }
}
