//! Script-side values
//!
//! The script engine's object model is external to the bridge; this is the
//! subset of it the marshaling layer needs to read and produce.

use crate::error::Result;
use crate::gc::Wrapper;
use crate::interop::StructInfo;
use core::ffi::c_void;
use core::ptr::NonNull;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Callable script value
pub trait ScriptFunction {
    fn name(&self) -> &str;

    /// Run the function; `Uncatchable` means nothing is pending to report
    fn call(&self, this: Option<&ScriptValue>, args: &[ScriptValue]) -> Result<ScriptValue>;
}

/// Script function backed by a Rust closure
pub struct ScriptClosure<F> {
    name: String,
    f: F,
}

impl<F> ScriptClosure<F>
where
    F: Fn(Option<&ScriptValue>, &[ScriptValue]) -> Result<ScriptValue>,
{
    pub fn new(name: &str, f: F) -> Self {
        Self { name: name.to_string(), f }
    }
}

impl<F> ScriptFunction for ScriptClosure<F>
where
    F: Fn(Option<&ScriptValue>, &[ScriptValue]) -> Result<ScriptValue>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, this: Option<&ScriptValue>, args: &[ScriptValue]) -> Result<ScriptValue> {
        (self.f)(this, args)
    }
}

/// Struct or union value owned by script, stored in a native block
pub struct StructValue {
    info: StructInfo,
    data: NonNull<u8>,
}

impl StructValue {
    /// Zero-filled value
    pub fn new(info: StructInfo) -> Self {
        let size = info.size.max(1);
        let data = unsafe { libc::calloc(1, size) } as *mut u8;
        let Some(data) = NonNull::new(data) else {
            let layout = std::alloc::Layout::from_size_align(size, 1)
                .unwrap_or_else(|_| std::alloc::Layout::new::<u8>());
            std::alloc::handle_alloc_error(layout)
        };
        Self { info, data }
    }

    /// Copy `info.size` bytes from native memory
    ///
    /// # Safety
    /// `src` must be readable for `info.size` bytes.
    pub unsafe fn copy_from(info: StructInfo, src: *const c_void) -> Self {
        let value = Self::new(info);
        core::ptr::copy_nonoverlapping(src as *const u8, value.data.as_ptr(), value.info.size);
        value
    }

    #[inline]
    pub fn info(&self) -> &StructInfo {
        &self.info
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        self.data.as_ptr() as *mut c_void
    }

    /// Snapshot of the current contents
    pub fn to_bytes(&self) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.info.size).to_vec() }
    }

    /// Read a field at a byte offset
    pub fn read<T: Copy>(&self, offset: usize) -> Option<T> {
        if offset + core::mem::size_of::<T>() > self.info.size {
            return None;
        }
        Some(unsafe { core::ptr::read_unaligned(self.data.as_ptr().add(offset) as *const T) })
    }

    /// Write a field at a byte offset
    pub fn write<T: Copy>(&self, offset: usize, value: T) -> bool {
        if offset + core::mem::size_of::<T>() > self.info.size {
            return false;
        }
        unsafe { core::ptr::write_unaligned(self.data.as_ptr().add(offset) as *mut T, value) };
        true
    }
}

impl Drop for StructValue {
    fn drop(&mut self) {
        unsafe { libc::free(self.data.as_ptr() as *mut c_void) };
    }
}

impl fmt::Debug for StructValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StructValue({} @ {:p})", self.info.name, self.data)
    }
}

/// Dynamically typed script value
#[derive(Clone)]
pub enum ScriptValue {
    Undefined,
    Null,
    Boolean(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<ScriptValue>),
    Object(Arc<Wrapper>),
    Struct(Rc<StructValue>),
    Function(Rc<dyn ScriptFunction>),
    /// Opaque native address
    Pointer(usize),
}

impl ScriptValue {
    /// Wrap a closure as a script function value
    pub fn function<F>(name: &str, f: F) -> Self
    where
        F: Fn(Option<&ScriptValue>, &[ScriptValue]) -> Result<ScriptValue> + 'static,
    {
        Self::Function(Rc::new(ScriptClosure::new(name, f)))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Int(_) | Self::Double(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Struct(_) => "struct",
            Self::Function(_) => "function",
            Self::Pointer(_) => "pointer",
        }
    }

    #[inline]
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, Self::Null | Self::Undefined)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Boolean(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Double(d) => *d != 0.0 && !d.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::Pointer(p) => *p != 0,
            Self::Array(_) | Self::Object(_) | Self::Struct(_) | Self::Function(_) => true,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Double(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ScriptValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<Wrapper>> {
        match self {
            Self::Object(wrapper) => Some(wrapper),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Rc<StructValue>> {
        match self {
            Self::Struct(value) => Some(value),
            _ => None,
        }
    }
}

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::Int(a), Self::Double(b)) | (Self::Double(b), Self::Int(a)) => *a as f64 == *b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::Struct(a), Self::Struct(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Pointer(a), Self::Pointer(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Double(d) => write!(f, "{}", d),
            Self::String(s) => write!(f, "{:?}", s),
            Self::Array(items) => f.debug_list().entries(items).finish(),
            Self::Object(wrapper) => write!(f, "[object {}]", wrapper.class()),
            Self::Struct(value) => write!(f, "{:?}", value),
            Self::Function(func) => write!(f, "[function {}]", func.name()),
            Self::Pointer(p) => write!(f, "{:#x}", p),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for ScriptValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for ScriptValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for ScriptValue {
    fn from(d: f64) -> Self {
        Self::Double(d)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<Vec<ScriptValue>> for ScriptValue {
    fn from(items: Vec<ScriptValue>) -> Self {
        Self::Array(items)
    }
}
