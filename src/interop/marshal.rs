//! Type marshaling - script ↔ native conversions
//!
//! Design: the invocation engine never looks inside a value. Everything it
//! needs to turn script values into native slots and back, and to free what
//! a conversion allocated, goes through a `Converter`.
//!
//! Native memory handed across the boundary (strings, arrays, struct
//! copies) comes from the C allocator so a callee taking ownership can
//! release it with `free()`.

use super::descriptor::ArgInfo;
use super::types::{ArrayInfo, FfiType, NativeArg, Transfer, TypeTag};
use crate::error::{BridgeError, Result};
use crate::gc::{ObjectPtr, ToggleBridge};
use crate::value::{ScriptValue, StructValue};
use core::ffi::c_void;
use std::ffi::CStr;
use std::rc::Rc;

/// Conversion collaborator used by invocations and trampolines
pub trait Converter {
    /// Script value into a native slot
    fn to_native(
        &self,
        value: &ScriptValue,
        ty: &TypeTag,
        transfer: Transfer,
        nullable: bool,
        name: &str,
    ) -> Result<NativeArg>;

    /// Native slot into a script value
    fn to_script(&self, arg: &NativeArg, ty: &TypeTag, transfer: Transfer) -> Result<ScriptValue>;

    /// Script sequence into a contiguous buffer, plus its element count
    fn array_to_native(
        &self,
        value: &ScriptValue,
        element: &TypeTag,
        transfer: Transfer,
        nullable: bool,
        name: &str,
    ) -> Result<(NativeArg, usize)>;

    /// Buffer of `len` elements into a script array
    fn array_to_script(
        &self,
        arg: &NativeArg,
        element: &TypeTag,
        len: usize,
        transfer: Transfer,
    ) -> Result<ScriptValue>;

    /// Free what `to_native` produced for an input, per `transfer`
    fn release_in(&self, arg: &NativeArg, ty: &TypeTag, transfer: Transfer);

    fn release_in_array(&self, arg: &NativeArg, element: &TypeTag, len: usize, transfer: Transfer);

    /// Free a value native code handed over, per `transfer`
    fn release_out(&self, arg: &NativeArg, ty: &TypeTag, transfer: Transfer);

    fn release_out_array(&self, arg: &NativeArg, element: &TypeTag, len: usize, transfer: Transfer);

    /// Undo a `to_native` whose result never reached native code
    fn discard(&self, arg: &NativeArg, ty: &TypeTag, transfer: Transfer);

    fn discard_array(&self, arg: &NativeArg, element: &TypeTag, len: usize, transfer: Transfer);
}

/// Converter for the built-in value model
pub struct StandardConverter {
    toggles: ToggleBridge,
}

impl StandardConverter {
    pub fn new(toggles: ToggleBridge) -> Self {
        Self { toggles }
    }

    /// Build a native array, optionally followed by a zero element
    fn build_array(
        &self,
        value: &ScriptValue,
        element: &TypeTag,
        transfer: Transfer,
        nullable: bool,
        name: &str,
        terminate: bool,
    ) -> Result<(NativeArg, usize)> {
        let items = match value {
            v if v.is_null_or_undefined() => return null_or_error(nullable, name).map(|a| (a, 0)),
            ScriptValue::String(s) if matches!(element, TypeTag::Int8 | TypeTag::UInt8) => {
                return bytes_to_native(s.as_bytes(), terminate).map(|buf| (buf, s.len()));
            }
            ScriptValue::Array(items) => items,
            other => {
                return Err(BridgeError::Type(format!(
                    "Expected array for argument '{}' but got type '{}'",
                    name,
                    other.type_name()
                )));
            }
        };

        let elem_ty = element.ffi_type();
        let size = elem_ty.size();
        let buf = alloc_zeroed(items.len() + usize::from(terminate), size)?;
        let elem_transfer = element_transfer(transfer);

        for (i, item) in items.iter().enumerate() {
            match self.to_native(item, element, elem_transfer, false, name) {
                Ok(arg) => unsafe { arg.store(buf.add(i * size) as *mut c_void, elem_ty) },
                Err(err) => {
                    for j in 0..i {
                        let converted =
                            unsafe { NativeArg::load(buf.add(j * size) as *const c_void, elem_ty) };
                        self.discard(&converted, element, elem_transfer);
                    }
                    unsafe { libc::free(buf as *mut c_void) };
                    return Err(err);
                }
            }
        }

        Ok((NativeArg::from_ptr(buf as *mut c_void), items.len()))
    }
}

impl Converter for StandardConverter {
    fn to_native(
        &self,
        value: &ScriptValue,
        ty: &TypeTag,
        transfer: Transfer,
        nullable: bool,
        name: &str,
    ) -> Result<NativeArg> {
        let mut arg = NativeArg::zeroed();
        match ty {
            TypeTag::Void => {}
            TypeTag::Boolean => arg.i32 = i32::from(value.truthy()),
            TypeTag::Int8
            | TypeTag::UInt8
            | TypeTag::Int16
            | TypeTag::UInt16
            | TypeTag::Int32
            | TypeTag::UInt32
            | TypeTag::Int64
            | TypeTag::UInt64
            | TypeTag::Enum
            | TypeTag::Flags => arg = integer_to_native(value, ty, name)?,
            TypeTag::Float => arg.f32 = number(value, ty, name)? as f32,
            TypeTag::Double => arg.f64 = number(value, ty, name)?,
            TypeTag::Utf8 => match value {
                ScriptValue::String(s) => arg.ptr = malloc_string(s, name)?,
                v if v.is_null_or_undefined() => return null_or_error(nullable, name),
                other => return Err(mismatch(ty, name, other)),
            },
            TypeTag::Pointer => match value {
                ScriptValue::Pointer(addr) => arg.ptr = *addr as *mut c_void,
                ScriptValue::Struct(s) => arg.ptr = s.as_ptr(),
                v if v.is_null_or_undefined() => {}
                other => return Err(mismatch(ty, name, other)),
            },
            TypeTag::Struct(info) | TypeTag::Union(info) => match value {
                ScriptValue::Struct(s) if s.info().name == info.name => {
                    arg.ptr = if transfer != Transfer::Everything {
                        s.as_ptr()
                    } else if info.boxed {
                        copy_block(s.as_ptr(), info.size)?
                    } else {
                        return Err(BridgeError::Type(format!(
                            "Cannot transfer ownership of non boxed structure {} for argument '{}'",
                            info.name, name
                        )));
                    };
                }
                v if v.is_null_or_undefined() => return null_or_error(nullable, name),
                other => return Err(mismatch(ty, name, other)),
            },
            TypeTag::Object(_) => match value {
                ScriptValue::Object(wrapper) => {
                    let object = wrapper.require_object()?;
                    if transfer == Transfer::Everything {
                        unsafe { object.inc() };
                    }
                    arg.ptr = object.as_raw() as *mut c_void;
                }
                v if v.is_null_or_undefined() => return null_or_error(nullable, name),
                other => return Err(mismatch(ty, name, other)),
            },
            TypeTag::Callback(_) | TypeTag::DestroyNotify => match value {
                v if v.is_null_or_undefined() && nullable => {}
                _ => {
                    return Err(BridgeError::Unsupported(format!(
                        "Callback argument '{}' cannot be converted outside of an invocation",
                        name
                    )));
                }
            },
            TypeTag::Array(info) => {
                let terminate = info.zero_terminated;
                let (buf, len) = self.build_array(value, &info.element, transfer, nullable, name, terminate)?;
                if let Some(fixed) = info.fixed_size {
                    if !buf.as_ptr().is_null() && len != fixed {
                        self.discard_array(&buf, &info.element, len, transfer);
                        return Err(BridgeError::Type(format!(
                            "Array length mismatch for argument '{}': expected {}, got {}",
                            name, fixed, len
                        )));
                    }
                }
                arg = buf;
            }
        }
        Ok(arg)
    }

    fn to_script(&self, arg: &NativeArg, ty: &TypeTag, transfer: Transfer) -> Result<ScriptValue> {
        let value = unsafe {
            match ty {
                TypeTag::Void => ScriptValue::Undefined,
                TypeTag::Boolean => ScriptValue::Boolean(arg.i32 != 0),
                TypeTag::Int8 => ScriptValue::Int(i64::from(arg.i8)),
                TypeTag::UInt8 => ScriptValue::Int(i64::from(arg.u8)),
                TypeTag::Int16 => ScriptValue::Int(i64::from(arg.i16)),
                TypeTag::UInt16 => ScriptValue::Int(i64::from(arg.u16)),
                TypeTag::Int32 | TypeTag::Enum => ScriptValue::Int(i64::from(arg.i32)),
                TypeTag::UInt32 | TypeTag::Flags => ScriptValue::Int(i64::from(arg.u32)),
                TypeTag::Int64 => ScriptValue::Int(arg.i64),
                TypeTag::UInt64 => match i64::try_from(arg.u64) {
                    Ok(i) => ScriptValue::Int(i),
                    Err(_) => ScriptValue::Double(arg.u64 as f64),
                },
                TypeTag::Float => ScriptValue::Double(f64::from(arg.f32)),
                TypeTag::Double => ScriptValue::Double(arg.f64),
                TypeTag::Utf8 => {
                    if arg.ptr.is_null() {
                        return Ok(ScriptValue::Null);
                    }
                    let s = CStr::from_ptr(arg.ptr as *const libc::c_char);
                    match s.to_str() {
                        Ok(s) => ScriptValue::String(s.to_string()),
                        Err(_) => {
                            return Err(BridgeError::Type(
                                "Invalid UTF-8 in string returned from native code".to_string(),
                            ));
                        }
                    }
                }
                TypeTag::Pointer | TypeTag::Callback(_) | TypeTag::DestroyNotify => {
                    if arg.ptr.is_null() {
                        ScriptValue::Null
                    } else {
                        ScriptValue::Pointer(arg.ptr as usize)
                    }
                }
                TypeTag::Struct(info) | TypeTag::Union(info) => {
                    if arg.ptr.is_null() {
                        return Ok(ScriptValue::Null);
                    }
                    ScriptValue::Struct(Rc::new(StructValue::copy_from(info.clone(), arg.ptr)))
                }
                TypeTag::Object(_) => match ObjectPtr::from_raw(arg.ptr as *mut _) {
                    Some(object) => ScriptValue::Object(self.toggles.wrapper_for(object)),
                    None => ScriptValue::Null,
                },
                TypeTag::Array(info) => {
                    if arg.ptr.is_null() {
                        return Ok(ScriptValue::Null);
                    }
                    let Some(len) = intrinsic_length(arg, info) else {
                        return Err(BridgeError::Unsupported(
                            "Array length travels in another parameter and is not available here"
                                .to_string(),
                        ));
                    };
                    return self.array_to_script(arg, &info.element, len, transfer);
                }
            }
        };
        Ok(value)
    }

    fn array_to_native(
        &self,
        value: &ScriptValue,
        element: &TypeTag,
        transfer: Transfer,
        nullable: bool,
        name: &str,
    ) -> Result<(NativeArg, usize)> {
        self.build_array(value, element, transfer, nullable, name, false)
    }

    fn array_to_script(
        &self,
        arg: &NativeArg,
        element: &TypeTag,
        len: usize,
        transfer: Transfer,
    ) -> Result<ScriptValue> {
        if arg.as_ptr().is_null() {
            return Ok(ScriptValue::Null);
        }

        let elem_ty = element.ffi_type();
        let elem_transfer = element_transfer(transfer);
        let mut items = Vec::with_capacity(len);
        for i in 0..len {
            let elem = unsafe { element_at(arg, i, elem_ty) };
            items.push(self.to_script(&elem, element, elem_transfer)?);
        }
        Ok(ScriptValue::Array(items))
    }

    fn release_in(&self, arg: &NativeArg, ty: &TypeTag, transfer: Transfer) {
        if transfer == Transfer::Everything {
            return;
        }

        match ty {
            TypeTag::Utf8 => unsafe { libc::free(arg.as_ptr()) },
            TypeTag::Array(info) => {
                if let Some(len) = intrinsic_length(arg, info) {
                    self.release_in_array(arg, &info.element, len, transfer);
                }
            }
            TypeTag::Void
            | TypeTag::Boolean
            | TypeTag::Int8
            | TypeTag::UInt8
            | TypeTag::Int16
            | TypeTag::UInt16
            | TypeTag::Int32
            | TypeTag::UInt32
            | TypeTag::Int64
            | TypeTag::UInt64
            | TypeTag::Float
            | TypeTag::Double
            | TypeTag::Pointer
            | TypeTag::Enum
            | TypeTag::Flags
            | TypeTag::Struct(_)
            | TypeTag::Union(_)
            | TypeTag::Object(_)
            | TypeTag::Callback(_)
            | TypeTag::DestroyNotify => {}
        }
    }

    fn release_in_array(&self, arg: &NativeArg, element: &TypeTag, len: usize, transfer: Transfer) {
        if arg.as_ptr().is_null() || transfer == Transfer::Everything {
            return;
        }

        let elem_ty = element.ffi_type();
        for i in 0..len {
            let elem = unsafe { element_at(arg, i, elem_ty) };
            self.release_in(&elem, element, Transfer::Nothing);
        }
        // With Container the callee took the buffer itself
        if transfer == Transfer::Nothing {
            unsafe { libc::free(arg.as_ptr()) };
        }
    }

    fn release_out(&self, arg: &NativeArg, ty: &TypeTag, transfer: Transfer) {
        if transfer == Transfer::Nothing || arg.as_ptr().is_null() && ty.ffi_type() == FfiType::Pointer {
            return;
        }

        match ty {
            TypeTag::Utf8 | TypeTag::Struct(_) | TypeTag::Union(_) => unsafe {
                libc::free(arg.as_ptr())
            },
            TypeTag::Object(_) => unsafe {
                if let Some(object) = ObjectPtr::from_raw(arg.as_ptr() as *mut _) {
                    object.dec();
                }
            },
            TypeTag::Array(info) => {
                if let Some(len) = intrinsic_length(arg, info) {
                    self.release_out_array(arg, &info.element, len, transfer);
                }
            }
            TypeTag::Void
            | TypeTag::Boolean
            | TypeTag::Int8
            | TypeTag::UInt8
            | TypeTag::Int16
            | TypeTag::UInt16
            | TypeTag::Int32
            | TypeTag::UInt32
            | TypeTag::Int64
            | TypeTag::UInt64
            | TypeTag::Float
            | TypeTag::Double
            | TypeTag::Pointer
            | TypeTag::Enum
            | TypeTag::Flags
            | TypeTag::Callback(_)
            | TypeTag::DestroyNotify => {}
        }
    }

    fn release_out_array(&self, arg: &NativeArg, element: &TypeTag, len: usize, transfer: Transfer) {
        if arg.as_ptr().is_null() || transfer == Transfer::Nothing {
            return;
        }

        if transfer == Transfer::Everything {
            let elem_ty = element.ffi_type();
            for i in 0..len {
                let elem = unsafe { element_at(arg, i, elem_ty) };
                self.release_out(&elem, element, Transfer::Everything);
            }
        }
        unsafe { libc::free(arg.as_ptr()) };
    }

    fn discard(&self, arg: &NativeArg, ty: &TypeTag, transfer: Transfer) {
        match ty {
            TypeTag::Object(_) if transfer == Transfer::Everything => unsafe {
                if let Some(object) = ObjectPtr::from_raw(arg.as_ptr() as *mut _) {
                    object.dec();
                }
            },
            TypeTag::Struct(_) | TypeTag::Union(_) if transfer == Transfer::Everything => unsafe {
                libc::free(arg.as_ptr());
            },
            TypeTag::Array(info) => {
                if let Some(len) = intrinsic_length(arg, info) {
                    self.discard_array(arg, &info.element, len, transfer);
                }
            }
            _ => self.release_in(arg, ty, Transfer::Nothing),
        }
    }

    fn discard_array(&self, arg: &NativeArg, element: &TypeTag, len: usize, transfer: Transfer) {
        if arg.as_ptr().is_null() {
            return;
        }
        let elem_ty = element.ffi_type();
        let elem_transfer = element_transfer(transfer);
        for i in 0..len {
            let elem = unsafe { element_at(arg, i, elem_ty) };
            self.discard(&elem, element, elem_transfer);
        }
        unsafe { libc::free(arg.as_ptr()) };
    }
}

/// Ownership of each element given the ownership of the array
#[inline]
fn element_transfer(transfer: Transfer) -> Transfer {
    match transfer {
        Transfer::Everything => Transfer::Everything,
        Transfer::Nothing | Transfer::Container => Transfer::Nothing,
    }
}

/// # Safety
/// `arg` must point to at least `index + 1` elements of class `ty`.
#[inline]
unsafe fn element_at(arg: &NativeArg, index: usize, ty: FfiType) -> NativeArg {
    let base = arg.as_ptr() as *const u8;
    NativeArg::load(base.add(index * ty.size()) as *const c_void, ty)
}

/// Length of an array that carries it itself (terminator or fixed size)
fn intrinsic_length(arg: &NativeArg, info: &ArrayInfo) -> Option<usize> {
    if arg.as_ptr().is_null() {
        return Some(0);
    }
    if let Some(fixed) = info.fixed_size {
        return Some(fixed);
    }
    if !info.zero_terminated {
        return None;
    }

    let elem_ty = info.element.ffi_type();
    let mut len = 0;
    // The zeroed slot makes any all-zero element read back as 0
    while unsafe { element_at(arg, len, elem_ty).u64 } != 0 {
        len += 1;
    }
    Some(len)
}

fn mismatch(ty: &TypeTag, name: &str, value: &ScriptValue) -> BridgeError {
    BridgeError::Type(format!(
        "Expected type {} for argument '{}' but got type '{}'",
        ty,
        name,
        value.type_name()
    ))
}

fn null_or_error(nullable: bool, name: &str) -> Result<NativeArg> {
    if nullable {
        Ok(NativeArg::zeroed())
    } else {
        Err(BridgeError::Type(format!("Argument {} may not be null", name)))
    }
}

fn number(value: &ScriptValue, ty: &TypeTag, name: &str) -> Result<f64> {
    match value {
        ScriptValue::Boolean(b) => Ok(f64::from(u8::from(*b))),
        other => other.as_f64().ok_or_else(|| mismatch(ty, name, other)),
    }
}

fn integer_to_native(value: &ScriptValue, ty: &TypeTag, name: &str) -> Result<NativeArg> {
    let n: i128 = match value {
        ScriptValue::Int(i) => i128::from(*i),
        ScriptValue::Double(d) if d.is_finite() => d.trunc() as i128,
        ScriptValue::Boolean(b) => i128::from(*b),
        other => return Err(mismatch(ty, name, other)),
    };

    let (min, max): (i128, i128) = match ty.ffi_type() {
        FfiType::I8 => (i8::MIN.into(), i8::MAX.into()),
        FfiType::U8 => (0, u8::MAX.into()),
        FfiType::I16 => (i16::MIN.into(), i16::MAX.into()),
        FfiType::U16 => (0, u16::MAX.into()),
        FfiType::I32 => (i32::MIN.into(), i32::MAX.into()),
        FfiType::U32 => (0, u32::MAX.into()),
        FfiType::I64 => (i64::MIN.into(), i64::MAX.into()),
        FfiType::U64 => (0, u64::MAX.into()),
        FfiType::Void | FfiType::F32 | FfiType::F64 | FfiType::Pointer => (0, 0),
    };
    if n < min || n > max {
        return Err(BridgeError::Type(format!(
            "Value {} is out of range for {} (argument '{}')",
            n, ty, name
        )));
    }

    let mut arg = NativeArg::zeroed();
    match ty.ffi_type() {
        FfiType::I8 => arg.i8 = n as i8,
        FfiType::U8 => arg.u8 = n as u8,
        FfiType::I16 => arg.i16 = n as i16,
        FfiType::U16 => arg.u16 = n as u16,
        FfiType::I32 => arg.i32 = n as i32,
        FfiType::U32 => arg.u32 = n as u32,
        FfiType::I64 => arg.i64 = n as i64,
        FfiType::U64 => arg.u64 = n as u64,
        FfiType::Void | FfiType::F32 | FfiType::F64 | FfiType::Pointer => {}
    }
    Ok(arg)
}

/// Element count of an array, in the slot of its length parameter
pub(crate) fn length_to_native(len: usize, info: &ArgInfo) -> Result<NativeArg> {
    NativeArg::from_length(len, info.ty.ffi_type()).ok_or_else(|| {
        BridgeError::Type(format!(
            "Value {} is out of range for {} (argument '{}')",
            len, info.ty, info.name
        ))
    })
}

/// Nothing can be reported once the allocator fails
fn out_of_memory(bytes: usize) -> BridgeError {
    crate::logging::error!(event = "out_of_memory", bytes, "Native allocation failed");
    BridgeError::Uncatchable { exit_code: None }
}

/// `count` zeroed elements of `size` bytes, never null
fn alloc_zeroed(count: usize, size: usize) -> Result<*mut u8> {
    let ptr = unsafe { libc::calloc(count.max(1), size.max(1)) } as *mut u8;
    if ptr.is_null() {
        Err(out_of_memory(count * size))
    } else {
        Ok(ptr)
    }
}

fn malloc_string(s: &str, name: &str) -> Result<*mut c_void> {
    if s.as_bytes().contains(&0) {
        return Err(BridgeError::Type(format!(
            "String for argument '{}' contains an embedded NUL",
            name
        )));
    }
    Ok(bytes_to_native(s.as_bytes(), true)?.as_ptr())
}

fn bytes_to_native(bytes: &[u8], terminate: bool) -> Result<NativeArg> {
    let buf = alloc_zeroed(bytes.len() + usize::from(terminate), 1)?;
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len()) };
    Ok(NativeArg::from_ptr(buf as *mut c_void))
}

fn copy_block(src: *const c_void, size: usize) -> Result<*mut c_void> {
    let dst = unsafe { libc::malloc(size.max(1)) };
    if dst.is_null() {
        return Err(out_of_memory(size));
    }
    unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size) };
    Ok(dst)
}
