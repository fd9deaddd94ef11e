//! Callback trampolines - native entry points forwarding into script code
//!
//! A trampoline owns a libffi closure whose user data is the trampoline
//! cell itself. The cell is refcounted by hand (engine thread only):
//! every `Trampoline` handle is one reference, and one extra "pinned"
//! reference belongs to the native side for Notified and Async scopes.
//! The pin is dropped by the destroy-notify thunk (Notified) or after the
//! first invocation (Async), whichever comes first.

use super::abi::{native_arity, store_closure_result, Signature};
use super::classify::{Classification, ParamKind};
use super::descriptor::{ArgInfo, CallableDescriptor};
use super::marshal::length_to_native;
use super::types::{Direction, FfiType, NativeArg, Scope, Transfer};
use crate::context::{ContextInner, Counters};
use crate::error::{BridgeError, Result};
use crate::ffi::{native_error_for, NativeError};
use crate::logging::{
    error, log_reentry_refused, log_trampoline_created, log_trampoline_released, warn,
};
use crate::value::{ScriptFunction, ScriptValue};
use core::ffi::c_void;
use core::ptr::NonNull;
use libffi::middle::Closure;
use once_cell::unsync::OnceCell;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Script function reached by a trampoline
enum FunctionHandle {
    Rooted(Rc<dyn ScriptFunction>),
    /// Virtual-method overrides are kept alive by their class
    Unrooted(Weak<dyn ScriptFunction>),
}

struct TrampolineCell {
    refcount: Cell<usize>,
    pinned: Cell<bool>,
    desc: Arc<CallableDescriptor>,
    classification: Classification,
    function: FunctionHandle,
    scope: Scope,
    is_vfunc: bool,
    cx: Weak<ContextInner>,
    closure: OnceCell<Closure<'static>>,
    code: Cell<*const c_void>,
}

/// Reference to a trampoline
pub struct Trampoline {
    cell: NonNull<TrampolineCell>,
}

impl Trampoline {
    pub(crate) fn new(
        cx: &Rc<ContextInner>,
        desc: Arc<CallableDescriptor>,
        function: Rc<dyn ScriptFunction>,
        scope: Scope,
        is_vfunc: bool,
    ) -> Result<Self> {
        let classification = Classification::for_callback(&desc)?;
        let signature = Signature::for_callable(&desc);

        let function = if is_vfunc {
            FunctionHandle::Unrooted(Rc::downgrade(&function))
        } else {
            FunctionHandle::Rooted(function)
        };

        // Freed by the last handle's drop
        let cell: &'static TrampolineCell = Box::leak(Box::new(TrampolineCell {
            refcount: Cell::new(1),
            pinned: Cell::new(false),
            desc,
            classification,
            function,
            scope,
            is_vfunc,
            cx: Rc::downgrade(cx),
            closure: OnceCell::new(),
            code: Cell::new(core::ptr::null()),
        }));

        let closure = Closure::new(signature.cif().clone(), trampoline_entry, cell);
        let code = *closure.code_ptr() as *const c_void;
        cell.code.set(code);
        // Fresh cell: the slot is empty
        let _ = cell.closure.set(closure);

        Counters::bump(&cx.counters.trampolines_created);
        log_trampoline_created(cell.desc.name(), scope.as_str(), code);
        Ok(Self { cell: NonNull::from(cell) })
    }

    #[inline]
    fn cell(&self) -> &TrampolineCell {
        unsafe { self.cell.as_ref() }
    }

    /// New handle on a live cell
    fn retain(cell: &TrampolineCell) -> Self {
        cell.refcount.set(cell.refcount.get() + 1);
        Self { cell: NonNull::from(cell) }
    }

    /// Handle for a reference the caller already counted
    fn adopt(cell: &TrampolineCell) -> Self {
        Self { cell: NonNull::from(cell) }
    }

    /// Native entry point
    #[inline]
    pub fn code(&self) -> *const c_void {
        self.cell().code.get()
    }

    /// Value for the callback's user-data parameter; also what
    /// `release_trampoline` expects
    #[inline]
    pub fn user_data(&self) -> *mut c_void {
        self.cell.as_ptr() as *mut c_void
    }

    pub fn refcount(&self) -> usize {
        self.cell().refcount.get()
    }

    pub fn scope(&self) -> Scope {
        self.cell().scope
    }

    pub fn descriptor(&self) -> &Arc<CallableDescriptor> {
        &self.cell().desc
    }

    pub fn is_pinned(&self) -> bool {
        self.cell().pinned.get()
    }

    /// Take the native side's reference
    pub fn pin(&self) {
        let cell = self.cell();
        if !cell.pinned.replace(true) {
            cell.refcount.set(cell.refcount.get() + 1);
        }
    }
}

impl Clone for Trampoline {
    fn clone(&self) -> Self {
        Self::retain(self.cell())
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        let cell = self.cell();
        let count = cell.refcount.get() - 1;
        cell.refcount.set(count);
        if count > 0 {
            return;
        }

        log_trampoline_released(cell.desc.name());
        if let Some(cx) = cell.cx.upgrade() {
            Counters::bump(&cx.counters.trampolines_released);
        }
        // Drops the closure, then everything it captured
        unsafe { drop(Box::from_raw(self.cell.as_ptr())) };
    }
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trampoline")
            .field("callback", &self.cell().desc.name())
            .field("scope", &self.scope())
            .field("refcount", &self.refcount())
            .field("code", &self.code())
            .finish()
    }
}

/// Destroy-notify target paired with a trampoline's user data
///
/// # Safety
/// - Null-safe
/// - `data` must be a trampoline's `user_data()` while it is alive
#[no_mangle]
pub unsafe extern "C" fn release_trampoline(data: *mut c_void) {
    let Some(cell) = NonNull::new(data as *mut TrampolineCell) else {
        return;
    };
    if cell.as_ref().pinned.replace(false) {
        drop(Trampoline::adopt(cell.as_ref()));
    }
}

/// libffi closure handler
unsafe extern "C" fn trampoline_entry(
    _cif: &libffi::low::ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    cell: &TrampolineCell,
) {
    let result: *mut u64 = result;
    let outcome = catch_unwind(AssertUnwindSafe(|| cell.enter(result, args)));
    if outcome.is_err() {
        cell.store_default(result);
        let reason = format!("panic while running callback {}", cell.desc.name());
        error!(target: "trampoline", event = "panic", "{}", reason);
        if let Some(cx) = cell.cx.upgrade() {
            cx.terminator.abort(&reason);
        }
    }
}

impl TrampolineCell {
    unsafe fn store_default(&self, result: *mut u64) {
        let ty = self.desc.return_info().ty.ffi_type();
        store_closure_result(result, &NativeArg::zeroed(), ty);
    }

    /// Native slot of parameter 0
    #[inline]
    fn offset(&self) -> usize {
        usize::from(self.desc.instance().is_some())
    }

    unsafe fn enter(&self, result: *mut u64, args: *const *const c_void) {
        self.store_default(result);

        let Some(cx) = self.cx.upgrade() else {
            warn!(
                target: "trampoline",
                event = "orphaned_callback",
                callback = self.desc.name(),
                "Callback invoked after its context was dropped"
            );
            return;
        };
        if cx.toggles.collector().is_sweeping() {
            log_reentry_refused(self.desc.name());
            return;
        }

        // Held for the whole entry so a release from script cannot free us
        let guard = Trampoline::retain(self);

        let n_native = native_arity(&self.desc);
        let native: &[*const c_void] = if n_native == 0 || args.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(args, n_native)
        };

        if let Err(err) = self.dispatch(&cx, result, native) {
            self.fail(&cx, result, native, err);
        }

        if self.scope == Scope::Async && self.pinned.replace(false) {
            cx.defer_release(Trampoline::adopt(self));
        }
        // The last reference cannot go while the closure is executing
        if guard.refcount() == 1 {
            cx.defer_release(guard);
        }
    }

    unsafe fn dispatch(
        &self,
        cx: &ContextInner,
        result: *mut u64,
        native: &[*const c_void],
    ) -> Result<()> {
        let offset = self.offset();
        let mut inputs = Vec::with_capacity(offset + self.classification.expected_inputs());

        if let Some(instance) = self.desc.instance() {
            let arg = NativeArg::load(native[0], FfiType::Pointer);
            inputs.push(cx.converter.to_script(&arg, &instance.ty, Transfer::Nothing)?);
        }

        for (i, info) in self.desc.args().iter().enumerate() {
            if info.direction == Direction::Out {
                continue;
            }
            match self.classification.kind(i) {
                ParamKind::Skipped | ParamKind::Callback => {}
                ParamKind::Array => {
                    let Some((array, length)) = info.ty.array().and_then(|a| Some((a, a.length?)))
                    else {
                        continue;
                    };
                    let len_info = self.desc.arg(length);
                    let len = read_input(native[length + offset], len_info)
                        .to_length(len_info.ty.ffi_type());
                    let buf = read_input(native[i + offset], info);
                    let value = cx.converter.array_to_script(&buf, &array.element, len, info.transfer)?;
                    if info.transfer != Transfer::Nothing {
                        cx.converter.release_out_array(&buf, &array.element, len, info.transfer);
                    }
                    inputs.push(value);
                }
                ParamKind::Normal => {
                    let arg = read_input(native[i + offset], info);
                    let value = cx.converter.to_script(&arg, &info.ty, info.transfer)?;
                    if info.transfer != Transfer::Nothing {
                        cx.converter.release_out(&arg, &info.ty, info.transfer);
                    }
                    inputs.push(value);
                }
            }
        }

        let this = if self.is_vfunc && !inputs.is_empty() {
            Some(inputs.remove(0))
        } else {
            None
        };

        let function = match &self.function {
            FunctionHandle::Rooted(function) => function.clone(),
            FunctionHandle::Unrooted(weak) => weak.upgrade().ok_or_else(|| {
                BridgeError::Thrown(format!(
                    "Function {} was garbage collected before it could be called",
                    self.desc.name()
                ))
            })?,
        };

        let value = function.call(this.as_ref(), &inputs)?;
        self.write_results(cx, result, native, value)
    }

    /// Parameters whose values script produces, in declaration order
    fn output_params(&self) -> impl Iterator<Item = usize> + '_ {
        self.desc
            .args()
            .iter()
            .enumerate()
            .filter(|(i, arg)| {
                arg.direction.is_output() && self.classification.kind(*i) != ParamKind::Skipped
            })
            .map(|(i, _)| i)
    }

    unsafe fn write_results(
        &self,
        cx: &ContextInner,
        result: *mut u64,
        native: &[*const c_void],
        value: ScriptValue,
    ) -> Result<()> {
        let expected = self.classification.expected_outputs();
        let has_return = !self.desc.return_info().ty.is_void();

        match expected {
            0 => Ok(()),
            1 if has_return => self.write_return(cx, result, native, &value),
            1 => match self.output_params().next() {
                Some(index) => self.write_out(cx, native, index, &value),
                None => Ok(()),
            },
            _ => {
                let items = match &value {
                    ScriptValue::Array(items) if items.len() >= expected => items,
                    other => {
                        return Err(BridgeError::Type(format!(
                            "Function {} must return an array of {} values, got {}",
                            self.desc.name(),
                            expected,
                            other.type_name()
                        )));
                    }
                };

                let mut items = items.iter();
                if has_return {
                    if let Some(item) = items.next() {
                        self.write_return(cx, result, native, item)?;
                    }
                }
                for (index, item) in self.output_params().zip(items) {
                    self.write_out(cx, native, index, item)?;
                }
                Ok(())
            }
        }
    }

    unsafe fn write_return(
        &self,
        cx: &ContextInner,
        result: *mut u64,
        native: &[*const c_void],
        value: &ScriptValue,
    ) -> Result<()> {
        let info = self.desc.return_info();
        let arg = match info.ty.array() {
            Some(array) if array.length.is_some() => {
                let (buf, len) = cx.converter.array_to_native(
                    value,
                    &array.element,
                    info.transfer,
                    info.nullable,
                    "return value",
                )?;
                if let Some(length) = array.length {
                    if let Err(err) = self.store_length(native, length, len) {
                        cx.converter.discard_array(&buf, &array.element, len, info.transfer);
                        return Err(err);
                    }
                }
                buf
            }
            _ => cx
                .converter
                .to_native(value, &info.ty, info.transfer, info.nullable, "return value")?,
        };
        store_closure_result(result, &arg, info.ty.ffi_type());
        Ok(())
    }

    unsafe fn write_out(
        &self,
        cx: &ContextInner,
        native: &[*const c_void],
        index: usize,
        value: &ScriptValue,
    ) -> Result<()> {
        let info = self.desc.arg(index);
        let target = *(native[index + self.offset()] as *const *mut c_void);
        if target.is_null() {
            return Ok(());
        }

        match (self.classification.kind(index), info.ty.array()) {
            (ParamKind::Array, Some(array)) => {
                let (buf, len) = cx.converter.array_to_native(
                    value,
                    &array.element,
                    info.transfer,
                    info.nullable,
                    &info.name,
                )?;
                if let Some(length) = array.length {
                    if let Err(err) = self.store_length(native, length, len) {
                        cx.converter.discard_array(&buf, &array.element, len, info.transfer);
                        return Err(err);
                    }
                }
                buf.store(target, FfiType::Pointer);
            }
            _ => {
                let arg = cx
                    .converter
                    .to_native(value, &info.ty, info.transfer, info.nullable, &info.name)?;
                arg.store(target, info.ty.ffi_type());
            }
        }
        Ok(())
    }

    /// Write an array length through an output length parameter
    unsafe fn store_length(&self, native: &[*const c_void], index: usize, len: usize) -> Result<()> {
        let info = self.desc.arg(index);
        let arg = length_to_native(len, info)?;
        let target = *(native[index + self.offset()] as *const *mut c_void);
        if !target.is_null() {
            arg.store(target, info.ty.ffi_type());
        }
        Ok(())
    }

    unsafe fn fail(&self, cx: &ContextInner, result: *mut u64, native: &[*const c_void], err: BridgeError) {
        self.store_default(result);

        match err {
            BridgeError::Uncatchable { exit_code } => {
                if cx.is_shut_down() {
                    return;
                }
                match exit_code {
                    Some(code) => cx.terminator.exit(code),
                    None => {
                        let reason = format!(
                            "Function {} terminated with uncatchable exception",
                            self.desc.name()
                        );
                        error!(target: "trampoline", event = "uncatchable", "{}", reason);
                        cx.terminator.abort(&reason);
                    }
                }
            }
            err => {
                cx.report_exception(&format!("callback {}", self.desc.name()), &err);
                if self.desc.can_throw() {
                    if let Some(slot) = native.last() {
                        let holder = *(*slot as *const *mut *mut NativeError);
                        if !holder.is_null() && (*holder).is_null() {
                            *holder = native_error_for(&err);
                        }
                    }
                }
            }
        }
    }
}

/// Read an In value, or an Inout value through its pointer
unsafe fn read_input(src: *const c_void, info: &ArgInfo) -> NativeArg {
    let ty = info.ty.ffi_type();
    if info.direction == Direction::InOut {
        let target = *(src as *const *const c_void);
        if target.is_null() {
            return NativeArg::zeroed();
        }
        return NativeArg::load(target, ty);
    }
    NativeArg::load(src, ty)
}
