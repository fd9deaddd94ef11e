//! Invocation engine - script → native → script for one call
//!
//! Design: a `Function` is prepared once per descriptor (classification,
//! call interface, entry point). Each call then runs through four phases:
//! marshal inputs into a `CallFrame`, call, convert outputs, release.
//! The release phase runs for everything that was marshaled, whichever
//! phase failed.

use super::abi::{native_arity, ReturnSlot, Signature};
use super::classify::{Classification, ParamKind};
use super::descriptor::{
    require_address, ArgInfo, CallableDescriptor, CallableKind, CodeAddress, InstanceInfo,
};
use super::frame::CallFrame;
use super::marshal::length_to_native;
use super::trampoline::{release_trampoline, Trampoline};
use super::types::{Direction, FfiType, NativeArg, Scope, Transfer, TypeTag};
use crate::context::{Context, ContextInner, Counters};
use crate::error::{BridgeError, Result};
use crate::ffi::take_native_error;
use crate::logging::{log_excess_arguments, log_invoke, log_native_error, perf};
use crate::value::{ScriptFunction, ScriptValue};
use core::ffi::c_void;
use std::fmt;
use std::sync::Arc;

/// Script-callable proxy for a native callable
pub struct Function {
    cx: Context,
    desc: Arc<CallableDescriptor>,
    classification: Classification,
    signature: Signature,
    code: CodeAddress,
    name: String,
}

/// How far marshaling got; the release phase covers exactly this much
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    instance: bool,
    params: usize,
}

impl Function {
    pub(crate) fn new(cx: Context, desc: Arc<CallableDescriptor>) -> Result<Self> {
        let code = require_address(&desc)?;

        let arity = native_arity(&desc);
        let max = cx.config().invoke.max_native_arity;
        if arity > max {
            return Err(BridgeError::Unsupported(format!(
                "{} needs {} native arguments, at most {} are supported",
                desc.display_name(),
                arity,
                max
            )));
        }

        let classification = Classification::classify(&desc)?;
        let signature = Signature::for_callable(&desc);
        let name = match desc.kind() {
            CallableKind::VirtualMethod => format!("vfunc_{}", desc.name()),
            _ => desc.name().to_string(),
        };

        Ok(Self { cx, desc, classification, signature, code, name })
    }

    /// Script-visible name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &Arc<CallableDescriptor> {
        &self.desc
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    /// Parameters a script caller supplies
    fn script_params(&self) -> impl Iterator<Item = &ArgInfo> + '_ {
        self.desc
            .args()
            .iter()
            .zip(self.classification.kinds())
            .filter(|(arg, kind)| **kind != ParamKind::Skipped && arg.direction != Direction::Out)
            .map(|(arg, _)| arg)
    }

    /// Declared script arity
    pub fn length(&self) -> usize {
        self.script_params().count()
    }

    pub fn to_source(&self) -> String {
        let args: Vec<&str> = self.script_params().map(|arg| arg.name.as_str()).collect();
        let args = args.join(", ");
        match self.desc.kind() {
            CallableKind::Function => format!(
                "function {}({}) {{\n\t/* proxy for native symbol {}(); */\n}}",
                self.name,
                args,
                self.desc.symbol()
            ),
            _ => format!(
                "function {}({}) {{\n\t/* proxy for native symbol */\n}}",
                self.name, args
            ),
        }
    }

    /// Call with script arguments; the result is undefined, a single value,
    /// or `[return, out1, out2, ...]`
    pub fn invoke(&self, receiver: Option<&ScriptValue>, args: &[ScriptValue]) -> Result<ScriptValue> {
        let (_, values) = self.run(receiver, args, false)?;
        Ok(package(values))
    }

    /// Call and hand back the native return value unconverted; the caller
    /// owns it. Out parameters are converted and released, then dropped.
    pub fn invoke_raw(&self, receiver: Option<&ScriptValue>, args: &[ScriptValue]) -> Result<NativeArg> {
        let (ret, _) = self.run(receiver, args, true)?;
        Ok(ret)
    }

    fn run(
        &self,
        receiver: Option<&ScriptValue>,
        args: &[ScriptValue],
        raw: bool,
    ) -> Result<(NativeArg, Vec<ScriptValue>)> {
        let cx = self.cx.inner();
        cx.drain_completed_trampolines();
        let _perf = perf::track("invoke");

        let expected = self.classification.expected_inputs();
        if args.len() < expected {
            return Err(BridgeError::Arity {
                function: self.desc.display_name(),
                expected,
                got: args.len(),
            });
        }
        if args.len() > expected && cx.config.invoke.warn_excess_arguments {
            log_excess_arguments(&self.desc.display_name(), expected, args.len());
        }

        let mut frame = CallFrame::new(
            self.desc.n_args(),
            self.desc.instance().is_some(),
            self.desc.can_throw(),
        );
        let mut progress = Progress::default();

        if let Err(err) = self.marshal(cx, &mut frame, receiver, args, &mut progress) {
            self.release(cx, &frame, progress, false);
            Counters::bump(&cx.counters.marshaling_errors);
            return Err(cx.escalate(err));
        }

        for trampoline in frame.trampolines.iter().flatten() {
            if trampoline.scope() != Scope::PerCall {
                trampoline.pin();
            }
        }
        frame.finalize_pointers();

        log_invoke(&self.name, args.len(), frame.ffi_args.len());
        Counters::bump(&cx.counters.calls_made);

        let mut slot = ReturnSlot::zeroed();
        unsafe {
            cx.caller
                .call(&self.signature, self.code, slot.as_mut_ptr(), &mut frame.ffi_args);
        }
        let ret = slot.into_arg(self.signature.return_type());

        if let Some(error) = frame.take_error() {
            let err = unsafe { take_native_error(error) };
            self.release(cx, &frame, progress, true);
            Counters::bump(&cx.counters.native_errors);
            if let BridgeError::Native { code, message, .. } = &err {
                log_native_error(&self.name, *code, message);
            }
            return Err(err);
        }

        let outputs = self.convert_outputs(cx, &frame, &ret, raw);
        self.release(cx, &frame, progress, true);

        match outputs {
            Ok(values) => Ok((ret, values)),
            Err(err) => {
                Counters::bump(&cx.counters.marshaling_errors);
                Err(cx.escalate(err))
            }
        }
    }

    fn marshal(
        &self,
        cx: &std::rc::Rc<ContextInner>,
        frame: &mut CallFrame,
        receiver: Option<&ScriptValue>,
        args: &[ScriptValue],
        progress: &mut Progress,
    ) -> Result<()> {
        if let Some(instance) = self.desc.instance() {
            frame.in_args[0] = self.marshal_instance(cx, instance, receiver)?;
            progress.instance = true;
        }

        let mut next = args.iter();
        for (i, info) in self.desc.args().iter().enumerate() {
            let slot = frame.slot(i);
            match self.classification.kind(i) {
                ParamKind::Skipped => {
                    if info.direction == Direction::Out {
                        frame.set_out_pointer(slot);
                    }
                }
                ParamKind::Callback => {
                    let value = next_arg(&mut next);
                    self.marshal_callback(cx, frame, i, info, value)?;
                }
                ParamKind::Array if info.direction == Direction::Out => {
                    frame.set_out_pointer(slot);
                    if let Some(length) = info.ty.array().and_then(|a| a.length) {
                        frame.set_out_pointer(frame.slot(length));
                    }
                }
                ParamKind::Array => {
                    let value = next_arg(&mut next);
                    self.marshal_array(cx, frame, i, info, value)?;
                }
                ParamKind::Normal => match info.direction {
                    Direction::Out => marshal_out(frame, slot, info)?,
                    Direction::In => {
                        let value = next_arg(&mut next);
                        frame.in_args[slot] = cx.converter.to_native(
                            value,
                            &info.ty,
                            info.transfer,
                            info.nullable,
                            &info.name,
                        )?;
                    }
                    Direction::InOut => {
                        let value = next_arg(&mut next);
                        let arg = cx.converter.to_native(
                            value,
                            &info.ty,
                            info.transfer,
                            info.nullable,
                            &info.name,
                        )?;
                        frame.inout_snapshot(slot, arg);
                    }
                },
            }
            progress.params = i + 1;
        }
        Ok(())
    }

    fn marshal_instance(
        &self,
        cx: &ContextInner,
        instance: &InstanceInfo,
        receiver: Option<&ScriptValue>,
    ) -> Result<NativeArg> {
        let receiver = receiver.ok_or_else(|| {
            BridgeError::Type(format!("Missing receiver for {}", self.desc.display_name()))
        })?;

        if let TypeTag::Struct(info) | TypeTag::Union(info) = &instance.ty {
            if instance.transfer == Transfer::Everything && !info.boxed {
                return Err(BridgeError::Type(
                    "Cannot transfer ownership of instance argument for non boxed structure"
                        .to_string(),
                ));
            }
        }

        cx.converter
            .to_native(receiver, &instance.ty, instance.transfer, false, "instance")
    }

    fn marshal_callback(
        &self,
        cx: &std::rc::Rc<ContextInner>,
        frame: &mut CallFrame,
        index: usize,
        info: &ArgInfo,
        value: &ScriptValue,
    ) -> Result<()> {
        let TypeTag::Callback(callback) = &info.ty else {
            return Err(BridgeError::Unsupported(format!(
                "Argument {} is not a callback",
                info.name
            )));
        };

        match value {
            ScriptValue::Function(function) => {
                let trampoline =
                    Trampoline::new(cx, callback.clone(), function.clone(), info.scope, false)?;
                let slot = frame.slot(index);
                frame.in_args[slot] = NativeArg::from_ptr(trampoline.code() as *mut c_void);
                if let Some(closure) = info.closure {
                    let slot = frame.slot(closure);
                    frame.in_args[slot] = NativeArg::from_ptr(trampoline.user_data());
                }
                if let Some(destroy) = info.destroy {
                    let thunk: unsafe extern "C" fn(*mut c_void) = release_trampoline;
                    let slot = frame.slot(destroy);
                    frame.in_args[slot] = NativeArg::from_ptr(thunk as *mut c_void);
                }
                frame.trampolines[index] = Some(trampoline);
                Ok(())
            }
            v if v.is_null_or_undefined() && info.nullable => Ok(()),
            v if v.is_null_or_undefined() => Err(BridgeError::Type(format!(
                "Argument {} may not be null",
                info.name
            ))),
            other => Err(BridgeError::Type(format!(
                "Expected function for callback argument {}, got {}",
                info.name,
                other.type_name()
            ))),
        }
    }

    fn marshal_array(
        &self,
        cx: &ContextInner,
        frame: &mut CallFrame,
        index: usize,
        info: &ArgInfo,
        value: &ScriptValue,
    ) -> Result<()> {
        let Some((array, length)) = info.ty.array().and_then(|a| Some((a, a.length?))) else {
            return Err(BridgeError::Unsupported(format!(
                "Argument {} has no length parameter",
                info.name
            )));
        };
        let len_info = self.desc.arg(length);
        let (slot, len_slot) = (frame.slot(index), frame.slot(length));

        let (buf, count) = cx.converter.array_to_native(
            value,
            &array.element,
            info.transfer,
            info.nullable,
            &info.name,
        )?;
        let len = match length_to_native(count, len_info) {
            Ok(len) => len,
            Err(err) => {
                cx.converter.discard_array(&buf, &array.element, count, info.transfer);
                return Err(err);
            }
        };

        if info.direction == Direction::InOut {
            frame.inout_snapshot(slot, buf);
            if buf.as_ptr().is_null() {
                // A null array travels with a null length pointer
                frame.out_args[len_slot] = len;
                frame.originals[len_slot] = len;
                frame.in_args[len_slot] = NativeArg::zeroed();
            } else {
                frame.inout_snapshot(len_slot, len);
            }
        } else {
            frame.in_args[slot] = buf;
            frame.in_args[len_slot] = len;
        }
        Ok(())
    }

    /// Length of an array, read from the parameter at `index`
    fn read_length(&self, frame: &CallFrame, index: usize) -> usize {
        let info = self.desc.arg(index);
        let slot = frame.slot(index);
        let arg = if info.direction.is_output() {
            frame.out_args[slot]
        } else {
            frame.in_args[slot]
        };
        arg.to_length(info.ty.ffi_type())
    }

    fn convert_outputs(
        &self,
        cx: &ContextInner,
        frame: &CallFrame,
        ret: &NativeArg,
        raw: bool,
    ) -> Result<Vec<ScriptValue>> {
        let converter = &cx.converter;
        let mut values = Vec::with_capacity(self.classification.expected_outputs());

        let info = self.desc.return_info();
        if !raw && !info.ty.is_void() {
            let value = match info.ty.array() {
                Some(array) if array.length.is_some() => {
                    let len = array.length.map_or(0, |length| self.read_length(frame, length));
                    let value = converter.array_to_script(ret, &array.element, len, info.transfer)?;
                    converter.release_out_array(ret, &array.element, len, info.transfer);
                    value
                }
                _ => {
                    let value = converter.to_script(ret, &info.ty, info.transfer)?;
                    converter.release_out(ret, &info.ty, info.transfer);
                    value
                }
            };
            values.push(value);
        }

        for (i, info) in self.desc.args().iter().enumerate() {
            let kind = self.classification.kind(i);
            if kind == ParamKind::Skipped || !info.direction.is_output() {
                continue;
            }

            let arg = &frame.out_args[frame.slot(i)];
            let value = match (kind, info.ty.array()) {
                _ if is_caller_allocated(kind, info) => {
                    // Copied; the block itself goes in the release phase
                    converter.to_script(arg, &info.ty, Transfer::Nothing)?
                }
                (ParamKind::Array, Some(array)) => {
                    let len = array.length.map_or(0, |length| self.read_length(frame, length));
                    let value = converter.array_to_script(arg, &array.element, len, info.transfer)?;
                    converter.release_out_array(arg, &array.element, len, info.transfer);
                    value
                }
                _ => {
                    let value = converter.to_script(arg, &info.ty, info.transfer)?;
                    converter.release_out(arg, &info.ty, info.transfer);
                    value
                }
            };
            values.push(value);
        }

        Ok(values)
    }

    /// Free inputs and caller-allocated blocks; `called` tells whether the
    /// callee saw the inputs (ownership may have moved) or not
    fn release(&self, cx: &ContextInner, frame: &CallFrame, progress: Progress, called: bool) {
        let converter = &cx.converter;

        if progress.instance {
            if let Some(instance) = self.desc.instance() {
                if called {
                    converter.release_in(&frame.in_args[0], &instance.ty, instance.transfer);
                } else {
                    converter.discard(&frame.in_args[0], &instance.ty, instance.transfer);
                }
            }
        }

        for (i, info) in self.desc.args().iter().enumerate().take(progress.params) {
            let kind = self.classification.kind(i);
            let slot = frame.slot(i);

            if is_caller_allocated(kind, info) {
                unsafe { libc::free(frame.out_args[slot].as_ptr()) };
                continue;
            }
            if !info.direction.is_input() {
                continue;
            }

            // The engine allocated what an Inout slot held before the call
            let (arg, transfer) = match info.direction {
                Direction::InOut if called => {
                    if callee_owns_original(frame, slot, info) {
                        continue;
                    }
                    (&frame.originals[slot], Transfer::Nothing)
                }
                Direction::InOut => (&frame.originals[slot], info.transfer),
                _ => (&frame.in_args[slot], info.transfer),
            };

            match kind {
                ParamKind::Skipped | ParamKind::Callback => {}
                ParamKind::Array => {
                    let Some((array, length)) = info.ty.array().and_then(|a| Some((a, a.length?)))
                    else {
                        continue;
                    };
                    let len_info = self.desc.arg(length);
                    let len_slot = frame.slot(length);
                    let len = match info.direction {
                        Direction::InOut => &frame.originals[len_slot],
                        _ => &frame.in_args[len_slot],
                    }
                    .to_length(len_info.ty.ffi_type());

                    if called {
                        converter.release_in_array(arg, &array.element, len, transfer);
                    } else {
                        converter.discard_array(arg, &array.element, len, transfer);
                    }
                }
                ParamKind::Normal => {
                    if called {
                        converter.release_in(arg, &info.ty, transfer);
                    } else {
                        converter.discard(arg, &info.ty, transfer);
                    }
                }
            }
        }
    }
}

impl ScriptFunction for Function {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, this: Option<&ScriptValue>, args: &[ScriptValue]) -> Result<ScriptValue> {
        self.invoke(this, args)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_source())
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("symbol", &self.desc.symbol())
            .field("signature", &self.signature)
            .finish()
    }
}

/// Arity is checked up front, so a missing value here is never reached
fn next_arg<'a>(args: &mut std::slice::Iter<'a, ScriptValue>) -> &'a ScriptValue {
    const UNDEFINED: &ScriptValue = &ScriptValue::Undefined;
    args.next().unwrap_or(UNDEFINED)
}

fn is_caller_allocated(kind: ParamKind, info: &ArgInfo) -> bool {
    kind == ParamKind::Normal && info.direction == Direction::Out && info.caller_allocates
}

fn marshal_out(frame: &mut CallFrame, slot: usize, info: &ArgInfo) -> Result<()> {
    if !info.caller_allocates {
        frame.set_out_pointer(slot);
        return Ok(());
    }

    let size = match &info.ty {
        TypeTag::Struct(s) | TypeTag::Union(s) => s.size,
        other => {
            return Err(BridgeError::Unsupported(format!(
                "Unsupported type {} for (out caller-allocates)",
                other
            )));
        }
    };
    let block = unsafe { libc::calloc(1, size.max(1)) };
    if block.is_null() {
        return Err(BridgeError::Uncatchable { exit_code: None });
    }
    frame.in_args[slot] = NativeArg::from_ptr(block);
    frame.out_args[slot] = NativeArg::from_ptr(block);
    Ok(())
}

/// Whether the callee took the Inout value it was given: always with full
/// transfer, or when it handed the same buffer back as its output
fn callee_owns_original(frame: &CallFrame, slot: usize, info: &ArgInfo) -> bool {
    match info.transfer {
        Transfer::Nothing => false,
        Transfer::Everything => true,
        Transfer::Container => {
            info.ty.ffi_type() == FfiType::Pointer
                && !frame.originals[slot].as_ptr().is_null()
                && frame.out_args[slot].as_ptr() == frame.originals[slot].as_ptr()
        }
    }
}

/// Zero outputs → undefined, one → itself, more → a sequence
fn package(mut values: Vec<ScriptValue>) -> ScriptValue {
    match values.len() {
        0 => ScriptValue::Undefined,
        1 => values.swap_remove(0),
        _ => ScriptValue::Array(values),
    }
}
