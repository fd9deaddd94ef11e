use introspect_bridge::interop::{CallableDescriptor, CallableKind, DescriptorBuilder};
use introspect_bridge::{
    ArgInfo, BridgeConfig, BridgeError, Context, Direction, Library, RecordingTerminator, Scope,
    ScriptValue, Transfer, TypeTag,
};
use std::cell::RefCell;
use std::ffi::c_void;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

fn context() -> Context {
    Context::builder()
        .terminator(Arc::new(RecordingTerminator::new()))
        .build()
}

fn libc_fn(name: &str) -> DescriptorBuilder {
    let library = Library::this_process().unwrap();
    CallableDescriptor::builder("libc", name).resolve(&library).unwrap()
}

type Visitor = unsafe extern "C" fn(i32, *mut c_void) -> i32;

/// Visits 1..=n, stopping early when the visitor returns non-zero
unsafe extern "C" fn visit_range(n: i32, visit: Visitor, data: *mut c_void) -> i32 {
    for i in 1..=n {
        if visit(i, data) != 0 {
            return i;
        }
    }
    0
}

#[test]
fn test_resolved_libc_calls() {
    let cx = context();

    let strlen = cx
        .function(
            libc_fn("strlen")
                .arg(ArgInfo::new("s", TypeTag::Utf8))
                .returns(TypeTag::UInt64, Transfer::Nothing),
        )
        .unwrap();
    assert_eq!(strlen.invoke(None, &["introspection".into()]).unwrap(), ScriptValue::Int(13));

    let abs = libc_fn("abs")
        .arg(ArgInfo::new("n", TypeTag::Int32))
        .returns(TypeTag::Int32, Transfer::Nothing);
    assert_eq!(cx.invoke(abs, None, &[(-12).into()]).unwrap(), ScriptValue::Int(12));
}

#[test]
fn test_libc_out_parameter() {
    let cx = context();
    let strtol = libc_fn("strtol")
        .arg(ArgInfo::new("nptr", TypeTag::Utf8))
        .arg(ArgInfo::new("endptr", TypeTag::Pointer).direction(Direction::Out))
        .arg(ArgInfo::new("base", TypeTag::Int32))
        .returns(TypeTag::Int64, Transfer::Nothing);

    let result = cx.invoke(strtol, None, &["42abc".into(), 10.into()]).unwrap();
    let items = result.as_array().unwrap();
    assert_eq!(items[0], ScriptValue::Int(42));
    assert!(matches!(items[1], ScriptValue::Pointer(_)));
}

#[test]
fn test_missing_symbol() {
    let library = Library::this_process().unwrap();
    let err = CallableDescriptor::builder("libc", "no_such_symbol_anywhere")
        .resolve(&library)
        .unwrap_err();
    assert!(matches!(err, BridgeError::Symbol(_)));
}

#[test]
fn test_callback_sees_every_value() {
    let cx = context();
    let visitor = CallableDescriptor::builder("Demo", "Visitor")
        .kind(CallableKind::Callback)
        .arg(ArgInfo::new("value", TypeTag::Int32))
        .arg(ArgInfo::new("user_data", TypeTag::Pointer))
        .returns(TypeTag::Boolean, Transfer::Nothing)
        .build();
    let visit = cx
        .function(
            CallableDescriptor::builder("Demo", "visit_range")
                .arg(ArgInfo::new("n", TypeTag::Int32))
                .arg(
                    ArgInfo::new("visit", TypeTag::Callback(visitor))
                        .scope(Scope::PerCall)
                        .closure(2),
                )
                .arg(ArgInfo::new("user_data", TypeTag::Pointer))
                .returns(TypeTag::Int32, Transfer::Nothing)
                .address(visit_range as *const c_void),
        )
        .unwrap();
    assert_eq!(visit.length(), 2);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let record = seen.clone();
    let stop_at_four = ScriptValue::function("stop_at_four", move |_, args| {
        let value = args[0].as_i64().unwrap_or(0);
        record.borrow_mut().push(value);
        Ok(ScriptValue::Boolean(value == 4))
    });

    let result = visit.invoke(None, &[10.into(), stop_at_four]).unwrap();
    assert_eq!(result, ScriptValue::Int(4));
    assert_eq!(*seen.borrow(), vec![1, 2, 3, 4]);

    let stats = cx.stats();
    assert_eq!(stats.trampolines_created, 1);
    assert_eq!(stats.trampolines_released, 1);
}

#[test]
fn test_config_file_drives_context() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[invoke]\nmax_native_arity = 1\n\n[trampoline]\nreport_exceptions = false"
    )
    .unwrap();

    let config = BridgeConfig::load(file.path()).unwrap();
    assert!(!config.trampoline.report_exceptions);

    let cx = Context::builder()
        .config(config)
        .terminator(Arc::new(RecordingTerminator::new()))
        .build();
    let two_args = libc_fn("strtol")
        .arg(ArgInfo::new("nptr", TypeTag::Utf8))
        .arg(ArgInfo::new("endptr", TypeTag::Pointer).direction(Direction::Out));

    let err = cx.function(two_args).unwrap_err();
    assert!(matches!(err, BridgeError::Unsupported(_)));
    assert_eq!(cx.config().invoke.max_native_arity, 1);
}
