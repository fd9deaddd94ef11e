use introspect_bridge::ffi::{bridge_object_refcount, bridge_object_unref};
use introspect_bridge::interop::CallableDescriptor;
use introspect_bridge::{
    Context, NativeObject, ObjectRef, RecordingTerminator, ScriptValue, Transfer, TypeTag,
};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn context() -> (Context, Arc<RecordingTerminator>) {
    let terminator = Arc::new(RecordingTerminator::new());
    let cx = Context::builder().terminator(terminator.clone()).build();
    (cx, terminator)
}

fn tracked(class: &str) -> (ObjectRef, Arc<AtomicBool>) {
    let freed = Arc::new(AtomicBool::new(false));
    let object = NativeObject::new(class);
    let flag = freed.clone();
    object.set_finalizer(move || flag.store(true, Ordering::SeqCst));
    (object, freed)
}

/// Native code taking its own reference to an object
unsafe extern "C" fn native_keep(object: *mut NativeObject) -> *mut NativeObject {
    introspect_bridge::ffi::bridge_object_ref(object)
}

#[test]
fn test_wrapper_follows_native_sharing() {
    let (cx, terminator) = context();
    let (object, freed) = tracked("Demo.Widget");

    let value = cx.wrap_object(&object);
    assert_eq!(cx.stats().rooted_wrappers, 1);

    drop(object);
    assert_eq!(cx.stats().rooted_wrappers, 0);
    assert_eq!(cx.stats().demotes, 1);

    // Script still holds the wrapper, so the object stays alive
    cx.collect();
    assert!(!freed.load(Ordering::SeqCst));

    drop(value);
    cx.collect();
    assert!(freed.load(Ordering::SeqCst));
    assert!(terminator.aborts().is_empty());
}

#[test]
fn test_native_reference_taken_during_call_roots_wrapper() {
    let (cx, _) = context();
    let (object, freed) = tracked("Demo.Widget");
    let value = cx.wrap_object(&object);
    drop(object);
    assert_eq!(cx.stats().rooted_wrappers, 0);

    let keep = CallableDescriptor::builder("Demo", "keep")
        .arg(introspect_bridge::ArgInfo::new("object", TypeTag::Object("Demo.Widget".into())))
        .returns(TypeTag::Pointer, Transfer::Nothing)
        .address(native_keep as *const c_void);
    let kept = cx.invoke(keep, None, &[value.clone()]).unwrap();
    assert_eq!(cx.stats().promotes, 1);
    assert_eq!(cx.stats().rooted_wrappers, 1);

    let ScriptValue::Pointer(address) = kept else {
        panic!("expected a pointer, got {:?}", kept);
    };
    let raw = address as *mut NativeObject;
    unsafe {
        assert_eq!(bridge_object_refcount(raw), 2);
        bridge_object_unref(raw);
    }
    assert_eq!(cx.stats().rooted_wrappers, 0);

    drop(value);
    cx.collect();
    assert!(freed.load(Ordering::SeqCst));
}

#[test]
fn test_off_thread_release_waits_for_owner() {
    let (cx, _) = context();
    let (object, _) = tracked("Demo.Widget");
    let value = cx.wrap_object(&object);

    thread::spawn(move || drop(object)).join().unwrap();
    assert_eq!(cx.stats().toggle_tasks_queued, 1);
    assert_eq!(cx.stats().rooted_wrappers, 1);

    assert_eq!(cx.run_pending_tasks(), 1);
    assert_eq!(cx.stats().toggle_tasks_run, 1);
    assert_eq!(cx.stats().rooted_wrappers, 0);

    drop(value);
    cx.collect();
}

#[test]
fn test_shutdown_releases_rooted_wrappers() {
    let (cx, terminator) = context();
    let (first, _) = tracked("Demo.First");
    let (second, _) = tracked("Demo.Second");
    let first_value = cx.wrap_object(&first);
    let second_value = cx.wrap_object(&second);

    let report = cx.shutdown();
    assert_eq!(report.released_wrappers, 2);
    assert!(cx.is_shut_down());
    assert!(!first.has_toggle_ref());
    assert_eq!(first.count(), 1);
    assert_eq!(cx.stats().rooted_wrappers, 0);

    // Idempotent
    assert_eq!(cx.shutdown().released_wrappers, 0);

    drop(first_value);
    drop(second_value);
    drop(second);
    assert!(terminator.aborts().is_empty());
}
