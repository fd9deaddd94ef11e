//! introspect-bridge - reflection-driven boundary between a script runtime
//! and native code
//!
//! Script code calls native functions described only by runtime
//! reflection data, native code calls back into script functions through
//! generated entry points, and native refcounted objects stay consistent
//! with their garbage-collected wrappers through toggle references.

pub mod config;
pub mod context;
pub mod error;
pub mod ffi;
pub mod gc;
pub mod interop;
pub mod logging;
pub mod value;

// Re-export commonly used items
pub use config::BridgeConfig;
pub use context::{BridgeStats, Context, ContextBuilder};
pub use error::{BridgeError, ProcessTerminator, RecordingTerminator, Result, Terminator};
pub use gc::{Collector, NativeObject, ObjectRef, ShutdownReport, ToggleBridge, Wrapper};
pub use interop::{
    ArgInfo, ArrayInfo, CallableDescriptor, CallableKind, Direction, Function, Library, NativeArg,
    Scope, StructInfo, Trampoline, Transfer, TypeTag,
};
pub use value::{ScriptClosure, ScriptFunction, ScriptValue, StructValue};

/// Install logging from the environment
pub fn init() {
    logging::init();
}

/// Install logging as `config` describes and build a context for the
/// calling thread
pub fn init_with_config(config: BridgeConfig) -> Context {
    logging::init_with_config(config.log_config());
    Context::new(config)
}
