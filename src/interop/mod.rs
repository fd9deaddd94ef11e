//! Native interop - reflection-driven calls in both directions
//!
//! Design: descriptors describe callables; the classifier tags their
//! parameters once; `Function` drives script → native calls through a
//! `CallPrimitive` and a `Converter`; `Trampoline` generates native entry
//! points that call back into script.

mod abi;
mod call;
mod classify;
mod descriptor;
mod frame;
mod invoke;
mod library;
mod marshal;
mod trampoline;
mod types;


pub use abi::{native_arity, store_closure_result, ReturnSlot, Signature};
pub use call::{CallPrimitive, LibffiCaller};
pub use classify::{Classification, ParamKind};
pub use descriptor::{
    ArgInfo, CallableDescriptor, CallableKind, CodeAddress, DescriptorBuilder, InstanceInfo,
    ReturnInfo,
};
pub use invoke::Function;
pub use library::{Library, LoadError, SymbolError};
pub use marshal::{Converter, StandardConverter};
pub use trampoline::{release_trampoline, Trampoline};
pub use types::{ArrayInfo, Direction, FfiType, NativeArg, Scope, StructInfo, Transfer, TypeTag};
