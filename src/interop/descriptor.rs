//! Reflection metadata describing a native callable
//!
//! Descriptors are immutable once built and shared behind `Arc`; a
//! `Function` or `Trampoline` holds one for as long as it lives.

use super::library::Library;
use super::types::{Direction, Scope, Transfer, TypeTag};
use crate::error::{BridgeError, Result};
use core::ffi::c_void;
use std::sync::Arc;

/// Entry point of a native function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeAddress(*const c_void);

impl CodeAddress {
    #[inline]
    pub fn new(ptr: *const c_void) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self(ptr))
        }
    }

    #[inline]
    pub fn as_ptr(self) -> *const c_void {
        self.0
    }
}

// Code addresses are immutable text pointers
unsafe impl Send for CodeAddress {}
unsafe impl Sync for CodeAddress {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    Function,
    Method,
    Constructor,
    VirtualMethod,
    Callback,
}

/// Reflected parameter
#[derive(Debug, Clone)]
pub struct ArgInfo {
    pub name: String,
    pub ty: TypeTag,
    pub direction: Direction,
    pub transfer: Transfer,
    pub nullable: bool,
    pub caller_allocates: bool,
    /// Validity of a callback argument
    pub scope: Scope,
    /// Index of the user-data parameter paired with this callback
    pub closure: Option<usize>,
    /// Index of the destroy-notify parameter paired with this callback
    pub destroy: Option<usize>,
}

impl ArgInfo {
    pub fn new(name: &str, ty: TypeTag) -> Self {
        Self {
            name: name.to_string(),
            ty,
            direction: Direction::In,
            transfer: Transfer::Nothing,
            nullable: false,
            caller_allocates: false,
            scope: Scope::PerCall,
            closure: None,
            destroy: None,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn transfer(mut self, transfer: Transfer) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn caller_allocates(mut self) -> Self {
        self.caller_allocates = true;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn closure(mut self, index: usize) -> Self {
        self.closure = Some(index);
        self
    }

    pub fn destroy(mut self, index: usize) -> Self {
        self.destroy = Some(index);
        self
    }
}

/// Reflected return value
#[derive(Debug, Clone)]
pub struct ReturnInfo {
    pub ty: TypeTag,
    pub transfer: Transfer,
    pub nullable: bool,
}

impl Default for ReturnInfo {
    fn default() -> Self {
        Self {
            ty: TypeTag::Void,
            transfer: Transfer::Nothing,
            nullable: false,
        }
    }
}

/// Receiver of a method call
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    /// One of `Struct`, `Union` or `Object`
    pub ty: TypeTag,
    pub transfer: Transfer,
}

/// Immutable reflection handle for one callable
#[derive(Debug, Clone)]
pub struct CallableDescriptor {
    namespace: String,
    container: Option<String>,
    name: String,
    symbol: String,
    kind: CallableKind,
    args: Vec<ArgInfo>,
    ret: ReturnInfo,
    instance: Option<InstanceInfo>,
    throws: bool,
    address: Option<CodeAddress>,
}

impl CallableDescriptor {
    pub fn builder(namespace: &str, name: &str) -> DescriptorBuilder {
        DescriptorBuilder::new(namespace, name)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[inline]
    pub fn kind(&self) -> CallableKind {
        self.kind
    }

    #[inline]
    pub fn args(&self) -> &[ArgInfo] {
        &self.args
    }

    #[inline]
    pub fn arg(&self, index: usize) -> &ArgInfo {
        &self.args[index]
    }

    #[inline]
    pub fn n_args(&self) -> usize {
        self.args.len()
    }

    #[inline]
    pub fn return_info(&self) -> &ReturnInfo {
        &self.ret
    }

    pub fn instance(&self) -> Option<&InstanceInfo> {
        self.instance.as_ref()
    }

    /// Whether the callee reports failure through a trailing error slot
    #[inline]
    pub fn can_throw(&self) -> bool {
        self.throws
    }

    pub fn address(&self) -> Option<CodeAddress> {
        self.address
    }

    /// Name used in error messages
    pub fn display_name(&self) -> String {
        match (&self.instance, &self.container) {
            (Some(_), Some(container)) => {
                format!("method {}.{}.{}", self.namespace, container, self.name)
            }
            _ => format!("function {}.{}", self.namespace, self.name),
        }
    }
}

/// Builder for `CallableDescriptor`
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    desc: CallableDescriptor,
}

impl DescriptorBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            desc: CallableDescriptor {
                namespace: namespace.to_string(),
                container: None,
                name: name.to_string(),
                symbol: name.to_string(),
                kind: CallableKind::Function,
                args: Vec::new(),
                ret: ReturnInfo::default(),
                instance: None,
                throws: false,
                address: None,
            },
        }
    }

    pub fn kind(mut self, kind: CallableKind) -> Self {
        self.desc.kind = kind;
        self
    }

    pub fn symbol(mut self, symbol: &str) -> Self {
        self.desc.symbol = symbol.to_string();
        self
    }

    /// Method on `container` whose receiver has type `ty`
    pub fn method(mut self, container: &str, ty: TypeTag, transfer: Transfer) -> Self {
        if self.desc.kind == CallableKind::Function {
            self.desc.kind = CallableKind::Method;
        }
        self.desc.container = Some(container.to_string());
        self.desc.instance = Some(InstanceInfo { ty, transfer });
        self
    }

    pub fn arg(mut self, arg: ArgInfo) -> Self {
        self.desc.args.push(arg);
        self
    }

    pub fn returns(mut self, ty: TypeTag, transfer: Transfer) -> Self {
        self.desc.ret = ReturnInfo { ty, transfer, nullable: false };
        self
    }

    pub fn nullable_return(mut self) -> Self {
        self.desc.ret.nullable = true;
        self
    }

    pub fn throws(mut self) -> Self {
        self.desc.throws = true;
        self
    }

    pub fn address(mut self, ptr: *const c_void) -> Self {
        self.desc.address = CodeAddress::new(ptr);
        self
    }

    /// Look the symbol up in `library`
    pub fn resolve(mut self, library: &Library) -> Result<Self> {
        let address = library.symbol(&self.desc.symbol)?;
        self.desc.address = Some(address);
        Ok(self)
    }

    pub fn build(self) -> Arc<CallableDescriptor> {
        Arc::new(self.desc)
    }
}

impl From<DescriptorBuilder> for Arc<CallableDescriptor> {
    fn from(builder: DescriptorBuilder) -> Self {
        builder.build()
    }
}

/// Fails with `Unresolved` when the descriptor has no entry point
pub(crate) fn require_address(desc: &CallableDescriptor) -> Result<CodeAddress> {
    desc.address()
        .ok_or_else(|| BridgeError::Unresolved(desc.symbol().to_string()))
}
