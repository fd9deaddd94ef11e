//! Engine context - everything one script engine instance owns
//!
//! Design: the bridge keeps no global mutable state. Deferred trampoline
//! releases, reported exceptions, counters and the toggle bridge all hang
//! off a `Context`, which is bound to the thread that created it.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, ProcessTerminator, Result, Terminator};
use crate::gc::{Collector, ObjectRef, ShutdownReport, ToggleBridge};
use crate::interop::{
    CallPrimitive, CallableDescriptor, Converter, Function, LibffiCaller, Scope, StandardConverter,
    Trampoline,
};
use crate::logging::{debug, log_exception};
use crate::value::{ScriptFunction, ScriptValue};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// Handle to the engine state; cheap to clone, not `Send`
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

pub(crate) struct ContextInner {
    pub(crate) config: BridgeConfig,
    pub(crate) converter: Box<dyn Converter>,
    pub(crate) caller: Box<dyn CallPrimitive>,
    pub(crate) toggles: ToggleBridge,
    pub(crate) terminator: Arc<dyn Terminator>,
    /// Async trampolines that finished running, freed at the next invocation
    completed: RefCell<Vec<Trampoline>>,
    reported: RefCell<Vec<String>>,
    pub(crate) counters: Counters,
    shut_down: Cell<bool>,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub calls_made: Cell<usize>,
    pub native_errors: Cell<usize>,
    pub marshaling_errors: Cell<usize>,
    pub trampolines_created: Cell<usize>,
    pub trampolines_released: Cell<usize>,
    pub tasks_run: Cell<usize>,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &Cell<usize>) {
        counter.set(counter.get() + 1);
    }
}

/// Bridge statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub calls_made: usize,
    pub native_errors: usize,
    pub marshaling_errors: usize,
    pub trampolines_created: usize,
    pub trampolines_released: usize,
    pub promotes: usize,
    pub demotes: usize,
    pub toggle_tasks_queued: usize,
    pub toggle_tasks_run: usize,
    pub rooted_wrappers: usize,
}

type ConverterFactory = Box<dyn FnOnce(&ToggleBridge) -> Box<dyn Converter>>;

/// Builder for `Context`
pub struct ContextBuilder {
    config: BridgeConfig,
    terminator: Option<Arc<dyn Terminator>>,
    caller: Option<Box<dyn CallPrimitive>>,
    converter: Option<ConverterFactory>,
}

impl ContextBuilder {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Replace the native-call primitive
    pub fn caller(mut self, caller: impl CallPrimitive + 'static) -> Self {
        self.caller = Some(Box::new(caller));
        self
    }

    /// Replace the conversion collaborator; it may keep the toggle bridge
    pub fn converter_with<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&ToggleBridge) -> Box<dyn Converter> + 'static,
    {
        self.converter = Some(Box::new(factory));
        self
    }

    /// Context owned by the calling thread
    pub fn build(self) -> Context {
        let terminator = self
            .terminator
            .unwrap_or_else(|| Arc::new(ProcessTerminator));
        let collector = Arc::new(Collector::new());
        let toggles = ToggleBridge::new(collector, terminator.clone(), self.config.toggle.task_batch);

        let converter = match self.converter {
            Some(factory) => factory(&toggles),
            None => Box::new(StandardConverter::new(toggles.clone())),
        };

        debug!(event = "context_new", "Bridge context created");
        Context {
            inner: Rc::new(ContextInner {
                config: self.config,
                converter,
                caller: self.caller.unwrap_or_else(|| Box::new(LibffiCaller)),
                toggles,
                terminator,
                completed: RefCell::new(Vec::new()),
                reported: RefCell::new(Vec::new()),
                counters: Counters::default(),
                shut_down: Cell::new(false),
            }),
        }
    }
}

impl Context {
    pub fn new(config: BridgeConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder {
            config: BridgeConfig::default(),
            terminator: None,
            caller: None,
            converter: None,
        }
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Rc<ContextInner> {
        &self.inner
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn toggles(&self) -> &ToggleBridge {
        &self.inner.toggles
    }

    pub fn collector(&self) -> &Arc<Collector> {
        self.inner.toggles.collector()
    }

    /// Script function object for `desc`, with classification and call
    /// interface prepared once
    pub fn function(&self, desc: impl Into<Arc<CallableDescriptor>>) -> Result<Function> {
        Function::new(self.clone(), desc.into())
    }

    /// Invoke without keeping a `Function` around
    pub fn invoke(
        &self,
        desc: impl Into<Arc<CallableDescriptor>>,
        receiver: Option<&ScriptValue>,
        args: &[ScriptValue],
    ) -> Result<ScriptValue> {
        self.function(desc)?.invoke(receiver, args)
    }

    /// Native entry point forwarding to `function`
    pub fn make_trampoline(
        &self,
        desc: impl Into<Arc<CallableDescriptor>>,
        function: Rc<dyn ScriptFunction>,
        scope: Scope,
        is_vfunc: bool,
    ) -> Result<Trampoline> {
        Trampoline::new(&self.inner, desc.into(), function, scope, is_vfunc)
    }

    /// Script value for a native object, associating a wrapper if needed
    pub fn wrap_object(&self, object: &ObjectRef) -> ScriptValue {
        ScriptValue::Object(self.inner.toggles.wrap(object))
    }

    /// Run toggle tasks queued by other threads
    pub fn run_pending_tasks(&self) -> usize {
        let ran = self.inner.toggles.run_pending();
        let tasks = &self.inner.counters.tasks_run;
        tasks.set(tasks.get() + ran);
        ran
    }

    /// Sweep wrappers the bridge stopped holding
    pub fn collect(&self) -> usize {
        self.inner.toggles.collector().collect()
    }

    pub fn drain_completed_trampolines(&self) -> usize {
        self.inner.drain_completed_trampolines()
    }

    /// Texts of exceptions reported from callbacks since the last call
    pub fn take_reported_exceptions(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.reported.borrow_mut())
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.inner.counters;
        let toggles = self.inner.toggles.stats();
        BridgeStats {
            calls_made: c.calls_made.get(),
            native_errors: c.native_errors.get(),
            marshaling_errors: c.marshaling_errors.get(),
            trampolines_created: c.trampolines_created.get(),
            trampolines_released: c.trampolines_released.get(),
            promotes: toggles.promotes,
            demotes: toggles.demotes,
            toggle_tasks_queued: toggles.tasks_queued,
            toggle_tasks_run: c.tasks_run.get(),
            rooted_wrappers: toggles.rooted,
        }
    }

    /// Orderly shutdown: drain deferred work, then drop every strong hold
    pub fn shutdown(&self) -> ShutdownReport {
        if self.inner.shut_down.replace(true) {
            return ShutdownReport::default();
        }
        self.inner.drain_completed_trampolines();
        let report = self.inner.toggles.prepare_shutdown();
        let tasks = &self.inner.counters.tasks_run;
        tasks.set(tasks.get() + report.drained_tasks);
        report
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl ContextInner {
    pub(crate) fn drain_completed_trampolines(&self) -> usize {
        let completed = std::mem::take(&mut *self.completed.borrow_mut());
        let count = completed.len();
        // Dropped outside the borrow: a release can re-enter the context
        drop(completed);
        count
    }

    pub(crate) fn defer_release(&self, trampoline: Trampoline) {
        self.completed.borrow_mut().push(trampoline);
    }

    pub(crate) fn report_exception(&self, context: &str, err: &BridgeError) {
        let message = err.to_string();
        log_exception(context, &message);
        if self.config.trampoline.report_exceptions {
            self.reported.borrow_mut().push(message);
        }
    }

    /// Terminate on an uncatchable error, then hand the error back
    pub(crate) fn escalate(&self, err: BridgeError) -> BridgeError {
        if let BridgeError::Uncatchable { exit_code } = err {
            self.terminator.exit(exit_code.unwrap_or(1));
        }
        err
    }

    #[inline]
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.get()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("stats", &self.stats())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
