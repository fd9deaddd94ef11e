//! Toggle-reference lifecycle bridge
//!
//! Each wrapped object carries one toggle reference owned by its wrapper.
//! While native code holds other references the wrapper is rooted in the
//! keep-alive set (strong); once only the toggle reference remains it is
//! unrooted (weak) and the collector may finalize it.
//!
//! Notifications can arrive on any thread. The owner thread acts on them
//! directly; other threads queue a task for the owner. At most one task
//! per direction may be queued for an object at a time, and a queued task
//! is cancelled if the wrapper is finalized first. Violations of these
//! rules end the process through the `Terminator`.

use super::collector::Collector;
use super::object::{Binding, ObjectPtr, ObjectRef, Toggle, ToggleObserver, ToggleState};
use super::queue::{Priority, Task, TaskQueue};
use super::roots::KeepAlive;
use super::wrapper::Wrapper;
use crate::error::Terminator;
use crate::logging::{error, log_shutdown, log_toggle, log_toggle_queued};
use core::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Owner-thread side of the toggle protocol
#[derive(Clone)]
pub struct ToggleBridge {
    core: Arc<ToggleCore>,
}

pub(crate) struct ToggleCore {
    weak_self: Weak<ToggleCore>,
    hook: Arc<dyn ToggleObserver>,
    destroying: AtomicBool,
    collector: Arc<Collector>,
    keep_alive: KeepAlive,
    queue: TaskQueue,
    terminator: Arc<dyn Terminator>,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    wrapped: AtomicUsize,
    promotes: AtomicUsize,
    demotes: AtomicUsize,
    queued: AtomicUsize,
    disassociated: AtomicUsize,
    resurfaced: AtomicUsize,
}

/// Toggle statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToggleStats {
    pub wrappers_created: usize,
    pub promotes: usize,
    pub demotes: usize,
    pub tasks_queued: usize,
    pub tasks_pending: usize,
    pub rooted: usize,
    pub disassociated: usize,
    pub resurfaced: usize,
}

/// What shutdown had to clean up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained_tasks: usize,
    pub released_wrappers: usize,
}

/// Observer installed as every object's toggle reference
struct ToggleHook {
    core: Weak<ToggleCore>,
}

impl ToggleObserver for ToggleHook {
    fn toggled(&self, object: ObjectPtr, is_last_ref: bool) {
        if let Some(core) = self.core.upgrade() {
            core.toggled(object, is_last_ref);
        }
    }
}

impl ToggleBridge {
    /// Bridge owned by the calling thread
    pub fn new(collector: Arc<Collector>, terminator: Arc<dyn Terminator>, batch: usize) -> Self {
        let core = Arc::new_cyclic(|weak: &Weak<ToggleCore>| ToggleCore {
            weak_self: weak.clone(),
            hook: Arc::new(ToggleHook { core: weak.clone() }),
            destroying: AtomicBool::new(false),
            collector,
            keep_alive: KeepAlive::new(),
            queue: TaskQueue::new(batch),
            terminator,
            counters: Counters::default(),
        });
        Self { core }
    }

    /// Wrapper for `object`, creating and associating one if needed
    ///
    /// # Safety
    /// `object` must be alive; must be called on the owner thread.
    pub unsafe fn wrapper_for(&self, object: ObjectPtr) -> Arc<Wrapper> {
        self.core.wrapper_for(object)
    }

    /// Safe form of `wrapper_for` for a reference the caller holds
    pub fn wrap(&self, object: &ObjectRef) -> Arc<Wrapper> {
        unsafe { self.core.wrapper_for(object.as_ptr()) }
    }

    /// Whether the object's wrapper is held strongly
    pub fn is_rooted(&self, object: &ObjectRef) -> bool {
        self.core.keep_alive.is_rooted(object.as_ptr())
    }

    /// Run toggle tasks queued by other threads
    pub fn run_pending(&self) -> usize {
        self.core.queue.run_pending()
    }

    pub fn pending_tasks(&self) -> usize {
        self.core.queue.pending()
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.core.collector
    }

    pub fn is_destroying(&self) -> bool {
        self.core.destroying.load(Ordering::Acquire)
    }

    /// Drain queued tasks, then release every strong hold
    ///
    /// Toggle notifications are ignored from here on.
    pub fn prepare_shutdown(&self) -> ShutdownReport {
        self.core.prepare_shutdown()
    }

    #[cfg(test)]
    pub(crate) fn notify(&self, object: ObjectPtr, is_last_ref: bool) {
        self.core.toggled(object, is_last_ref);
    }

    pub fn stats(&self) -> ToggleStats {
        let c = &self.core.counters;
        ToggleStats {
            wrappers_created: c.wrapped.load(Ordering::Relaxed),
            promotes: c.promotes.load(Ordering::Relaxed),
            demotes: c.demotes.load(Ordering::Relaxed),
            tasks_queued: c.queued.load(Ordering::Relaxed),
            tasks_pending: self.core.queue.pending(),
            rooted: self.core.keep_alive.len(),
            disassociated: c.disassociated.load(Ordering::Relaxed),
            resurfaced: c.resurfaced.load(Ordering::Relaxed),
        }
    }
}

impl ToggleCore {
    fn abort(&self, reason: String) {
        error!(target: "toggle", event = "toggle_violation", "{}", reason);
        self.terminator.abort(&reason);
    }

    fn toggled(&self, object: ObjectPtr, is_last_ref: bool) {
        let toggle = if is_last_ref { Toggle::Down } else { Toggle::Up };
        let on_owner = self.queue.is_owner_thread();
        log_toggle(object.as_raw() as *const c_void, toggle.as_str(), on_owner);

        if self.destroying.load(Ordering::Acquire) {
            return;
        }

        let state = unsafe { object.get() }.toggle_state();
        match toggle {
            Toggle::Down => {
                if !on_owner {
                    self.queue_toggle(object, Toggle::Down);
                } else if let Some(queued) = queued_description(state) {
                    self.abort(format!(
                        "toggling down object {:p} that's already queued to toggle {}",
                        object.as_raw(),
                        queued
                    ));
                } else {
                    self.handle_toggle_down(object);
                }
            }
            Toggle::Up => {
                if !on_owner || state.is_queued(Toggle::Down) {
                    self.queue_toggle(object, Toggle::Up);
                } else if state.is_queued(Toggle::Up) {
                    self.abort(format!(
                        "toggling up object {:p} that's already queued to toggle up",
                        object.as_raw()
                    ));
                } else if self.collector.is_sweeping() {
                    self.toggle_up_during_sweep(object);
                } else {
                    self.handle_toggle_up(object);
                }
            }
        }
    }

    fn handle_toggle_up(&self, object: ObjectPtr) {
        let wrapper = match &*unsafe { object.get() }.binding() {
            Binding::Bound(weak) => weak.upgrade(),
            Binding::Empty | Binding::Poisoned => None,
        };

        if let Some(wrapper) = wrapper.filter(|w| w.is_associated()) {
            if self.keep_alive.root(object, wrapper) {
                self.counters.promotes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_toggle_down(&self, object: ObjectPtr) {
        if let Some(wrapper) = self.keep_alive.unroot(object) {
            self.counters.demotes.fetch_add(1, Ordering::Relaxed);
            self.collector.release(wrapper);
        }
    }

    /// The engine cannot be entered; a live wrapper waits for the sweep to
    /// end, a dead one gives the object up
    fn toggle_up_during_sweep(&self, object: ObjectPtr) {
        let wrapper = match &*unsafe { object.get() }.binding() {
            Binding::Bound(weak) => Some(weak.upgrade()),
            Binding::Empty | Binding::Poisoned => None,
        };

        match wrapper {
            None => {}
            Some(Some(wrapper)) if !wrapper.is_unreachable() => {
                self.queue_toggle(object, Toggle::Up);
            }
            Some(wrapper) => self.disassociate(object, wrapper),
        }
    }

    fn queue_toggle(&self, object: ObjectPtr, toggle: Toggle) {
        let state = unsafe { object.get() }.toggle_state().clone();
        if !state.mark_queued(toggle) {
            self.abort(format!(
                "toggling {} object {:p} that's already queued to toggle {}",
                toggle.as_str(),
                object.as_raw(),
                toggle.as_str()
            ));
            return;
        }

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        log_toggle_queued(object.as_raw() as *const c_void, toggle.as_str());

        let core = self.weak_self.clone();
        let task: Task = match toggle {
            Toggle::Up => {
                // Keeps the object alive until the task runs
                let hold = unsafe { ObjectRef::retain(object) };
                Box::new(move || {
                    if state.take(Toggle::Up) {
                        if let Some(core) = core.upgrade() {
                            core.handle_toggle_up(hold.as_ptr());
                        }
                    }
                    drop(hold);
                })
            }
            // Cancelled by finalization before the object can go away
            Toggle::Down => Box::new(move || {
                if state.take(Toggle::Down) {
                    if let Some(core) = core.upgrade() {
                        core.handle_toggle_down(object);
                    }
                }
            }),
        };
        self.queue.push(Priority::High, task);
    }

    /// Cut the object loose from a wrapper that is going away
    fn disassociate(&self, object: ObjectPtr, wrapper: Option<Arc<Wrapper>>) {
        let obj = unsafe { object.get() };
        let owned = {
            let mut binding = obj.binding();
            let bound = matches!(*binding, Binding::Bound(_));
            if bound {
                *binding = Binding::Poisoned;
            }
            bound
        };

        if let Some(wrapper) = &wrapper {
            wrapper.detach();
        }
        if let Some(rooted) = self.keep_alive.unroot(object) {
            self.collector.release(rooted);
        }
        if owned {
            unsafe { object.remove_toggle_ref() };
        }
        self.counters.disassociated.fetch_add(1, Ordering::Relaxed);
    }

    /// # Safety
    /// `object` must be alive.
    unsafe fn wrapper_for(&self, object: ObjectPtr) -> Arc<Wrapper> {
        debug_assert!(self.queue.is_owner_thread(), "wrapping off the owner thread");
        let obj = object.get();

        let wrapper = {
            let mut binding = obj.binding();
            match &*binding {
                Binding::Bound(weak) => {
                    if let Some(existing) = weak.upgrade() {
                        return existing;
                    }
                }
                Binding::Poisoned => {
                    error!(
                        target: "toggle",
                        event = "resurfaced",
                        "Object {:p} (a {}) resurfaced after the script wrapper was finalized. \
                         This is some library doing dubious memory management inside dispose()",
                        object.as_raw(),
                        obj.class()
                    );
                    self.counters.resurfaced.fetch_add(1, Ordering::Relaxed);
                }
                Binding::Empty => {}
            }

            let wrapper = Arc::new(Wrapper::new(object, obj.class_name(), self.weak_self.clone()));
            *binding = Binding::Bound(Arc::downgrade(&wrapper));
            wrapper
        };

        unsafe {
            // Temporary hold so installing the toggle ref cannot free the object
            object.inc();
            self.keep_alive.root(object, wrapper.clone());
            object.add_toggle_ref(self.hook.clone());
            object.dec();
        }

        self.counters.wrapped.fetch_add(1, Ordering::Relaxed);
        wrapper
    }

    /// Wrapper finalization: cancel queued work, then give up the toggle ref
    pub(crate) fn finalize_wrapper(&self, object: ObjectPtr, wrapper: *const Wrapper) {
        let obj = unsafe { object.get() };
        let state = obj.toggle_state();
        let had_up = state.take(Toggle::Up);
        let had_down = state.take(Toggle::Down);

        if had_down && !had_up {
            self.abort(format!(
                "Finalizing wrapper for an object that's scheduled to be unrooted: {} {:p}",
                obj.class(),
                object.as_raw()
            ));
        }

        unsafe { finalize_detached(object, wrapper) };
    }

    fn prepare_shutdown(&self) -> ShutdownReport {
        self.destroying.store(true, Ordering::Release);
        let drained_tasks = self.queue.drain_all();

        let mut released_wrappers = 0;
        for (object, wrapper) in self.keep_alive.drain() {
            let owned = {
                let mut binding = unsafe { object.get() }.binding();
                let owned = binding.is_bound_to(Arc::as_ptr(&wrapper));
                if owned {
                    *binding = Binding::Empty;
                }
                owned
            };
            wrapper.detach();
            if owned {
                unsafe { object.remove_toggle_ref() };
            }
            released_wrappers += 1;
        }

        log_shutdown(drained_tasks, released_wrappers);
        ShutdownReport { drained_tasks, released_wrappers }
    }
}

/// Release the toggle ref a finalized wrapper owned
///
/// # Safety
/// `object` must be alive and `wrapper` the address of the finalizing wrapper.
pub(crate) unsafe fn finalize_detached(object: ObjectPtr, wrapper: *const Wrapper) {
    let obj = object.get();
    let owned = {
        let mut binding = obj.binding();
        let owned = binding.is_bound_to(wrapper);
        if owned {
            *binding = if obj.refcount() > 1 { Binding::Poisoned } else { Binding::Empty };
        }
        owned
    };

    if owned {
        object.remove_toggle_ref();
    }
}

fn queued_description(state: &ToggleState) -> Option<&'static str> {
    match (state.is_queued(Toggle::Up), state.is_queued(Toggle::Down)) {
        (true, true) => Some("up and down"),
        (true, false) => Some("up"),
        (false, true) => Some("down"),
        (false, false) => None,
    }
}
