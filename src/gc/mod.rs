//! Object lifetime bridge - toggle references + keep-alive roots
//!
//! Design: native objects are refcounted and may be touched from any
//! thread; script wrappers are collected by the engine on the owner
//! thread. A toggle reference per object tells the bridge when native
//! code stops (or starts) sharing the object, and the bridge moves the
//! wrapper between strong (rooted) and weak (collectable) accordingly.

mod collector;
mod object;
mod queue;
mod roots;
mod toggle;
mod wrapper;

#[cfg(test)]
mod tests;

pub use collector::{Collector, CollectorStats, SweepGuard};
pub use object::{Binding, NativeObject, ObjectPtr, ObjectRef, Toggle, ToggleObserver, ToggleState};
pub use queue::{Priority, Task, TaskQueue};
pub use toggle::{ShutdownReport, ToggleBridge, ToggleStats};
pub use wrapper::Wrapper;
