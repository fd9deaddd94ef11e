//! Tests for the object lifetime bridge

use super::*;
use crate::error::RecordingTerminator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn bridge() -> (ToggleBridge, Arc<RecordingTerminator>) {
    let terminator = Arc::new(RecordingTerminator::new());
    let bridge = ToggleBridge::new(Arc::new(Collector::new()), terminator.clone(), 0);
    (bridge, terminator)
}

/// Object whose destruction flips the returned flag
fn tracked(class: &str) -> (ObjectRef, Arc<AtomicBool>) {
    let freed = Arc::new(AtomicBool::new(false));
    let object = NativeObject::new(class);
    let flag = freed.clone();
    object.set_finalizer(move || flag.store(true, Ordering::SeqCst));
    (object, freed)
}

#[cfg(test)]
mod object_tests {
    use super::*;

    #[test]
    fn test_object_new() {
        let (object, freed) = tracked("Demo.Thing");
        assert_eq!(object.count(), 1);
        assert_eq!(object.class(), "Demo.Thing");
        assert!(!object.has_toggle_ref());

        drop(object);
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_object_clone_and_drop() {
        let (object, freed) = tracked("Demo.Thing");
        let second = object.clone();
        assert_eq!(object.count(), 2);

        drop(second);
        assert_eq!(object.count(), 1);
        assert!(!freed.load(Ordering::SeqCst));

        drop(object);
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_into_raw_from_raw() {
        let (object, freed) = tracked("Demo.Thing");
        let raw = object.into_raw();
        assert!(!freed.load(Ordering::SeqCst));

        let ptr = unsafe { ObjectPtr::from_raw(raw) }.unwrap();
        drop(unsafe { ObjectRef::from_raw(ptr) });
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_toggle_state_flags() {
        let state = ToggleState::default();
        assert!(state.mark_queued(Toggle::Up));
        assert!(!state.mark_queued(Toggle::Up));
        assert!(state.is_queued(Toggle::Up));
        assert!(!state.is_queued(Toggle::Down));

        assert!(state.take(Toggle::Up));
        assert!(!state.take(Toggle::Up));
    }
}

#[cfg(test)]
mod queue_tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_high_priority_runs_first() {
        let queue = TaskQueue::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (priority, tag) in [(Priority::Default, "default"), (Priority::High, "high")] {
            let order = order.clone();
            queue.push(priority, Box::new(move || order.lock().push(tag)));
        }

        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.run_pending(), 2);
        assert_eq!(*order.lock(), vec!["high", "default"]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_batch_limit() {
        let queue = TaskQueue::new(2);
        for _ in 0..5 {
            queue.push(Priority::Default, Box::new(|| {}));
        }

        assert_eq!(queue.run_pending(), 2);
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.drain_all(), 3);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_push_from_other_thread() {
        let queue = Arc::new(TaskQueue::new(0));
        let ran = Arc::new(AtomicBool::new(false));

        let q = queue.clone();
        let flag = ran.clone();
        thread::spawn(move || {
            q.push(Priority::High, Box::new(move || flag.store(true, Ordering::SeqCst)));
            // Only the owner executes tasks
            assert_eq!(q.run_pending(), 0);
        })
        .join()
        .unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(queue.run_pending(), 1);
        assert!(ran.load(Ordering::SeqCst));
    }
}

#[cfg(test)]
mod toggle_tests {
    use super::*;

    #[test]
    fn test_wrap_shared_object_is_rooted() {
        let (bridge, _) = bridge();
        let (object, _) = tracked("Demo.Thing");

        let wrapper = bridge.wrap(&object);
        // caller's reference + toggle reference
        assert_eq!(object.count(), 2);
        assert!(object.has_toggle_ref());
        assert!(bridge.is_rooted(&object));
        assert_eq!(wrapper.class(), "Demo.Thing");
        assert_eq!(wrapper.object(), Some(object.as_ptr()));
    }

    #[test]
    fn test_wrap_returns_existing_wrapper() {
        let (bridge, _) = bridge();
        let (object, _) = tracked("Demo.Thing");

        let first = bridge.wrap(&object);
        let second = bridge.wrap(&object);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bridge.stats().wrappers_created, 1);
    }

    #[test]
    fn test_full_lifecycle() {
        let (bridge, terminator) = bridge();
        let (object, freed) = tracked("Demo.Thing");
        let collector = bridge.collector().clone();

        let wrapper = bridge.wrap(&object);
        assert!(bridge.is_rooted(&object));

        // Native side lets go: only the toggle reference remains
        drop(object);
        assert_eq!(bridge.stats().demotes, 1);
        assert_eq!(collector.pending(), 1);
        assert!(!freed.load(Ordering::SeqCst));

        // Script side lets go, then the collector sweeps
        drop(wrapper);
        assert_eq!(collector.collect(), 1);
        assert!(freed.load(Ordering::SeqCst));
        assert!(terminator.aborts().is_empty());
    }

    #[test]
    fn test_weak_wrapper_promoted_when_shared_again() {
        let (bridge, _) = bridge();
        let (object, _) = tracked("Demo.Thing");
        let ptr = object.as_ptr();

        let wrapper = bridge.wrap(&object);
        drop(object);
        assert_eq!(bridge.stats().rooted, 0);

        let again = unsafe { ObjectRef::retain(ptr) };
        assert!(bridge.is_rooted(&again));
        assert_eq!(bridge.stats().promotes, 1);

        drop(again);
        drop(wrapper);
        bridge.collector().collect();
    }

    #[test]
    fn test_off_thread_promote_is_queued() {
        let (bridge, terminator) = bridge();
        let (object, freed) = tracked("Demo.Thing");
        let ptr = object.as_ptr();

        let wrapper = bridge.wrap(&object);
        drop(object);

        let shared = thread::spawn(move || unsafe { ObjectRef::retain(ptr) })
            .join()
            .unwrap();
        assert_eq!(bridge.pending_tasks(), 1);
        assert!(!bridge.is_rooted(&shared));

        assert_eq!(bridge.run_pending(), 1);
        assert!(bridge.is_rooted(&shared));
        // toggle reference + `shared`; the task's hold is gone
        assert_eq!(shared.count(), 2);

        drop(shared);
        assert_eq!(bridge.stats().rooted, 0);
        drop(wrapper);
        bridge.collector().collect();
        assert!(freed.load(Ordering::SeqCst));
        assert!(terminator.aborts().is_empty());
    }

    #[test]
    fn test_off_thread_demote_is_queued() {
        let (bridge, _) = bridge();
        let (object, _) = tracked("Demo.Thing");
        let ptr = object.as_ptr();

        let wrapper = bridge.wrap(&object);
        thread::spawn(move || drop(object)).join().unwrap();

        assert_eq!(bridge.pending_tasks(), 1);
        assert_eq!(bridge.stats().rooted, 1);

        bridge.run_pending();
        assert_eq!(bridge.stats().rooted, 0);
        assert_eq!(wrapper.object(), Some(ptr));
    }

    #[test]
    fn test_finalize_cancels_queued_promote() {
        let (bridge, terminator) = bridge();
        let (object, freed) = tracked("Demo.Thing");
        let ptr = object.as_ptr();

        let wrapper = bridge.wrap(&object);
        drop(object);

        let shared = thread::spawn(move || unsafe { ObjectRef::retain(ptr) })
            .join()
            .unwrap();
        assert_eq!(bridge.pending_tasks(), 1);

        // Wrapper collected before the owner got to the task
        drop(wrapper);
        bridge.collector().collect();
        assert!(!shared.has_toggle_ref());
        assert!(matches!(*shared.binding(), Binding::Poisoned));

        // Cancelled: runs, but roots nothing
        assert_eq!(bridge.run_pending(), 1);
        assert_eq!(bridge.stats().rooted, 0);
        assert_eq!(shared.count(), 1);

        // The object resurfaces with a fresh wrapper
        let fresh = bridge.wrap(&shared);
        assert_eq!(bridge.stats().resurfaced, 1);
        assert!(fresh.is_associated());

        drop(shared);
        drop(fresh);
        bridge.collector().collect();
        assert!(freed.load(Ordering::SeqCst));
        assert!(terminator.aborts().is_empty());
    }

    #[test]
    fn test_toggle_up_while_queued_aborts() {
        let (bridge, terminator) = bridge();
        let (object, _) = tracked("Demo.Thing");
        let _wrapper = bridge.wrap(&object);

        object.toggle_state().mark_queued(Toggle::Up);
        bridge.notify(object.as_ptr(), false);
        let aborts = terminator.aborts();
        assert_eq!(aborts.len(), 1);
        assert!(aborts[0].contains("already queued to toggle up"));

        bridge.notify(object.as_ptr(), true);
        assert!(terminator.aborts()[1].contains("toggling down object"));
        object.toggle_state().take(Toggle::Up);
    }

    #[test]
    fn test_unreachable_wrapper_disassociated_during_sweep() {
        let (bridge, terminator) = bridge();
        let (object, freed) = tracked("Demo.Thing");
        let ptr = object.as_ptr();
        let collector = bridge.collector().clone();

        let wrapper = bridge.wrap(&object);
        drop(object);
        collector.mark_unreachable(&wrapper);

        let revived = {
            let _sweep = collector.begin_sweep();
            unsafe { ObjectRef::retain(ptr) }
        };

        assert!(!wrapper.is_associated());
        assert!(!revived.has_toggle_ref());
        assert_eq!(revived.count(), 1);
        let err = wrapper.require_object().unwrap_err();
        assert!(err.to_string().contains("has been already deallocated"));

        drop(revived);
        assert!(freed.load(Ordering::SeqCst));
        drop(wrapper);
        collector.collect();
        assert!(terminator.aborts().is_empty());
    }

    #[test]
    fn test_live_wrapper_promote_deferred_during_sweep() {
        let (bridge, _) = bridge();
        let (object, _) = tracked("Demo.Thing");
        let ptr = object.as_ptr();
        let collector = bridge.collector().clone();

        let wrapper = bridge.wrap(&object);
        drop(object);

        let revived = {
            let _sweep = collector.begin_sweep();
            unsafe { ObjectRef::retain(ptr) }
        };
        assert!(wrapper.is_associated());
        assert_eq!(bridge.pending_tasks(), 1);
        assert!(!bridge.is_rooted(&revived));

        bridge.run_pending();
        assert!(bridge.is_rooted(&revived));
    }

    #[test]
    fn test_prepare_shutdown_releases_everything() {
        let (bridge, _) = bridge();
        let (first, _) = tracked("Demo.First");
        let (second, _) = tracked("Demo.Second");
        let second_ptr = second.as_ptr();

        let first_wrapper = bridge.wrap(&first);
        let second_wrapper = bridge.wrap(&second);
        // Queue a demote from another thread
        let moved = second.clone();
        drop(second);
        thread::spawn(move || drop(moved)).join().unwrap();
        assert_eq!(bridge.pending_tasks(), 1);

        let report = bridge.prepare_shutdown();
        assert_eq!(report.drained_tasks, 1);
        assert_eq!(report.released_wrappers, 1);
        assert!(bridge.is_destroying());

        assert!(!first_wrapper.is_associated());
        assert!(!first.has_toggle_ref());
        assert_eq!(first.count(), 1);

        // Still weak-held by its wrapper; finalization releases it
        assert_eq!(second_wrapper.object(), Some(second_ptr));
        drop(second_wrapper);
        bridge.collector().collect();
    }
}
