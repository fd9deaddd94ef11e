//! Owner-thread task queue
//!
//! Work produced on foreign threads (deferred toggles) is pushed here and
//! executed only by the owner thread, in priority order.

use crate::logging::{trace, warn};
use flume::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Default,
}

pub struct TaskQueue {
    owner: ThreadId,
    high: (Sender<Task>, Receiver<Task>),
    default: (Sender<Task>, Receiver<Task>),
    pending: AtomicUsize,
    /// Max tasks per `run_pending` call, 0 for unlimited
    batch: usize,
}

impl TaskQueue {
    /// Queue owned by the calling thread
    pub fn new(batch: usize) -> Self {
        Self {
            owner: thread::current().id(),
            high: flume::unbounded(),
            default: flume::unbounded(),
            pending: AtomicUsize::new(0),
            batch,
        }
    }

    #[inline]
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    #[inline]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Push from any thread
    pub fn push(&self, priority: Priority, task: Task) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let sender = match priority {
            Priority::High => &self.high.0,
            Priority::Default => &self.default.0,
        };
        // Both receivers live as long as the queue
        if sender.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Tasks pushed but not yet finished
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn next(&self) -> Option<Task> {
        self.high.1.try_recv().or_else(|_| self.default.1.try_recv()).ok()
    }

    fn run_one(&self) -> bool {
        match self.next() {
            Some(task) => {
                task();
                self.pending.fetch_sub(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Run tasks queued before this call, up to the batch limit
    pub fn run_pending(&self) -> usize {
        if !self.is_owner_thread() {
            warn!("run_pending called off the owner thread, ignoring");
            return 0;
        }

        let queued = self.high.1.len() + self.default.1.len();
        let limit = if self.batch == 0 { queued } else { queued.min(self.batch) };

        let mut ran = 0;
        while ran < limit && self.run_one() {
            ran += 1;
        }

        if ran > 0 {
            trace!(event = "tasks_run", ran, remaining = self.pending());
        }
        ran
    }

    /// Run until nothing is pending
    pub fn drain_all(&self) -> usize {
        if !self.is_owner_thread() {
            warn!("drain_all called off the owner thread, ignoring");
            return 0;
        }

        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}
