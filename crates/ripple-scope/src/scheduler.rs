#![forbid(unsafe_code)]

//! Single-threaded deferred-task queue.
//!
//! The digest engine never spawns threads or arms real timers. Anything
//! that would run "on the next turn of the event loop" (the `eval_async`
//! safety-net digest, the coalesced `apply_async` flush) is scheduled
//! onto a [`TaskQueue`] with a cancellable [`TaskId`]. The host event loop
//! (or a test) pumps the queue between turns via [`TaskQueue::run`].
//!
//! # Invariants
//!
//! 1. Tasks run in schedule order (FIFO).
//! 2. A cancelled task never runs; cancelling an unknown or already-run
//!    id is a no-op.
//! 3. `run` drains tasks scheduled *during* the drain as well, so one call
//!    models "run the task queue until idle".

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// Handle to a scheduled task, usable to cancel it before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(u64);

type Task = Box<dyn FnOnce()>;

/// FIFO queue of deferred tasks. Single-threaded; share via `Rc`.
pub struct TaskQueue {
    tasks: RefCell<VecDeque<(TaskId, Task)>>,
    next_id: Cell<u64>,
}

impl TaskQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(VecDeque::new()),
            next_id: Cell::new(0),
        }
    }

    /// Append a task; it runs when the host next pumps the queue.
    pub fn schedule(&self, task: impl FnOnce() + 'static) -> TaskId {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.tasks.borrow_mut().push_back((id, Box::new(task)));
        id
    }

    /// Remove a pending task. Returns `true` if it was still queued.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut tasks = self.tasks.borrow_mut();
        let before = tasks.len();
        tasks.retain(|(tid, _)| *tid != id);
        tasks.len() != before
    }

    /// Run the oldest pending task, if any.
    pub fn run_one(&self) -> bool {
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some((_, task)) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run until the queue is idle, including tasks scheduled while
    /// draining. Returns the number of tasks run.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Whether no tasks are pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_idle()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}
