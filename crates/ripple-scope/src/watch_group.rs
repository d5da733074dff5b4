#![forbid(unsafe_code)]

//! Watcher aggregation: one derived listener over N watch functions.
//!
//! [`watch_group`] registers one ordinary watcher per input function, all
//! writing slots of shared `new`/`old` buffers, and coalesces their
//! listener invocations into a single aggregated call per digest
//! (scheduled through `eval_async`, so it runs ahead of the next watcher
//! pass).
//!
//! # Invariants
//!
//! 1. The aggregated listener fires at most once per digest, no matter
//!    how many group members changed.
//! 2. On the first firing `new` and `old` are the *same* buffer (pointer
//!    identity signals "first run, no prior state"); afterwards `old[i]`
//!    holds the value slot `i` had before its most recent change.
//! 3. An empty group fires exactly once, with identical empty buffers,
//!    unless cancelled before the pending call runs.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::scope::{Scope, WatchHandle};
use crate::value::Value;

/// Cancellation capability for a watch group: deregisters all underlying
/// watchers and suppresses any pending aggregated call.
pub struct WatchGroupHandle {
    handles: Vec<WatchHandle>,
    cancelled: Rc<Cell<bool>>,
}

impl WatchGroupHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
        for handle in &self.handles {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for WatchGroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchGroupHandle")
            .field("watchers", &self.handles.len())
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}

/// Watch `watch_fns` as a group on `scope`, invoking `listener` with the
/// collected `(new, old, scope)` once per digest in which any member
/// changed.
pub fn watch_group(
    scope: &Scope,
    watch_fns: Vec<Box<dyn Fn(&Scope) -> Value>>,
    listener: impl Fn(&[Value], &[Value], &Scope) + 'static,
) -> WatchGroupHandle {
    let cancelled = Rc::new(Cell::new(false));

    if watch_fns.is_empty() {
        // Still obliged to fire once, with reference-identical empty
        // buffers, unless cancelled before the pending call runs.
        let flag = Rc::clone(&cancelled);
        scope.eval_async(move |scope| {
            if !flag.get() {
                let empty: Vec<Value> = Vec::new();
                listener(&empty, &empty, scope);
            }
        });
        return WatchGroupHandle {
            handles: Vec::new(),
            cancelled,
        };
    }

    let len = watch_fns.len();
    let new_values = Rc::new(RefCell::new(vec![Value::Null; len]));
    let old_values = Rc::new(RefCell::new(vec![Value::Null; len]));
    let first_run = Rc::new(Cell::new(true));
    let scheduled = Rc::new(Cell::new(false));
    let listener: Rc<dyn Fn(&[Value], &[Value], &Scope)> = Rc::new(listener);

    let mut handles = Vec::with_capacity(len);
    for (index, watch_fn) in watch_fns.into_iter().enumerate() {
        let new_values = Rc::clone(&new_values);
        let old_values = Rc::clone(&old_values);
        let first_run = Rc::clone(&first_run);
        let scheduled = Rc::clone(&scheduled);
        let cancelled = Rc::clone(&cancelled);
        let listener = Rc::clone(&listener);

        let handle = scope.watch(
            move |scope| watch_fn(scope),
            move |new, old, scope| {
                new_values.borrow_mut()[index] = new.clone();
                old_values.borrow_mut()[index] = old.clone();
                if scheduled.get() {
                    return;
                }
                scheduled.set(true);

                let new_values = Rc::clone(&new_values);
                let old_values = Rc::clone(&old_values);
                let first_run = Rc::clone(&first_run);
                let scheduled = Rc::clone(&scheduled);
                let cancelled = Rc::clone(&cancelled);
                let listener = Rc::clone(&listener);
                scope.eval_async(move |scope| {
                    scheduled.set(false);
                    if cancelled.get() {
                        return;
                    }
                    if first_run.get() {
                        first_run.set(false);
                        let snapshot = new_values.borrow().clone();
                        listener(&snapshot, &snapshot, scope);
                    } else {
                        let new = new_values.borrow().clone();
                        let old = old_values.borrow().clone();
                        listener(&new, &old, scope);
                    }
                });
            },
            false,
        );
        handles.push(handle);
    }

    WatchGroupHandle { handles, cancelled }
}
