//! Deferred-execution primitives: `eval_async`, `apply_async`, and
//! `post_digest`, driven through the explicit task queue.

#![forbid(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ripple_scope::{Scope, Value};

// =============================================================================
// eval_async
// =============================================================================

#[test]
fn eval_async_outside_a_digest_runs_via_the_safety_net() {
    let root = Scope::root();
    root.set("a", 1.0);
    let seen = Rc::new(Cell::new(0u32));
    let count = Rc::clone(&seen);
    root.watch(
        |s| s.get("a").unwrap_or(Value::Null),
        move |_, _, _| count.set(count.get() + 1),
        false,
    );

    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    root.eval_async(move |scope| {
        flag.set(true);
        scope.set("a", 2.0);
    });
    assert!(!ran.get(), "expression must not run synchronously");
    assert_eq!(root.scheduler().len(), 1);

    root.scheduler().run();
    assert!(ran.get());
    assert_eq!(seen.get(), 1, "the deferred digest picked up the write");
}

#[test]
fn eval_async_schedules_at_most_one_safety_net() {
    let root = Scope::root();
    root.eval_async(|_| {});
    root.eval_async(|_| {});
    assert_eq!(root.scheduler().len(), 1);
}

#[test]
fn eval_async_during_a_digest_runs_in_that_digest() {
    let root = Scope::root();
    root.set("a", 1.0);
    let order = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&order);
    let queued = Rc::new(Cell::new(false));
    root.watch(
        |s| s.get("a").unwrap_or(Value::Null),
        move |_, _, scope| {
            log.borrow_mut().push("listener");
            if !queued.get() {
                queued.set(true);
                let log = Rc::clone(&log);
                scope.eval_async(move |_| log.borrow_mut().push("async"));
            }
        },
        false,
    );

    root.digest().unwrap();
    assert_eq!(*order.borrow(), vec!["listener", "async"]);
    assert!(
        root.scheduler().is_idle(),
        "no safety net while a digest is active"
    );
}

#[test]
fn eval_async_drains_fifo_before_the_watcher_pass() {
    let root = Scope::root();
    root.set("a", 1.0);
    let order = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&order);
    root.watch(
        |s| s.get("a").unwrap_or(Value::Null),
        move |_, _, _| log.borrow_mut().push("watch"),
        false,
    );
    for name in ["e1", "e2"] {
        let log = Rc::clone(&order);
        root.eval_async(move |_| log.borrow_mut().push(name));
    }

    root.digest().unwrap();
    assert_eq!(*order.borrow(), vec!["e1", "e2", "watch"]);
}

#[test]
fn panicking_async_expression_does_not_stop_the_drain() {
    let root = Scope::root();
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    root.eval_async(|_| panic!("bad expression"));
    root.eval_async(move |_| flag.set(true));

    root.digest().unwrap();
    assert!(ran.get());
}

// =============================================================================
// apply_async
// =============================================================================

#[test]
fn apply_async_coalesces_into_one_flush_and_one_digest() {
    let root = Scope::root();
    root.set("x", 0.0);
    let fired = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&fired);
    root.watch(
        |s| s.get("x").unwrap_or(Value::Null),
        move |new, _, _| log.borrow_mut().push(new.clone()),
        false,
    );
    root.digest().unwrap();
    assert_eq!(fired.borrow().len(), 1);

    root.apply_async(|s| s.set("x", 1.0));
    root.apply_async(|s| s.set("x", 2.0));
    assert_eq!(root.scheduler().len(), 1, "one coalesced flush pending");
    assert_eq!(fired.borrow().len(), 1, "nothing runs before the flush");

    root.scheduler().run();

    // Both closures ran in one batch, so the watcher only ever saw the
    // final value: a single digest, a single additional firing.
    let fired = fired.borrow();
    assert_eq!(fired.len(), 2);
    assert_eq!(fired[1], Value::from(2.0));
}

#[test]
fn apply_async_closures_run_in_enqueue_order() {
    let root = Scope::root();
    let order = Rc::new(RefCell::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let log = Rc::clone(&order);
        root.apply_async(move |_| log.borrow_mut().push(name));
    }
    root.scheduler().run();
    assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
}

#[test]
fn digest_folds_a_pending_apply_async_flush() {
    let root = Scope::root();
    root.set("x", 0.0);
    root.apply_async(|s| s.set("x", 5.0));
    assert_eq!(root.scheduler().len(), 1);

    root.digest().unwrap();
    assert_eq!(root.get("x"), Some(Value::from(5.0)));
    assert_eq!(
        root.scheduler().run(),
        0,
        "the deferred flush was cancelled, not run twice"
    );
}

#[test]
fn apply_async_queued_during_flush_waits_for_the_next_cycle() {
    let root = Scope::root();
    let order = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&order);
    root.apply_async(move |scope| {
        log.borrow_mut().push("outer");
        let log = Rc::clone(&log);
        scope.apply_async(move |_| log.borrow_mut().push("inner"));
    });

    root.scheduler().run_one();
    assert_eq!(*order.borrow(), vec!["outer"]);
    assert_eq!(root.scheduler().len(), 1, "inner waits for its own flush");

    root.scheduler().run();
    assert_eq!(*order.borrow(), vec!["outer", "inner"]);
}

// =============================================================================
// post_digest
// =============================================================================

#[test]
fn post_digest_runs_once_after_stabilization_in_enqueue_order() {
    let root = Scope::root();
    root.set("a", 1.0);
    let order = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&order);
    root.watch(
        |s| s.get("a").unwrap_or(Value::Null),
        move |_, _, _| log.borrow_mut().push("listener"),
        false,
    );
    for name in ["h1", "h2"] {
        let log = Rc::clone(&order);
        root.post_digest(move || log.borrow_mut().push(name));
    }

    root.digest().unwrap();
    assert_eq!(*order.borrow(), vec!["listener", "h1", "h2"]);

    root.digest().unwrap();
    assert_eq!(order.borrow().len(), 3, "hooks run exactly once");
}

#[test]
fn post_digest_from_an_isolated_child_runs_on_the_root_digest() {
    let root = Scope::root();
    let isolated = root.new_child(true);

    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    isolated.post_digest(move || flag.set(true));

    root.digest().unwrap();
    assert!(ran.get(), "scheduling channels are shared across isolation");
}

#[test]
fn panicking_post_digest_hook_does_not_stop_the_drain() {
    let root = Scope::root();
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    root.post_digest(|| panic!("bad hook"));
    root.post_digest(move || flag.set(true));

    root.digest().unwrap();
    assert!(ran.get());
}
