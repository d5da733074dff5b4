#![forbid(unsafe_code)]

//! Scope hierarchy, watcher registry, and the digest loop.
//!
//! A [`Scope`] is a node in a rooted tree of mutable data containers.
//! External code registers watchers (a pure watch function paired with a
//! side-effecting listener) and triggers stabilization through
//! [`Scope::digest`] or [`Scope::apply`]. The digest loop re-evaluates
//! every watcher in the subtree, pre-order, until a full pass detects no
//! change and no deferred work remains, or the iteration bound is hit.
//!
//! # Architecture
//!
//! `Scope` is a cheap `Clone` handle over `Rc<ScopeInner>`; identity is
//! pointer identity. Ownership flows root → children (a parent's
//! `children` vector holds the only long-lived strong references), while
//! `parent` and `root` are `Weak` back-references. Tree-global digest
//! state (the short-circuit pointer, the three deferred queues, the
//! pending-flush handle, and the task queue) lives in one `Shared` block
//! allocated by the root and aliased by every descendant, isolated or not.
//! Isolation cuts *data* inheritance only, never the scheduling channels.
//!
//! # Invariants
//!
//! 1. Watchers are evaluated in registration order, oldest first, stably
//!    within a pass and across passes while the watcher set is unchanged.
//!    Any registration or deregistration resets the short-circuit pointer.
//! 2. The short-circuit pointer is tree-global: once an unchanged watcher
//!    matches it, the entire remaining traversal of the tree is abandoned
//!    for that pass, not just the current scope's subtree.
//! 3. A deep-equality watcher's stored last value is a structural
//!    snapshot, never an alias to the live value.
//! 4. The unset sentinel is never exposed to listeners: on a watcher's
//!    first evaluation the listener sees `old` equal to `new`.
//! 5. Re-entrancy is forbidden: `digest`/`apply` fail with
//!    [`ScopeError::PhaseInProgress`] rather than nest.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Panic in watch fn | user bug | logged, watcher treated as unchanged |
//! | Panic in listener | user bug | logged, pass continues |
//! | Panic in queued expression / hook | user bug | logged, drain continues |
//! | Nested digest/apply | usage bug | `PhaseInProgress`, surfaced |
//! | Non-converging watch graph | design bug | `DigestUnstable`, surfaced |

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::error::{Phase, ScopeError};
use crate::scheduler::{TaskId, TaskQueue};
use crate::value::Value;

/// Default digest iteration bound.
pub const DEFAULT_TTL: u32 = 10;

/// Identity of a registered watcher, used for the short-circuit pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WatchId(u64);

struct WatchSlot {
    id: WatchId,
    watch: Rc<dyn Fn(&Scope) -> Value>,
    listener: Rc<dyn Fn(&Value, &Value, &Scope)>,
    value_eq: bool,
    /// `None` is the unset sentinel, distinguishable from any real value.
    last: RefCell<Option<Value>>,
    /// Tombstone so deregistration during a pass skips the slot without
    /// disturbing the pass's snapshot.
    removed: Cell<bool>,
}

struct AsyncTask {
    scope: Scope,
    expr: Box<dyn FnOnce(&Scope)>,
}

/// Tree-global digest state, allocated once by the root and aliased by
/// every scope in the tree.
struct Shared {
    next_watch_id: Cell<u64>,
    last_dirty: Cell<Option<WatchId>>,
    async_queue: RefCell<VecDeque<AsyncTask>>,
    apply_async_queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    post_digest_queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    apply_async_handle: Cell<Option<TaskId>>,
    ttl: u32,
    queue: Rc<TaskQueue>,
}

struct ScopeInner {
    data: RefCell<HashMap<String, Value>>,
    /// Non-isolated scopes fall back to the parent chain on lookup miss.
    inherits: bool,
    watchers: RefCell<Vec<Rc<WatchSlot>>>,
    children: RefCell<Vec<Scope>>,
    parent: RefCell<Weak<ScopeInner>>,
    root: Weak<ScopeInner>,
    phase: Cell<Option<Phase>>,
    shared: Rc<Shared>,
}

/// A node in the scope tree. Cheap to clone; compares by identity.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("watchers", &self.inner.watchers.borrow().len())
            .field("children", &self.inner.children.borrow().len())
            .field("isolated", &!self.inner.inherits)
            .field("phase", &self.inner.phase.get())
            .finish()
    }
}

/// Deregistration capability for a single watcher.
///
/// Cancellation is explicit; dropping the handle leaves the watcher
/// registered. `cancel` after the owning scope was destroyed or dropped is
/// a no-op.
pub struct WatchHandle {
    scope: Weak<ScopeInner>,
    slot: Weak<WatchSlot>,
}

impl WatchHandle {
    /// Remove the watcher. The cached short-circuit pointer is reset,
    /// since the watcher set it was computed against has changed.
    pub fn cancel(&self) {
        let Some(slot) = self.slot.upgrade() else {
            return;
        };
        slot.removed.set(true);
        if let Some(inner) = self.scope.upgrade() {
            inner
                .watchers
                .borrow_mut()
                .retain(|w| !Rc::ptr_eq(w, &slot));
            inner.shared.last_dirty.set(None);
        }
    }

    /// Whether the watcher is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.slot.upgrade().is_some_and(|slot| !slot.removed.get())
    }
}

impl Scope {
    /// Create a root scope with its own task queue and the default
    /// iteration bound.
    #[must_use]
    pub fn root() -> Scope {
        Self::new_root(Rc::new(TaskQueue::new()), DEFAULT_TTL)
    }

    /// Create a root scope wired to an existing task queue (typically the
    /// host event loop's deferred-work queue).
    #[must_use]
    pub fn root_with_scheduler(queue: Rc<TaskQueue>) -> Scope {
        Self::new_root(queue, DEFAULT_TTL)
    }

    /// Create a root scope with a custom digest iteration bound.
    #[must_use]
    pub fn root_with_ttl(ttl: u32) -> Scope {
        Self::new_root(Rc::new(TaskQueue::new()), ttl)
    }

    fn new_root(queue: Rc<TaskQueue>, ttl: u32) -> Scope {
        let shared = Rc::new(Shared {
            next_watch_id: Cell::new(0),
            last_dirty: Cell::new(None),
            async_queue: RefCell::new(VecDeque::new()),
            apply_async_queue: RefCell::new(VecDeque::new()),
            post_digest_queue: RefCell::new(VecDeque::new()),
            apply_async_handle: Cell::new(None),
            ttl,
            queue,
        });
        let inner = Rc::new_cyclic(|weak| ScopeInner {
            data: RefCell::new(HashMap::new()),
            inherits: true,
            watchers: RefCell::new(Vec::new()),
            children: RefCell::new(Vec::new()),
            parent: RefCell::new(Weak::new()),
            root: weak.clone(),
            phase: Cell::new(None),
            shared,
        });
        Scope { inner }
    }

    /// Create a child scope, appended to this scope's children.
    ///
    /// A non-isolated child inherits data through the parent chain
    /// (lookup misses fall back to the parent, writes always go to the
    /// child's own map). An isolated child starts with a fresh, empty data
    /// scope and never falls back, but still shares the root's
    /// scheduling channels, so deferred work and digest coordination
    /// remain tree-global.
    pub fn new_child(&self, isolated: bool) -> Scope {
        let inner = Rc::new(ScopeInner {
            data: RefCell::new(HashMap::new()),
            inherits: !isolated,
            watchers: RefCell::new(Vec::new()),
            children: RefCell::new(Vec::new()),
            parent: RefCell::new(Rc::downgrade(&self.inner)),
            root: self.inner.root.clone(),
            phase: Cell::new(None),
            shared: Rc::clone(&self.inner.shared),
        });
        let child = Scope { inner };
        self.inner.children.borrow_mut().push(child.clone());
        child
    }

    /// Detach this scope from its parent and discard its watchers.
    ///
    /// The scope becomes unreachable from the digest's tree walk; any
    /// further calls against a retained handle are harmless no-ops from
    /// the digest's perspective.
    pub fn destroy(&self) {
        let parent = self.inner.parent.borrow().upgrade();
        if let Some(parent) = parent {
            parent
                .children
                .borrow_mut()
                .retain(|c| !Rc::ptr_eq(&c.inner, &self.inner));
        }
        *self.inner.parent.borrow_mut() = Weak::new();
        self.inner.watchers.borrow_mut().clear();
        self.inner.shared.last_dirty.set(None);
    }

    /// The tree's root scope.
    #[must_use]
    pub fn root_scope(&self) -> Scope {
        match self.inner.root.upgrade() {
            Some(inner) => Scope { inner },
            // Root already dropped; the tree is dead and every digest a
            // no-op, so self is as good an anchor as any.
            None => self.clone(),
        }
    }

    /// The task queue deferred work is scheduled on.
    #[must_use]
    pub fn scheduler(&self) -> Rc<TaskQueue> {
        Rc::clone(&self.inner.shared.queue)
    }

    /// The phase currently active on this scope, if any.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.inner.phase.get()
    }

    // ---------------------------------------------------------------
    // Data access
    // ---------------------------------------------------------------

    /// Look up `key`, falling back to the parent chain unless this scope
    /// is isolated. Returns a handle clone for composite values.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut current = self.clone();
        loop {
            if let Some(value) = current.inner.data.borrow().get(key) {
                return Some(value.clone());
            }
            if !current.inner.inherits {
                return None;
            }
            let parent = current.inner.parent.borrow().upgrade()?;
            current = Scope { inner: parent };
        }
    }

    /// Write `key` into this scope's own map, shadowing any inherited
    /// binding.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.data.borrow_mut().insert(key.into(), value.into());
    }

    /// Whether `key` resolves on this scope (own or inherited).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    // ---------------------------------------------------------------
    // Watcher registry
    // ---------------------------------------------------------------

    /// Register a watcher: `watch_fn` is evaluated every digest pass, and
    /// `listener` is invoked with `(new, old, scope)` whenever the result
    /// changes under the selected equality mode (`value_eq`: deep
    /// structural vs. reference). On the first evaluation `old` equals
    /// `new`.
    ///
    /// Watchers run in registration order, oldest first. Registration
    /// resets the tree's short-circuit pointer.
    pub fn watch(
        &self,
        watch_fn: impl Fn(&Scope) -> Value + 'static,
        listener: impl Fn(&Value, &Value, &Scope) + 'static,
        value_eq: bool,
    ) -> WatchHandle {
        let shared = &self.inner.shared;
        let id = WatchId(shared.next_watch_id.get());
        shared.next_watch_id.set(id.0 + 1);

        let slot = Rc::new(WatchSlot {
            id,
            watch: Rc::new(watch_fn),
            listener: Rc::new(listener),
            value_eq,
            last: RefCell::new(None),
            removed: Cell::new(false),
        });
        self.inner.watchers.borrow_mut().push(Rc::clone(&slot));
        shared.last_dirty.set(None);

        WatchHandle {
            scope: Rc::downgrade(&self.inner),
            slot: Rc::downgrade(&slot),
        }
    }

    /// Number of watchers currently registered on this scope.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.inner.watchers.borrow().len()
    }

    // ---------------------------------------------------------------
    // Evaluation
    // ---------------------------------------------------------------

    /// Evaluate `expr` against this scope, immediately.
    pub fn eval<R>(&self, expr: impl FnOnce(&Scope) -> R) -> R {
        expr(self)
    }

    /// Evaluate `expr` with additional local bindings the expression may
    /// consult ahead of scope data.
    pub fn eval_with<R>(
        &self,
        expr: impl FnOnce(&Scope, &HashMap<String, Value>) -> R,
        locals: &HashMap<String, Value>,
    ) -> R {
        expr(self, locals)
    }

    /// Evaluate `expr` immediately under the "applying" phase guard, then
    /// digest from the root: the integration point where an external
    /// event's effects are reconciled into stable state.
    ///
    /// The root digest runs even if `expr` panics (the panic is re-raised
    /// afterwards).
    ///
    /// # Errors
    ///
    /// [`ScopeError::PhaseInProgress`] if a phase is already active on
    /// this scope; [`ScopeError::DigestUnstable`] if the resulting digest
    /// does not converge.
    pub fn apply<R>(&self, expr: impl FnOnce(&Scope) -> R) -> Result<R, ScopeError> {
        self.begin_phase(Phase::Applying)?;
        let result = panic::catch_unwind(AssertUnwindSafe(|| expr(self)));
        self.clear_phase();
        let digested = self.root_scope().digest();
        match result {
            Ok(value) => digested.map(|()| value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Enqueue `expr` to run during the next digest, before that
    /// iteration's watcher pass, in FIFO order.
    ///
    /// If no phase is active and the queue was empty, a safety-net root
    /// digest is scheduled on the task queue so the expression eventually
    /// runs even when no one calls `digest` or `apply` explicitly.
    pub fn eval_async(&self, expr: impl FnOnce(&Scope) + 'static) {
        let shared = &self.inner.shared;
        let root = self.root_scope();
        let idle = self.inner.phase.get().is_none() && root.inner.phase.get().is_none();
        if idle && shared.async_queue.borrow().is_empty() {
            let weak = Rc::downgrade(&root.inner);
            shared.queue.schedule(move || {
                let Some(inner) = weak.upgrade() else { return };
                let root = Scope { inner };
                let pending = !root.inner.shared.async_queue.borrow().is_empty();
                if pending {
                    if let Err(err) = root.digest() {
                        tracing::error!(%err, "deferred digest failed");
                    }
                }
            });
        }
        shared.async_queue.borrow_mut().push_back(AsyncTask {
            scope: self.clone(),
            expr: Box::new(expr),
        });
    }

    /// Enqueue `expr` onto the coalesced apply-async batch.
    ///
    /// The first call schedules exactly one deferred flush; calls made
    /// before the flush fires share it and its single resulting digest.
    /// Expressions queued *during* the flush wait for the next cycle.
    pub fn apply_async(&self, expr: impl FnOnce(&Scope) + 'static) {
        let shared = Rc::clone(&self.inner.shared);
        let scope = self.clone();
        shared
            .apply_async_queue
            .borrow_mut()
            .push_back(Box::new(move || expr(&scope)));

        if shared.apply_async_handle.get().is_none() {
            let weak = Rc::downgrade(&self.root_scope().inner);
            let id = shared.queue.schedule(move || {
                let Some(inner) = weak.upgrade() else { return };
                let root = Scope { inner };
                root.inner.shared.apply_async_handle.set(None);
                if let Err(err) = root.apply(|scope| scope.flush_apply_async()) {
                    tracing::error!(%err, "apply-async flush failed");
                }
            });
            shared.apply_async_handle.set(Some(id));
        }
    }

    /// Register a hook to run exactly once after the next digest has
    /// fully stabilized, in enqueue order, regardless of which scope
    /// enqueued it.
    pub fn post_digest(&self, hook: impl FnOnce() + 'static) {
        self.inner
            .shared
            .post_digest_queue
            .borrow_mut()
            .push_back(Box::new(hook));
    }

    // ---------------------------------------------------------------
    // Digest engine
    // ---------------------------------------------------------------

    /// Run the digest loop over the subtree rooted at this scope.
    ///
    /// A pending apply-async flush is cancelled and folded in
    /// synchronously. Each iteration drains the async queue completely,
    /// then runs one watcher pass; the loop ends when a pass was clean
    /// and the queue is empty. After convergence the post-digest queue is
    /// drained FIFO.
    ///
    /// # Errors
    ///
    /// [`ScopeError::PhaseInProgress`] on re-entrant invocation;
    /// [`ScopeError::DigestUnstable`] if still dirty after the iteration
    /// bound.
    pub fn digest(&self) -> Result<(), ScopeError> {
        let shared = Rc::clone(&self.inner.shared);
        shared.last_dirty.set(None);
        self.begin_phase(Phase::Digesting)?;

        if let Some(id) = shared.apply_async_handle.take() {
            shared.queue.cancel(id);
            self.flush_apply_async();
        }

        let mut passes = 0u32;
        let mut converged = false;
        while passes < shared.ttl {
            self.drain_async_queue();
            let dirty = self.digest_once(&shared);
            passes += 1;
            if !dirty && shared.async_queue.borrow().is_empty() {
                converged = true;
                break;
            }
        }

        self.clear_phase();
        if !converged {
            return Err(ScopeError::DigestUnstable { ttl: shared.ttl });
        }
        tracing::trace!(passes, "digest stabilized");
        self.drain_post_digest();
        Ok(())
    }

    /// One full pass: pre-order subtree walk, each scope's watchers in
    /// registration order. Returns whether any watcher was dirty.
    fn digest_once(&self, shared: &Shared) -> bool {
        let mut dirty = false;
        self.every_scope(|scope| scope.digest_scope(shared, &mut dirty));
        dirty
    }

    /// Dirty-check one scope's watchers. Returns `false` to abort the
    /// entire remaining tree traversal (short-circuit).
    fn digest_scope(&self, shared: &Shared, dirty: &mut bool) -> bool {
        // Snapshot so listeners may register or deregister watchers
        // mid-pass; additions are picked up on the next pass.
        let snapshot: Vec<Rc<WatchSlot>> = self.inner.watchers.borrow().clone();
        for slot in snapshot {
            if slot.removed.get() {
                continue;
            }
            let watch = Rc::clone(&slot.watch);
            let Some(new) = guarded("watch function", || watch(self)) else {
                // A panicking watch fn produces no further changes for
                // this watcher, but the pass continues.
                continue;
            };
            let last = slot.last.borrow().clone();
            let unchanged = match &last {
                Some(old) if slot.value_eq => new.deep_eq(old),
                Some(old) => new.ref_eq(old),
                None => false,
            };
            if unchanged {
                if shared.last_dirty.get() == Some(slot.id) {
                    // A full rotation with no change since the last dirty
                    // watcher: the tree has converged for this pass.
                    return false;
                }
                continue;
            }
            shared.last_dirty.set(Some(slot.id));
            let stored = if slot.value_eq {
                new.deep_clone()
            } else {
                new.clone()
            };
            *slot.last.borrow_mut() = Some(stored);
            let old = last.unwrap_or_else(|| new.clone());
            let listener = Rc::clone(&slot.listener);
            guarded("listener", || listener(&new, &old, self));
            *dirty = true;
        }
        true
    }

    fn drain_async_queue(&self) {
        loop {
            let task = self.inner.shared.async_queue.borrow_mut().pop_front();
            let Some(AsyncTask { scope, expr }) = task else {
                break;
            };
            guarded("async expression", || expr(&scope));
        }
    }

    /// Run the apply-async batch as queued at entry; expressions appended
    /// while flushing wait for the next cycle.
    fn flush_apply_async(&self) {
        let pending = self.inner.shared.apply_async_queue.borrow().len();
        for _ in 0..pending {
            let task = self.inner.shared.apply_async_queue.borrow_mut().pop_front();
            let Some(task) = task else { break };
            guarded("apply-async expression", task);
        }
    }

    fn drain_post_digest(&self) {
        loop {
            let hook = self.inner.shared.post_digest_queue.borrow_mut().pop_front();
            let Some(hook) = hook else { break };
            guarded("post-digest hook", hook);
        }
    }

    /// Pre-order walk from this scope. `visit` returning `false` stops
    /// the entire walk; the stop propagates up so remaining siblings and
    /// ancestors' remaining children are not visited either.
    ///
    /// Returns `false` if the walk was stopped.
    pub fn every_scope<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(&Scope) -> bool,
    {
        self.walk(&mut visit)
    }

    fn walk(&self, visit: &mut dyn FnMut(&Scope) -> bool) -> bool {
        if !visit(self) {
            return false;
        }
        let children: Vec<Scope> = self.inner.children.borrow().clone();
        for child in children {
            if !child.walk(visit) {
                return false;
            }
        }
        true
    }

    fn begin_phase(&self, phase: Phase) -> Result<(), ScopeError> {
        if let Some(active) = self.inner.phase.get() {
            return Err(ScopeError::PhaseInProgress(active));
        }
        self.inner.phase.set(Some(phase));
        Ok(())
    }

    fn clear_phase(&self) {
        self.inner.phase.set(None);
    }
}

/// Invoke a user callback with unwind isolation: a panic is logged and
/// absorbed so the surrounding pass or queue drain continues.
fn guarded<R>(unit: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            tracing::error!(unit, panic = panic_message(payload.as_ref()), "recovered panic");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
