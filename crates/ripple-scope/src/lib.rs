#![forbid(unsafe_code)]

//! Dirty-checking scope tree and digest loop for the Ripple binding
//! framework.
//!
//! This crate is the evaluation core beneath a declarative UI-binding
//! layer. It knows nothing about rendering, templating, or expression
//! parsing; external collaborators register watchers, supply expressions
//! as closures, and read/write scope data through [`Scope`].
//!
//! - [`Scope`]: a node in a rooted tree of data containers. Non-isolated
//!   children inherit data through the parent chain; isolated children do
//!   not, but every scope in a tree shares the root's scheduling channels.
//! - [`Scope::watch`]: register an observation rule: a pure watch
//!   function paired with a side-effecting listener, triggered on change
//!   under reference or deep structural equality ([`Value`]).
//! - [`Scope::digest`] / [`Scope::apply`]: run the stabilization loop,
//!   repeated passes over the subtree's watchers until nothing changes,
//!   bounded by an iteration limit.
//! - [`Scope::eval_async`] / [`Scope::apply_async`] /
//!   [`Scope::post_digest`]: the three deferred-execution primitives,
//!   built on an explicit single-threaded [`TaskQueue`].
//! - [`watch_group`]: aggregate N watch functions into one coalesced
//!   listener.
//!
//! # Architecture
//!
//! Everything is single-threaded and cooperative: `Rc`/`RefCell` shared
//! ownership, `Weak` back-references, and an explicit task queue in place
//! of timers. Re-entrancy into `digest`/`apply` is rejected with
//! [`ScopeError::PhaseInProgress`]; a watch graph that never settles is
//! rejected with [`ScopeError::DigestUnstable`]. Panics inside user
//! callbacks are recovered per unit of work and logged via `tracing`.
//!
//! # Example
//!
//! ```
//! use ripple_scope::{Scope, Value};
//!
//! let root = Scope::root();
//! root.set("count", 0.0);
//!
//! let child = root.new_child(false);
//! child.watch(
//!     |s| s.get("count").unwrap_or(Value::Null),
//!     |new, _old, _s| {
//!         let _ = new.as_number();
//!     },
//!     false,
//! );
//!
//! root.apply(|s| s.set("count", 1.0)).unwrap();
//! ```

pub mod error;
pub mod scheduler;
pub mod scope;
pub mod value;
pub mod watch_group;

pub use error::{Phase, ScopeError};
pub use scheduler::{TaskId, TaskQueue};
pub use scope::{DEFAULT_TTL, Scope, WatchHandle};
pub use value::Value;
pub use watch_group::{WatchGroupHandle, watch_group};
