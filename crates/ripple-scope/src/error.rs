#![forbid(unsafe_code)]

//! Fatal errors surfaced by the digest engine.
//!
//! Faults inside user callbacks (watch functions, listeners, queued
//! expressions, post-digest hooks) are recovered and logged at the point of
//! invocation and never appear here. The two conditions below indicate a
//! logic error in the watch graph or in scheduling usage and propagate to
//! the caller of the triggering operation.

/// Re-entrancy guard tag for a scope that is currently digesting or
/// applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// A digest loop is running on this scope.
    Digesting,
    /// An `apply` expression is being evaluated on this scope.
    Applying,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Digesting => write!(f, "digest"),
            Phase::Applying => write!(f, "apply"),
        }
    }
}

/// Errors from `Scope::digest` and `Scope::apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// `digest` or `apply` was called while a phase was already active on
    /// the same scope. Nesting is forbidden; this is the engine's only
    /// mutual-exclusion mechanism.
    PhaseInProgress(Phase),
    /// The digest loop was still dirty (or its async queue still
    /// non-empty) after the iteration bound. The watch graph does not
    /// converge.
    DigestUnstable {
        /// The iteration bound that was exhausted.
        ttl: u32,
    },
}

impl std::fmt::Display for ScopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PhaseInProgress(phase) => {
                write!(f, "{phase} already in progress")
            }
            Self::DigestUnstable { ttl } => {
                write!(f, "digest did not stabilize after {ttl} iterations")
            }
        }
    }
}

impl std::error::Error for ScopeError {}
