#![forbid(unsafe_code)]

//! Dynamic values observed by watchers, and the equality oracle.
//!
//! Scope data is untyped from the engine's point of view: a watch function
//! may surface a number, a string, or an arbitrarily nested list/map
//! structure. [`Value`] models that space with `Rc`-shared composites so
//! that external code can keep a handle to a list or map it has placed on
//! a scope and mutate it in place between digests.
//!
//! Two equality modes drive dirty-checking:
//!
//! - [`Value::ref_eq`]: reference mode. Primitives compare by value (with
//!   NaN treated as equal to itself, so a watcher observing NaN does not
//!   stay dirty forever); composites compare by pointer identity. Never
//!   clones.
//! - [`Value::deep_eq`]: deep mode. Full structural comparison, NaN
//!   self-equal at every level.
//!
//! # Invariants
//!
//! 1. `ref_eq` never allocates and never traverses composite contents.
//! 2. `deep_clone` shares no composite allocation with its input, at any
//!    depth, so a stored snapshot can never be retroactively changed by
//!    mutation of the live value.
//! 3. `deep_eq(a, deep_clone(a))` holds for every value, including values
//!    containing NaN.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A dynamic value as seen by watch functions and stored in scope data.
///
/// `List` and `Map` are shared handles: cloning a `Value` clones the
/// handle, not the contents. Use [`Value::deep_clone`] for a structural
/// copy.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<BTreeMap<String, Value>>>),
}

impl Value {
    /// Wrap a vector in a shared list handle.
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// Wrap a map in a shared map handle.
    pub fn map(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    /// Reference equality: primitives by value (NaN self-equal),
    /// composites by pointer identity.
    #[must_use]
    pub fn ref_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Deep structural equality, NaN self-equal at every level.
    #[must_use]
    pub fn deep_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.deep_eq(vb))
            }
            _ => self.ref_eq(other),
        }
    }

    /// Structural snapshot: fresh allocations for every composite level.
    #[must_use]
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::List(items) => {
                Value::list(items.borrow().iter().map(Value::deep_clone).collect())
            }
            Value::Map(entries) => Value::map(
                entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

/// Structural equality (same as [`Value::deep_eq`]).
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_eq(other)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s.as_str()))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ref_eq_primitives() {
        assert!(Value::from(1.5).ref_eq(&Value::from(1.5)));
        assert!(!Value::from(1.5).ref_eq(&Value::from(2.5)));
        assert!(Value::from("a").ref_eq(&Value::from("a")));
        assert!(Value::Null.ref_eq(&Value::Null));
        assert!(!Value::Null.ref_eq(&Value::from(false)));
    }

    #[test]
    fn ref_eq_nan_is_self_equal() {
        assert!(Value::from(f64::NAN).ref_eq(&Value::from(f64::NAN)));
    }

    #[test]
    fn ref_eq_composites_by_identity() {
        let a = Value::list(vec![Value::from(1.0)]);
        let b = a.clone();
        let c = Value::list(vec![Value::from(1.0)]);
        assert!(a.ref_eq(&b), "handle clone shares the allocation");
        assert!(!a.ref_eq(&c), "equal contents, distinct allocation");
    }

    #[test]
    fn deep_eq_structural() {
        let a = Value::list(vec![Value::from(1.0), Value::from("x")]);
        let b = Value::list(vec![Value::from(1.0), Value::from("x")]);
        assert!(a.deep_eq(&b));

        let mut m1 = BTreeMap::new();
        m1.insert("k".to_string(), a.clone());
        let mut m2 = BTreeMap::new();
        m2.insert("k".to_string(), b);
        assert!(Value::map(m1).deep_eq(&Value::map(m2)));
    }

    #[test]
    fn deep_eq_nan_inside_list() {
        let a = Value::list(vec![Value::from(f64::NAN)]);
        let b = Value::list(vec![Value::from(f64::NAN)]);
        assert!(a.deep_eq(&b));
    }

    #[test]
    fn deep_eq_detects_length_difference() {
        let a = Value::list(vec![Value::from(1.0)]);
        let b = Value::list(vec![Value::from(1.0), Value::from(2.0)]);
        assert!(!a.deep_eq(&b));
    }

    #[test]
    fn deep_clone_is_detached() {
        let live = Value::list(vec![Value::from(1.0)]);
        let snapshot = live.deep_clone();
        assert!(snapshot.deep_eq(&live));

        if let Value::List(items) = &live {
            items.borrow_mut().push(Value::from(2.0));
        }
        assert!(!snapshot.deep_eq(&live), "snapshot must not track mutation");
    }

    #[test]
    fn deep_clone_detaches_nested_levels() {
        let inner = Rc::new(RefCell::new(vec![Value::from(1.0)]));
        let live = Value::list(vec![Value::List(Rc::clone(&inner))]);
        let snapshot = live.deep_clone();

        inner.borrow_mut().push(Value::from(2.0));
        assert!(!snapshot.deep_eq(&live));
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<f64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(|s| Value::from(s.as_str())),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::list),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(Value::map),
            ]
        })
    }

    fn shares_allocation(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::List(x), Value::List(y)) => {
                Rc::ptr_eq(x, y)
                    || x.borrow()
                        .iter()
                        .zip(y.borrow().iter())
                        .any(|(va, vb)| shares_allocation(va, vb))
            }
            (Value::Map(x), Value::Map(y)) => {
                Rc::ptr_eq(x, y)
                    || x.borrow()
                        .values()
                        .zip(y.borrow().values())
                        .any(|(va, vb)| shares_allocation(va, vb))
            }
            _ => false,
        }
    }

    proptest! {
        #[test]
        fn deep_clone_is_deep_eq_and_fully_detached(v in value_strategy()) {
            let clone = v.deep_clone();
            prop_assert!(clone.deep_eq(&v));
            prop_assert!(!shares_allocation(&clone, &v));
        }

        #[test]
        fn deep_eq_is_reflexive(v in value_strategy()) {
            prop_assert!(v.deep_eq(&v));
        }
    }
}
