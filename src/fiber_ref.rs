//! Fiber-local variables.
//!
//! A [`FiberRef`] is a mutable cell scoped to a single fiber. Forking
//! copies (or resets) the parent's value into the child; joining a child
//! folds the child's final values back into the joiner according to each
//! ref's join policy. All access goes through effects, so reads and writes
//! are sequenced with the rest of the fiber's program.

use crate::effect::repr::AnyValue;
use crate::effect::Effect;
use core::fmt;
use core::marker::PhantomData;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a fiber-ref's value propagates to forked children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkBehavior {
    /// The child starts with a copy of the parent's current value.
    Copy,
    /// The child starts from the initial value.
    Reset,
}

type InitFn = Box<dyn Fn() -> AnyValue + Send + Sync>;
type CloneFn = Box<dyn Fn(&AnyValue) -> AnyValue + Send + Sync>;
type JoinFn = Box<dyn Fn(AnyValue, AnyValue) -> AnyValue + Send + Sync>;

/// Type-erased descriptor of one fiber-ref: identity plus the operations
/// the interpreter needs without knowing `T`.
pub(crate) struct ErasedFiberRef {
    pub(crate) id: u64,
    pub(crate) initial: InitFn,
    pub(crate) clone_val: CloneFn,
    pub(crate) fork: ForkBehavior,
    pub(crate) join: Option<JoinFn>,
}

impl fmt::Debug for ErasedFiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedFiberRef")
            .field("id", &self.id)
            .field("fork", &self.fork)
            .finish_non_exhaustive()
    }
}

fn next_ref_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A typed fiber-local variable.
///
/// Cloning the handle is cheap and refers to the same variable; identity
/// is the handle, not the type.
pub struct FiberRef<T> {
    inner: Arc<ErasedFiberRef>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for FiberRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for FiberRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberRef({})", self.inner.id)
    }
}

impl<T: Clone + Send + Sync + 'static> FiberRef<T> {
    /// Creates a fiber-ref with the given initial value. Children inherit
    /// a copy of the parent's value; joins let the child's value win.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self::with_policy(initial, ForkBehavior::Copy, None)
    }

    /// Creates a fiber-ref whose children start from the initial value
    /// instead of inheriting the parent's.
    #[must_use]
    pub fn new_resetting(initial: T) -> Self {
        Self::with_policy(initial, ForkBehavior::Reset, None)
    }

    /// Creates a fiber-ref with an explicit join: when a child is joined,
    /// `join(parent_value, child_value)` becomes the joiner's value.
    #[must_use]
    pub fn new_with_join(
        initial: T,
        join: impl Fn(T, T) -> T + Send + Sync + 'static,
    ) -> Self {
        Self::with_policy(initial, ForkBehavior::Copy, Some(Box::new(join)))
    }

    fn with_policy(
        initial: T,
        fork: ForkBehavior,
        join: Option<Box<dyn Fn(T, T) -> T + Send + Sync>>,
    ) -> Self {
        let join = join.map(|f| -> JoinFn {
            Box::new(move |parent, child| {
                let parent = downcast::<T>(parent);
                let child = downcast::<T>(child);
                Box::new(f(parent, child))
            })
        });
        let init = initial.clone();
        Self {
            inner: Arc::new(ErasedFiberRef {
                id: next_ref_id(),
                initial: Box::new(move || Box::new(init.clone())),
                clone_val: Box::new(|v| {
                    let v = v
                        .downcast_ref::<T>()
                        .expect("fiber-ref value has the ref's type");
                    Box::new(v.clone())
                }),
                fork,
                join,
            }),
            _marker: PhantomData,
        }
    }

    /// Reads the current value in the running fiber.
    #[must_use]
    pub fn get(&self) -> Effect<T> {
        Effect::fiber_ref_with(Arc::clone(&self.inner), |v| downcast::<T>(v))
    }

    /// Replaces the value in the running fiber.
    #[must_use]
    pub fn set(&self, value: T) -> Effect<()> {
        self.update(move |_| value.clone())
    }

    /// Applies `f` to the current value.
    #[must_use]
    pub fn update(&self, f: impl Fn(T) -> T + Send + 'static) -> Effect<()> {
        self.modify(move |t| ((), f(t)))
    }

    /// Atomically (with respect to this fiber) computes a result and a new
    /// value from the current one.
    #[must_use]
    pub fn modify<B: Send + 'static>(
        &self,
        f: impl FnOnce(T) -> (B, T) + Send + 'static,
    ) -> Effect<B> {
        Effect::fiber_ref_modify(Arc::clone(&self.inner), move |v| {
            let (b, t) = f(downcast::<T>(v));
            (Box::new(b) as AnyValue, Box::new(t) as AnyValue)
        })
    }

    /// Runs `effect` with the value set to `value`, restoring the previous
    /// value afterward on every termination path.
    #[must_use]
    pub fn locally<A, E>(&self, value: T, effect: Effect<A, E>) -> Effect<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        Effect::fiber_ref_locally(Arc::clone(&self.inner), Box::new(value), effect)
    }

    /// Removes the value from the running fiber; the next read re-runs the
    /// initializer.
    #[must_use]
    pub fn delete(&self) -> Effect<()> {
        Effect::fiber_ref_delete(Arc::clone(&self.inner))
    }

    pub(crate) fn erased(&self) -> Arc<ErasedFiberRef> {
        Arc::clone(&self.inner)
    }
}

fn downcast<T: 'static>(value: AnyValue) -> T {
    *value
        .downcast::<T>()
        .expect("fiber-ref value has the ref's type")
}

/// The fiber-ref table carried by each fiber's run state.
#[derive(Default)]
pub(crate) struct FiberRefs {
    entries: HashMap<u64, (Arc<ErasedFiberRef>, AnyValue)>,
}

impl FiberRefs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current value of `r`, initializing it if absent; cloned out.
    pub(crate) fn get_cloned(&mut self, r: &Arc<ErasedFiberRef>) -> AnyValue {
        let (erased, value) = self
            .entries
            .entry(r.id)
            .or_insert_with(|| (Arc::clone(r), (r.initial)()));
        (erased.clone_val)(value)
    }

    /// Read-modify-write; returns the result half of `f`.
    pub(crate) fn modify(
        &mut self,
        r: &Arc<ErasedFiberRef>,
        f: impl FnOnce(AnyValue) -> (AnyValue, AnyValue),
    ) -> AnyValue {
        let current = match self.entries.remove(&r.id) {
            Some((_, value)) => value,
            None => (r.initial)(),
        };
        let (result, next) = f(current);
        self.entries.insert(r.id, (Arc::clone(r), next));
        result
    }

    pub(crate) fn set(&mut self, r: &Arc<ErasedFiberRef>, value: AnyValue) {
        self.entries.insert(r.id, (Arc::clone(r), value));
    }

    pub(crate) fn delete(&mut self, r: &Arc<ErasedFiberRef>) {
        self.entries.remove(&r.id);
    }

    /// The table a forked child starts with.
    pub(crate) fn fork_child(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|(&id, (erased, value))| {
                let child_value = match erased.fork {
                    ForkBehavior::Copy => (erased.clone_val)(value),
                    ForkBehavior::Reset => (erased.initial)(),
                };
                (id, (Arc::clone(erased), child_value))
            })
            .collect();
        Self { entries }
    }

    /// Folds a completed child's table into this one. Refs with a join
    /// policy combine both values; otherwise the child's value wins.
    pub(crate) fn join(&mut self, child: Self) {
        for (id, (erased, child_value)) in child.entries {
            match &erased.join {
                Some(join) => {
                    let parent_value = match self.entries.remove(&id) {
                        Some((_, value)) => value,
                        None => (erased.initial)(),
                    };
                    let joined = join(parent_value, child_value);
                    self.entries.insert(id, (erased, joined));
                }
                None => {
                    self.entries.insert(id, (erased, child_value));
                }
            }
        }
    }
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberRefs({} entries)", self.entries.len())
    }
}
