//! Erased effect descriptions consumed by the interpreter.
//!
//! The public [`Effect`](super::Effect) type is a thin typed wrapper over
//! [`Repr`], a closed sum of description nodes. Values and errors flow
//! through the interpreter type-erased: success values as boxed `Any`
//! payloads moved linearly from node to node, typed errors as
//! [`ErasedError`] (the original value plus a debug rendering captured at
//! erasure time, so failures stripped during interruption can still be
//! reported meaningfully).
//!
//! Nodes are immutable once constructed; continuations are `FnOnce`
//! closures consumed exactly once when the interpreter reaches them.

use crate::cause::Cause;
use crate::exit::Exit;
use crate::fiber_ref::ErasedFiberRef;
use crate::log::LogLevel;
use crate::runtime::RuntimeConfig;
use crate::scope::Scope;
use crate::supervisor::Supervisor;
use crate::types::FiberId;
use core::fmt;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::any::Any;
use std::sync::Arc;

/// A type-erased success value.
pub(crate) type AnyValue = Box<dyn Any + Send>;

/// A type-erased error: the original value plus its debug rendering.
pub(crate) struct ErasedError {
    pub(crate) value: AnyValue,
    pub(crate) rendered: String,
}

impl ErasedError {
    pub(crate) fn new<E: Send + fmt::Debug + 'static>(error: E) -> Self {
        let rendered = format!("{error:?}");
        Self {
            value: Box::new(error),
            rendered,
        }
    }
}

impl fmt::Debug for ErasedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErasedError({})", self.rendered)
    }
}

/// The cause type flowing through the interpreter.
pub(crate) type DynCause = Cause<ErasedError>;

/// The exit type flowing through the interpreter.
pub(crate) type DynExit = Exit<AnyValue, ErasedError>;

/// A fiber's terminal exit, shared between observers.
///
/// The mutex exists only to make the erased payload shareable across
/// threads; the exit is never mutated after publication.
#[derive(Clone)]
pub(crate) struct ExitCell(Arc<Mutex<DynExit>>);

impl ExitCell {
    pub(crate) fn new(exit: DynExit) -> Self {
        Self(Arc::new(Mutex::new(exit)))
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&DynExit) -> R) -> R {
        f(&self.0.lock())
    }

    pub(crate) fn is_success(&self) -> bool {
        self.with(Exit::is_success)
    }
}

impl fmt::Debug for ExitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|exit| match exit {
            Exit::Success(_) => write!(f, "ExitCell(success)"),
            Exit::Failure(c) => write!(f, "ExitCell(failure: {c:?})"),
        })
    }
}

/// Success continuation.
pub(crate) type Cont = Box<dyn FnOnce(AnyValue) -> Repr + Send>;
/// Failure continuation, receiving the full propagating cause.
pub(crate) type ErrCont = Box<dyn FnOnce(DynCause) -> Repr + Send>;
/// Resume callback handed to an async registration; invoked at most once.
pub(crate) type ResumeInner = Box<dyn FnOnce(Repr) + Send>;

/// Result of invoking an async registration callback.
pub(crate) enum AsyncAction {
    /// The fiber stays suspended; an optional cancellation effect is
    /// registered for use if the fiber is interrupted while suspended.
    Pending(Option<Repr>),
    /// The callback produced a result synchronously.
    Ready(Repr),
}

/// Continuation applied when one side of a race completes first. Receives
/// the winner's exit and the loser's fiber.
pub(crate) type RaceCont =
    Box<dyn FnOnce(ExitCell, Arc<crate::fiber::context::FiberContext>) -> Repr + Send>;

/// The two racing effects and their win handlers.
pub(crate) struct RaceSpec {
    pub(crate) left: Repr,
    pub(crate) right: Repr,
    pub(crate) left_wins: RaceCont,
    pub(crate) right_wins: RaceCont,
    pub(crate) scope: Option<Scope>,
}

/// A type-erased effect description node.
pub(crate) enum Repr {
    /// An already-computed value.
    SucceedNow(AnyValue),
    /// A deferred synchronous computation.
    Succeed(Box<dyn FnOnce() -> AnyValue + Send>),
    /// Deferred construction of an effect.
    Suspend(Box<dyn FnOnce() -> Repr + Send>),
    /// Sequential composition.
    FlatMap(Box<Repr>, Cont),
    /// A failure, deferred until reached.
    Fail(Box<dyn FnOnce() -> DynCause + Send>),
    /// Failure/success fold; the nearest error handler during unwinds.
    Fold {
        effect: Box<Repr>,
        failure: ErrCont,
        success: Cont,
    },
    /// Asynchronous suspension.
    Async {
        register: Box<dyn FnOnce(ResumeInner) -> AsyncAction + Send>,
        blocking_on: SmallVec<[FiberId; 2]>,
    },
    /// Fork a child fiber into the given scope (current scope if `None`).
    Fork {
        effect: Box<Repr>,
        scope: Option<Scope>,
    },
    /// Set the interruptibility of the body, restoring it afterward.
    InterruptStatus {
        interruptible: bool,
        effect: Box<Repr>,
    },
    /// Observe the current interruptibility.
    CheckInterruptible(Box<dyn FnOnce(bool) -> Repr + Send>),
    /// Race two effects; exactly one win handler fires.
    RaceWith(Box<RaceSpec>),
    /// Observe the scope new children are forked into.
    GetForkScope(Box<dyn FnOnce(Scope) -> Repr + Send>),
    /// Override the fork scope for the extent of the body.
    OverrideForkScope {
        scope: Option<Scope>,
        effect: Box<Repr>,
    },
    /// Run a finalizer after the body, on every termination path.
    Ensuring {
        effect: Box<Repr>,
        finalizer: Box<Repr>,
    },
    /// Read-modify-write of a fiber-local variable.
    FiberRefModify {
        fiber_ref: Arc<ErasedFiberRef>,
        #[allow(clippy::type_complexity)]
        modify: Box<dyn FnOnce(AnyValue) -> (AnyValue, AnyValue) + Send>,
    },
    /// Scoped override of a fiber-local variable with guaranteed restore.
    FiberRefLocally {
        fiber_ref: Arc<ErasedFiberRef>,
        value: AnyValue,
        effect: Box<Repr>,
    },
    /// Remove a fiber-local variable from this fiber.
    FiberRefDelete(Arc<ErasedFiberRef>),
    /// Continue with the current value of a fiber-local variable.
    FiberRefWith {
        fiber_ref: Arc<ErasedFiberRef>,
        with: Cont,
    },
    /// Compose a supervisor with the current one for the body's extent.
    Supervise {
        supervisor: Arc<dyn Supervisor>,
        effect: Box<Repr>,
    },
    /// Continue with a snapshot of the running fiber.
    Descriptor(Box<dyn FnOnce(crate::fiber::FiberDescriptor) -> Repr + Send>),
    /// Yield the worker back to the scheduler.
    Yield,
    /// Emit a log entry through the configured loggers.
    Logged {
        level: LogLevel,
        message: Box<dyn FnOnce() -> String + Send>,
    },
    /// Replace the fiber's runtime configuration.
    SetConfig(RuntimeConfig),
    /// Interpreter-internal: restore a previous supervisor.
    SetSupervisor(Arc<dyn Supervisor>),
    /// Interpreter-internal: fold a completed child's fiber-locals into
    /// the running fiber.
    InheritRefs(Arc<crate::fiber::context::FiberContext>),
}

impl Repr {
    /// The unit value as an effect.
    pub(crate) fn unit() -> Self {
        Self::SucceedNow(Box::new(()))
    }

    pub(crate) fn succeed_now<A: Send + 'static>(value: A) -> Self {
        Self::SucceedNow(Box::new(value))
    }

    pub(crate) fn fail_cause_now(cause: DynCause) -> Self {
        Self::Fail(Box::new(move || cause))
    }

    pub(crate) fn flat_map(self, k: impl FnOnce(AnyValue) -> Repr + Send + 'static) -> Self {
        Self::FlatMap(Box::new(self), Box::new(k))
    }

    /// Sequences `self` before `next`, discarding `self`'s value.
    pub(crate) fn zip_right(self, next: Repr) -> Self {
        self.flat_map(move |_| next)
    }

    pub(crate) fn from_exit(exit: DynExit) -> Self {
        match exit {
            Exit::Success(v) => Self::SucceedNow(v),
            Exit::Failure(c) => Self::fail_cause_now(c),
        }
    }

    /// Stable name of the node kind, for supervision and diagnostics.
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Self::SucceedNow(_) => "SucceedNow",
            Self::Succeed(_) => "Succeed",
            Self::Suspend(_) => "Suspend",
            Self::FlatMap(..) => "FlatMap",
            Self::Fail(_) => "Fail",
            Self::Fold { .. } => "Fold",
            Self::Async { .. } => "Async",
            Self::Fork { .. } => "Fork",
            Self::InterruptStatus { .. } => "InterruptStatus",
            Self::CheckInterruptible(_) => "CheckInterruptible",
            Self::RaceWith(_) => "RaceWith",
            Self::GetForkScope(_) => "GetForkScope",
            Self::OverrideForkScope { .. } => "OverrideForkScope",
            Self::Ensuring { .. } => "Ensuring",
            Self::FiberRefModify { .. } => "FiberRefModify",
            Self::FiberRefLocally { .. } => "FiberRefLocally",
            Self::FiberRefDelete(_) => "FiberRefDelete",
            Self::FiberRefWith { .. } => "FiberRefWith",
            Self::Supervise { .. } => "Supervise",
            Self::Descriptor(_) => "Descriptor",
            Self::Yield => "Yield",
            Self::Logged { .. } => "Logged",
            Self::SetConfig(_) => "SetConfig",
            Self::SetSupervisor(_) => "SetSupervisor",
            Self::InheritRefs(_) => "InheritRefs",
        }
    }
}

impl fmt::Debug for Repr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Repr::{}", self.tag())
    }
}

/// Rebuilds a typed cause from an erased one, by reference.
///
/// Erased failures that do not downcast to `E` become defects carrying
/// the rendering captured at erasure time. This only happens when the
/// typed boundary is crossed with a different error type than the one
/// that produced the failure, which the typed API does not allow; the
/// defect conversion keeps the runtime total either way.
pub(crate) fn typed_cause<E: Clone + 'static>(cause: &DynCause) -> Cause<E> {
    match cause {
        Cause::Empty => Cause::Empty,
        Cause::Fail(erased) => match erased.value.downcast_ref::<E>() {
            Some(e) => Cause::Fail(e.clone()),
            None => Cause::Die(crate::types::Defect::new(erased.rendered.clone())),
        },
        Cause::Die(d) => Cause::Die(d.clone()),
        Cause::Interrupt(id) => Cause::Interrupt(*id),
        Cause::Then(a, b) => Cause::Then(Box::new(typed_cause(a)), Box::new(typed_cause(b))),
        Cause::Both(a, b) => Cause::Both(Box::new(typed_cause(a)), Box::new(typed_cause(b))),
    }
}

/// Owning variant of [`typed_cause`]: no `Clone` bound, since the erased
/// values are moved out.
pub(crate) fn typed_cause_owned<E: 'static>(cause: DynCause) -> Cause<E> {
    match cause {
        Cause::Empty => Cause::Empty,
        Cause::Fail(erased) => {
            let rendered = erased.rendered;
            match erased.value.downcast::<E>() {
                Ok(e) => Cause::Fail(*e),
                Err(_) => Cause::Die(crate::types::Defect::new(rendered)),
            }
        }
        Cause::Die(d) => Cause::Die(d),
        Cause::Interrupt(id) => Cause::Interrupt(id),
        Cause::Then(a, b) => Cause::Then(
            Box::new(typed_cause_owned(*a)),
            Box::new(typed_cause_owned(*b)),
        ),
        Cause::Both(a, b) => Cause::Both(
            Box::new(typed_cause_owned(*a)),
            Box::new(typed_cause_owned(*b)),
        ),
    }
}

/// Erases a typed cause back into the interpreter's representation.
pub(crate) fn erase_cause<E: Send + fmt::Debug + 'static>(cause: Cause<E>) -> DynCause {
    match cause {
        Cause::Empty => Cause::Empty,
        Cause::Fail(e) => Cause::Fail(ErasedError::new(e)),
        Cause::Die(d) => Cause::Die(d),
        Cause::Interrupt(id) => Cause::Interrupt(id),
        Cause::Then(a, b) => {
            Cause::Then(Box::new(erase_cause(*a)), Box::new(erase_cause(*b)))
        }
        Cause::Both(a, b) => {
            Cause::Both(Box::new(erase_cause(*a)), Box::new(erase_cause(*b)))
        }
    }
}

/// Rebuilds a typed exit from a shared erased exit.
///
/// The success value is cloned out of the cell, which is why awaiting a
/// fiber requires `A: Clone`: every observer receives the same exit.
pub(crate) fn typed_exit<A, E>(cell: &ExitCell) -> Exit<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    cell.with(|exit| match exit {
        Exit::Success(v) => match v.downcast_ref::<A>() {
            Some(value) => Exit::Success(value.clone()),
            None => Exit::Failure(Cause::Die(crate::types::Defect::new(
                "fiber success value had an unexpected type",
            ))),
        },
        Exit::Failure(c) => Exit::Failure(typed_cause(c)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erased_error_round_trips() {
        let erased = ErasedError::new("nope");
        assert_eq!(erased.rendered, "\"nope\"");
        assert_eq!(erased.value.downcast_ref::<&str>(), Some(&"nope"));
    }

    #[test]
    fn typed_cause_downcasts_failures() {
        let cause: DynCause = Cause::then(
            Cause::Fail(ErasedError::new(7_u32)),
            Cause::Interrupt(FiberId::new_for_test(3)),
        );
        let typed: Cause<u32> = typed_cause(&cause);
        assert_eq!(typed.failures(), vec![&7_u32]);
        assert!(typed.contains_interruptor(FiberId::new_for_test(3)));
    }

    #[test]
    fn typed_cause_converts_mismatches_to_defects() {
        let cause: DynCause = Cause::Fail(ErasedError::new("text"));
        let typed: Cause<u64> = typed_cause(&cause);
        assert!(typed.failures().is_empty());
        assert_eq!(typed.defects().len(), 1);
    }

    #[test]
    fn exit_cell_is_shareable() {
        let cell = ExitCell::new(Exit::Success(Box::new(5_i32)));
        let typed: Exit<i32, ()> = typed_exit(&cell);
        assert_eq!(typed, Exit::Success(5));
        let again: Exit<i32, ()> = typed_exit(&cell);
        assert_eq!(again, Exit::Success(5));
    }
}
