//! The typed effect builder API.
//!
//! An [`Effect<A, E>`] is an immutable description of a computation that,
//! when executed on a fiber, produces an `A` or fails with a typed `E`
//! (plus defects and interruption, tracked in [`Cause`]). Building an
//! effect runs nothing; a [`Runtime`](crate::runtime::Runtime) executes
//! it. Internally the typed layer is phantom: combinators build erased
//! [`repr::Repr`] nodes and the types are restored at the boundaries.
//!
//! Failure values require `E: Debug` at the point they enter an effect;
//! the debug rendering is captured so that errors discarded during
//! interruption can still be reported as defects.

pub(crate) mod repr;

use crate::cause::Cause;
use crate::exit::Exit;
use crate::fiber::context::FiberContext;
use crate::fiber::{Fiber, FiberDescriptor};
use crate::log::LogLevel;
use crate::runtime::RuntimeConfig;
use crate::scope::Scope;
use crate::supervisor::Supervisor;
use crate::types::{Defect, FiberId};
use core::fmt;
use core::marker::PhantomData;
use repr::{
    erase_cause, typed_cause_owned, typed_exit, AnyValue, AsyncAction, DynCause, ErasedError,
    RaceCont, RaceSpec, Repr, ResumeInner,
};
use smallvec::SmallVec;
use std::convert::Infallible;
use std::sync::Arc;

/// An immutable description of a computation.
#[must_use = "effects describe computations and do nothing unless executed"]
pub struct Effect<A, E = Infallible> {
    repr: Repr,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Effect({})", self.repr.tag())
    }
}

/// Recovers a value moved through the erased layer.
fn unbox<A: 'static>(value: AnyValue) -> Result<A, Repr> {
    value.downcast::<A>().map(|boxed| *boxed).map_err(|_| {
        Repr::fail_cause_now(Cause::Die(Defect::new(
            "effect value had an unexpected type",
        )))
    })
}

/// Re-erases a cause known to carry no typed failures (the residue of
/// [`Cause::failure_or_cause`]). Kept total: a stray failure becomes a
/// defect.
fn residual_cause<E: 'static>(cause: Cause<E>) -> DynCause {
    match cause {
        Cause::Empty => Cause::Empty,
        Cause::Fail(_) => Cause::Die(Defect::new("typed failure escaped its handler")),
        Cause::Die(d) => Cause::Die(d),
        Cause::Interrupt(id) => Cause::Interrupt(id),
        Cause::Then(a, b) => Cause::then(residual_cause(*a), residual_cause(*b)),
        Cause::Both(a, b) => Cause::both(residual_cause(*a), residual_cause(*b)),
    }
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn from_repr(repr: Repr) -> Self {
        Self {
            repr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_repr(self) -> Repr {
        self.repr
    }

    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_repr(Repr::succeed_now(value))
    }

    /// An effect that runs `thunk` when executed and succeeds with its
    /// result. A panic in the thunk becomes a defect.
    pub fn succeed_with(thunk: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_repr(Repr::Succeed(Box::new(move || Box::new(thunk()))))
    }

    /// Defers construction of an effect until it is executed.
    pub fn suspend(make: impl FnOnce() -> Effect<A, E> + Send + 'static) -> Self {
        Self::from_repr(Repr::Suspend(Box::new(move || make().into_repr())))
    }

    /// An effect that fails with the typed error.
    pub fn fail(error: E) -> Self
    where
        E: fmt::Debug,
    {
        Self::from_repr(Repr::Fail(Box::new(move || {
            Cause::Fail(ErasedError::new(error))
        })))
    }

    /// An effect that fails with a full cause.
    pub fn fail_cause(cause: Cause<E>) -> Self
    where
        E: fmt::Debug,
    {
        Self::from_repr(Repr::Fail(Box::new(move || erase_cause(cause))))
    }

    /// An effect that dies with an unrecoverable defect.
    pub fn die(defect: Defect) -> Self {
        Self::from_repr(Repr::Fail(Box::new(move || Cause::Die(defect))))
    }

    /// Lifts a `Result` into an effect.
    pub fn from_result(result: Result<A, E>) -> Self
    where
        E: fmt::Debug,
    {
        match result {
            Ok(value) => Self::succeed(value),
            Err(error) => Self::fail(error),
        }
    }

    /// An effect that never completes (but remains interruptible).
    pub fn never() -> Self {
        Self::from_repr(Repr::Async {
            register: Box::new(|_resume| AsyncAction::Pending(None)),
            blocking_on: SmallVec::new(),
        })
    }

    /// An effect that interrupts the running fiber, attributed to itself.
    pub fn interrupt() -> Self {
        Self::from_repr(Repr::Descriptor(Box::new(|descriptor| {
            Repr::fail_cause_now(Cause::Interrupt(descriptor.id))
        })))
    }

    /// Maps the success value.
    pub fn map<B: Send + 'static>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E> {
        Effect::from_repr(self.repr.flat_map(move |value| match unbox::<A>(value) {
            Ok(a) => Repr::succeed_now(f(a)),
            Err(die) => die,
        }))
    }

    /// Sequences a dependent effect after this one.
    pub fn and_then<B: Send + 'static>(
        self,
        f: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E> {
        Effect::from_repr(self.repr.flat_map(move |value| match unbox::<A>(value) {
            Ok(a) => f(a).into_repr(),
            Err(die) => die,
        }))
    }

    /// Sequences `that` after this effect, keeping `that`'s value.
    pub fn zip_right<B: Send + 'static>(self, that: Effect<B, E>) -> Effect<B, E> {
        Effect::from_repr(self.repr.zip_right(that.repr))
    }

    /// Runs both effects in order and combines their values.
    pub fn zip_with<B, C>(
        self,
        that: Effect<B, E>,
        f: impl FnOnce(A, B) -> C + Send + 'static,
    ) -> Effect<C, E>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        self.and_then(move |a| that.map(move |b| f(a, b)))
    }

    /// The fundamental error boundary: handles the full cause of a
    /// failure, or continues with the value.
    pub fn fold_cause<B, E2>(
        self,
        failure: impl FnOnce(Cause<E>) -> Effect<B, E2> + Send + 'static,
        success: impl FnOnce(A) -> Effect<B, E2> + Send + 'static,
    ) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
    {
        Effect::from_repr(Repr::Fold {
            effect: Box::new(self.repr),
            failure: Box::new(move |cause| failure(typed_cause_owned(cause)).into_repr()),
            success: Box::new(move |value| match unbox::<A>(value) {
                Ok(a) => success(a).into_repr(),
                Err(die) => die,
            }),
        })
    }

    /// Handles the typed error only; defects and interruption propagate.
    pub fn fold<B: Send + 'static>(
        self,
        failure: impl FnOnce(E) -> B + Send + 'static,
        success: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<B> {
        self.fold_cause(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => Effect::succeed(failure(error)),
                Err(rest) => Effect::from_repr(Repr::fail_cause_now(residual_cause(rest))),
            },
            move |a| Effect::succeed(success(a)),
        )
    }

    /// Recovers from the typed error; defects and interruption propagate.
    pub fn catch_all<E2: Send + 'static>(
        self,
        f: impl FnOnce(E) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2> {
        self.fold_cause(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => f(error),
                Err(rest) => Effect::from_repr(Repr::fail_cause_now(residual_cause(rest))),
            },
            Effect::succeed,
        )
    }

    /// Maps the typed error.
    pub fn map_error<E2>(self, f: impl FnOnce(E) -> E2 + Send + 'static) -> Effect<A, E2>
    where
        E2: Send + fmt::Debug + 'static,
    {
        self.catch_all(move |error| Effect::fail(f(error)))
    }

    /// Materializes the outcome: the resulting effect always succeeds,
    /// with this effect's exit.
    pub fn exit(self) -> Effect<Exit<A, E>> {
        self.fold_cause(
            |cause| Effect::succeed(Exit::Failure(cause)),
            |value| Effect::succeed(Exit::Success(value)),
        )
    }

    /// Registers a finalizer that runs after this effect on every
    /// termination path, with interruption disabled. Finalizer failures
    /// are appended to the propagating cause, never replacing it.
    pub fn ensuring(self, finalizer: Effect<()>) -> Self {
        Self::from_repr(Repr::Ensuring {
            effect: Box::new(self.repr),
            finalizer: Box::new(finalizer.into_repr()),
        })
    }

    /// Makes the effect interruptible for its extent.
    pub fn interruptible(self) -> Self {
        Self::from_repr(Repr::InterruptStatus {
            interruptible: true,
            effect: Box::new(self.repr),
        })
    }

    /// Shields the effect from interruption for its extent. Pending
    /// interrupts take effect when interruptibility is restored.
    pub fn uninterruptible(self) -> Self {
        Self::from_repr(Repr::InterruptStatus {
            interruptible: false,
            effect: Box::new(self.repr),
        })
    }

    /// Continues with the current interruptibility.
    pub fn check_interruptible(
        f: impl FnOnce(bool) -> Effect<A, E> + Send + 'static,
    ) -> Self {
        Self::from_repr(Repr::CheckInterruptible(Box::new(move |flag| {
            f(flag).into_repr()
        })))
    }

    /// An asynchronous effect. `register` receives a resume handle usable
    /// exactly once from any thread; it either keeps the fiber suspended
    /// (optionally providing a cancellation effect run if the fiber is
    /// interrupted while suspended) or completes synchronously.
    pub fn async_(
        register: impl FnOnce(AsyncResume<A, E>) -> AsyncOutcome<A, E> + Send + 'static,
    ) -> Self {
        Self::async_blocking_on(register, Vec::new())
    }

    /// [`async_`](Self::async_) with a hint of which fibers the suspension
    /// waits on, surfaced in diagnostics.
    pub fn async_blocking_on(
        register: impl FnOnce(AsyncResume<A, E>) -> AsyncOutcome<A, E> + Send + 'static,
        blocking_on: Vec<FiberId>,
    ) -> Self {
        Self::from_repr(Repr::Async {
            register: Box::new(move |resume| {
                let handle = AsyncResume {
                    inner: resume,
                    _marker: PhantomData,
                };
                match register(handle) {
                    AsyncOutcome::Pending(canceler) => {
                        AsyncAction::Pending(canceler.map(Effect::into_repr))
                    }
                    AsyncOutcome::Ready(effect) => AsyncAction::Ready(effect.into_repr()),
                }
            }),
            blocking_on: blocking_on.into_iter().collect(),
        })
    }

    /// Starts the effect on a new fiber in the current fork scope and
    /// succeeds immediately with its handle.
    pub fn fork(self) -> Effect<Fiber<A, E>> {
        self.fork_repr(None)
    }

    /// Forks into an explicit scope.
    pub fn fork_in(self, scope: Scope) -> Effect<Fiber<A, E>> {
        self.fork_repr(Some(scope))
    }

    /// Forks as a daemon: the child is not tied to any fiber's lifetime.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>> {
        self.fork_in(Scope::global())
    }

    fn fork_repr(self, scope: Option<Scope>) -> Effect<Fiber<A, E>> {
        let fork = Repr::Fork {
            effect: Box::new(self.repr),
            scope,
        };
        Effect::from_repr(fork.flat_map(|value| match unbox::<Arc<FiberContext>>(value) {
            Ok(context) => Repr::succeed_now(Fiber::<A, E>::from_context(context)),
            Err(die) => die,
        }))
    }

    /// Races two effects: both are forked, and exactly one win handler
    /// runs, receiving the first exit and the other fiber's handle. The
    /// loser keeps running unless the handler interrupts it.
    pub fn race_with<B, E2, C, E3>(
        self,
        that: Effect<B, E2>,
        left_wins: impl FnOnce(Exit<A, E>, Fiber<B, E2>) -> Effect<C, E3> + Send + 'static,
        right_wins: impl FnOnce(Exit<B, E2>, Fiber<A, E>) -> Effect<C, E3> + Send + 'static,
    ) -> Effect<C, E3>
    where
        A: Clone,
        E: Clone,
        B: Clone + Send + 'static,
        E2: Clone + Send + 'static,
        C: Send + 'static,
        E3: Send + 'static,
    {
        let left_wins: RaceCont = Box::new(move |cell, loser| {
            left_wins(typed_exit::<A, E>(&cell), Fiber::from_context(loser)).into_repr()
        });
        let right_wins: RaceCont = Box::new(move |cell, loser| {
            right_wins(typed_exit::<B, E2>(&cell), Fiber::from_context(loser)).into_repr()
        });
        Effect::from_repr(Repr::RaceWith(Box::new(RaceSpec {
            left: self.repr,
            right: that.repr,
            left_wins,
            right_wins,
            scope: None,
        })))
    }

    /// Races two effects of the same type: the first to terminate wins,
    /// the loser is interrupted and awaited, and the winner's exit becomes
    /// the result.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E>
    where
        A: Clone,
        E: Clone + fmt::Debug,
    {
        self.race_with(that, settle_race, settle_race)
    }

    /// Composes `supervisor` with the current one for this effect's
    /// extent; the previous supervisor is restored afterward.
    pub fn supervised(self, supervisor: Arc<dyn Supervisor>) -> Self {
        Self::from_repr(Repr::Supervise {
            supervisor,
            effect: Box::new(self.repr),
        })
    }

    /// Continues with a snapshot of the running fiber.
    pub fn with_descriptor(
        f: impl FnOnce(FiberDescriptor) -> Effect<A, E> + Send + 'static,
    ) -> Self {
        Self::from_repr(Repr::Descriptor(Box::new(move |descriptor| {
            f(descriptor).into_repr()
        })))
    }

    /// Overrides the scope children are forked into for this effect's
    /// extent (`None` restores the default, the forker's own scope).
    pub fn override_fork_scope(self, scope: Option<Scope>) -> Self {
        Self::from_repr(Repr::OverrideForkScope {
            scope,
            effect: Box::new(self.repr),
        })
    }

    pub(crate) fn fiber_ref_locally(
        fiber_ref: Arc<crate::fiber_ref::ErasedFiberRef>,
        value: AnyValue,
        effect: Effect<A, E>,
    ) -> Self {
        Self::from_repr(Repr::FiberRefLocally {
            fiber_ref,
            value,
            effect: Box::new(effect.into_repr()),
        })
    }
}

impl<A> Effect<A>
where
    A: Send + 'static,
{
    pub(crate) fn fiber_ref_with(
        fiber_ref: Arc<crate::fiber_ref::ErasedFiberRef>,
        f: impl FnOnce(AnyValue) -> A + Send + 'static,
    ) -> Self {
        Self::from_repr(Repr::FiberRefWith {
            fiber_ref,
            with: Box::new(move |value| Repr::succeed_now(f(value))),
        })
    }

    pub(crate) fn fiber_ref_modify(
        fiber_ref: Arc<crate::fiber_ref::ErasedFiberRef>,
        modify: impl FnOnce(AnyValue) -> (AnyValue, AnyValue) + Send + 'static,
    ) -> Self {
        Self::from_repr(Repr::FiberRefModify {
            fiber_ref,
            modify: Box::new(modify),
        })
    }
}

impl Effect<()> {
    /// The unit effect.
    pub fn unit() -> Self {
        Self::from_repr(Repr::unit())
    }

    /// Yields the worker back to the executor; the fiber continues on a
    /// later slice.
    pub fn yield_now() -> Self {
        Self::from_repr(Repr::Yield)
    }

    /// Emits a log entry through the runtime's loggers, tagged with the
    /// running fiber's identity.
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::log_with(level, move || message)
    }

    /// [`log`](Self::log) with lazy message rendering.
    pub fn log_with(level: LogLevel, message: impl FnOnce() -> String + Send + 'static) -> Self {
        Self::from_repr(Repr::Logged {
            level,
            message: Box::new(message),
        })
    }

    /// Replaces the running fiber's runtime configuration.
    pub fn set_config(config: RuntimeConfig) -> Self {
        Self::from_repr(Repr::SetConfig(config))
    }

    pub(crate) fn fiber_ref_delete(fiber_ref: Arc<crate::fiber_ref::ErasedFiberRef>) -> Self {
        Self::from_repr(Repr::FiberRefDelete(fiber_ref))
    }
}

impl Effect<Scope> {
    /// Succeeds with the scope new children are currently forked into.
    pub fn get_fork_scope() -> Self {
        Self::from_repr(Repr::GetForkScope(Box::new(|scope| {
            Repr::succeed_now(scope)
        })))
    }
}

impl Effect<FiberDescriptor> {
    /// Succeeds with a snapshot of the running fiber.
    pub fn descriptor() -> Self {
        Self::from_repr(Repr::Descriptor(Box::new(|descriptor| {
            Repr::succeed_now(descriptor)
        })))
    }
}

/// Settles a symmetric race: interrupt and await the loser, then adopt
/// the winner's exit.
fn settle_race<A, E>(exit: Exit<A, E>, loser: Fiber<A, E>) -> Effect<A, E>
where
    A: Clone + Send + 'static,
    E: Clone + Send + fmt::Debug + 'static,
{
    Effect::from_repr(Repr::Descriptor(Box::new(move |descriptor| {
        let shutdown = loser.context().interrupt_and_await_repr(descriptor.id);
        let settled = match exit {
            Exit::Success(value) => Repr::succeed_now(value),
            Exit::Failure(cause) => Repr::fail_cause_now(erase_cause(cause)),
        };
        shutdown.zip_right(settled)
    })))
}

/// One-shot resume handle for [`Effect::async_`]. Consumed on use; safe
/// to call from any thread. A resume arriving after the suspension was
/// already settled (for example by interruption) is ignored.
pub struct AsyncResume<A, E = Infallible> {
    inner: ResumeInner,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> fmt::Debug for AsyncResume<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResume")
    }
}

impl<A, E> AsyncResume<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Resumes the fiber with a value.
    pub fn succeed(self, value: A) {
        (self.inner)(Repr::succeed_now(value));
    }

    /// Resumes the fiber with a typed failure.
    pub fn fail(self, error: E)
    where
        E: fmt::Debug,
    {
        (self.inner)(Repr::Fail(Box::new(move || {
            Cause::Fail(ErasedError::new(error))
        })));
    }

    /// Resumes the fiber with an arbitrary effect.
    pub fn resume(self, effect: Effect<A, E>) {
        (self.inner)(effect.into_repr());
    }
}

/// What an async registration decided.
pub enum AsyncOutcome<A, E = Infallible> {
    /// Stay suspended; optionally run the given effect if the fiber is
    /// interrupted while suspended.
    Pending(Option<Effect<()>>),
    /// The result is already available.
    Ready(Effect<A, E>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn building_effects_runs_nothing() {
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let probe = std::sync::Arc::clone(&flag);
        let _effect: Effect<i32> = Effect::succeed_with(move || {
            probe.store(true, std::sync::atomic::Ordering::SeqCst);
            1
        });
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn combinators_keep_node_tags() {
        let effect: Effect<i32, &str> = Effect::succeed(1);
        assert_eq!(format!("{effect:?}"), "Effect(SucceedNow)");
        let bound = effect.map(|v| v + 1);
        assert_eq!(format!("{bound:?}"), "Effect(FlatMap)");
    }
}
