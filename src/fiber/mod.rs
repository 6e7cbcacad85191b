//! Fiber handles.
//!
//! A [`Fiber`] is the typed handle to a running fiber: observe its exit
//! (`await_`, `poll`, blocking `join`), interrupt it, queue effects into
//! its mailbox, or fold its fiber-local state back into the caller.
//! Handles are cheap to clone and never keep the fiber alive as a
//! computation; dropping every handle does not cancel anything.

pub(crate) mod context;
pub(crate) mod stack;
pub(crate) mod state;

use crate::cause::Cause;
use crate::effect::repr::{typed_exit, ExitCell, Repr};
use crate::effect::Effect;
use crate::error::JoinError;
use crate::exit::Exit;
use crate::types::{Defect, FiberId};
use context::FiberContext;
use core::fmt;
use core::marker::PhantomData;
use std::convert::Infallible;
use std::sync::Arc;

/// Point-in-time snapshot of a running fiber, from `Effect::descriptor`.
#[derive(Debug, Clone)]
pub struct FiberDescriptor {
    /// The fiber's identity.
    pub id: FiberId,
    /// Fibers that have requested interruption so far, in arrival order.
    pub interruptors: Vec<FiberId>,
    /// Whether the fiber is winding down due to interruption.
    pub interrupting: bool,
    /// Whether the fiber is currently interruptible.
    pub interruptible: bool,
}

/// Typed handle to a running fiber.
pub struct Fiber<A, E = Infallible> {
    context: Arc<FiberContext>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({:?})", self.context.id())
    }
}

/// Converts the erased await payload into a typed exit.
fn typed_await<A, E>(await_repr: Repr) -> Repr
where
    A: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    await_repr.flat_map(|payload| match payload.downcast::<ExitCell>() {
        Ok(cell) => Repr::succeed_now(typed_exit::<A, E>(&cell)),
        Err(_) => Repr::fail_cause_now(Cause::Die(Defect::new(
            "fiber await resumed with an unexpected payload",
        ))),
    })
}

impl<A, E> Fiber<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn from_context(context: Arc<FiberContext>) -> Self {
        Self {
            context,
            _marker: PhantomData,
        }
    }

    pub(crate) fn context(&self) -> &Arc<FiberContext> {
        &self.context
    }

    /// The fiber's identity.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.context.id()
    }

    /// Effect resolving with the fiber's exit once it terminates. Awaiting
    /// is idempotent: every awaiter observes the same exit, which is why
    /// the value and error are cloned out.
    #[must_use]
    pub fn await_(&self) -> Effect<Exit<A, E>>
    where
        A: Clone,
        E: Clone,
    {
        Effect::from_repr(typed_await::<A, E>(self.context.await_repr()))
    }

    /// The fiber's exit if it has already terminated.
    #[must_use]
    pub fn poll(&self) -> Option<Exit<A, E>>
    where
        A: Clone,
        E: Clone,
    {
        self.context.poll_exit().map(|cell| typed_exit(&cell))
    }

    /// Blocks the calling thread until the fiber terminates. Requires an
    /// executor that makes progress on other threads.
    pub fn join(&self) -> Result<Exit<A, E>, JoinError>
    where
        A: Clone,
        E: Clone,
    {
        if let Some(cell) = self.context.poll_exit() {
            return Ok(typed_exit(&cell));
        }
        let (tx, rx) = std::sync::mpsc::channel();
        let key = self.context.observe(
            true,
            Box::new(move |cell| {
                let _ = tx.send(cell);
            }),
        );
        match rx.recv() {
            Ok(cell) => Ok(typed_exit(&cell)),
            Err(_) => {
                if let Some(key) = key {
                    self.context.remove_observer(key);
                }
                Err(JoinError::Lost)
            }
        }
    }

    /// Effect that requests interruption attributed to `interruptor` and
    /// resolves with the fiber's exit once it has fully terminated
    /// (finalizers included).
    #[must_use]
    pub fn interrupt_as(&self, interruptor: FiberId) -> Effect<Exit<A, E>>
    where
        A: Clone,
        E: Clone,
    {
        let context = Arc::clone(&self.context);
        let repr = Repr::Suspend(Box::new(move || {
            context.interrupt_now(interruptor);
            context.await_repr()
        }));
        Effect::from_repr(typed_await::<A, E>(repr))
    }

    /// Fire-and-forget interruption request attributed to `interruptor`.
    pub fn interrupt_now(&self, interruptor: FiberId) {
        self.context.interrupt_now(interruptor);
    }

    /// Identities of the fiber's live children.
    #[must_use]
    pub fn children(&self) -> Vec<FiberId> {
        self.context.children_ids()
    }

    /// Effect folding the fiber's final fiber-local values into the
    /// running fiber, per each ref's join policy. A no-op until the fiber
    /// terminates, and after the first inheritance.
    #[must_use]
    pub fn inherit_refs(&self) -> Effect<()> {
        Effect::from_repr(Repr::InheritRefs(Arc::clone(&self.context)))
    }

    /// Queues `effect` to run on this fiber before its own next step
    /// (FIFO with other queued effects). Returns false if the fiber has
    /// already terminated, in which case the effect never runs.
    pub fn eval_on(&self, effect: Effect<()>) -> bool {
        self.context.eval_on(effect.into_repr())
    }
}
