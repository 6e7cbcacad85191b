//! The shared per-fiber state cell.
//!
//! [`FiberState`] is the only state visible to other fibers: whether the
//! fiber is executing (and how: running or suspended, interrupting or
//! not), who asked to interrupt it, the pending async canceler, queued
//! mailbox effects, and the completion observers. It lives behind a mutex
//! on the [`FiberContext`](super::context::FiberContext) with short
//! critical sections; the transition to `Done` is one-way.

use crate::effect::repr::{DynCause, ExitCell, Repr};
use crate::types::FiberId;
use smallvec::SmallVec;

/// Completion callback; receives the fiber's shared exit exactly once.
pub(crate) type Observer = Box<dyn FnOnce(ExitCell) + Send>;

/// The fate of the cancellation effect of an async suspension.
pub(crate) enum CancelerState {
    /// No suspension in flight.
    Empty,
    /// Suspended, registration still running or provided no canceler.
    Pending,
    /// Suspended with a cancellation effect to run on interrupt.
    Registered(Repr),
}

/// What the fiber's interpreter loop is doing.
pub(crate) enum FiberStatus {
    /// A worker owns the loop (or a slice is queued to run it).
    Running {
        /// The fiber is winding down due to interruption.
        interrupting: bool,
    },
    /// Parked waiting for an async resume.
    Suspended {
        /// The fiber is winding down due to interruption.
        interrupting: bool,
        /// Whether an interrupt may cut the suspension short.
        interruptible: bool,
        /// Guard for resume callbacks; a resume whose captured epoch no
        /// longer matches is stale and ignored.
        epoch: u64,
        /// Fibers this suspension is known to wait on, for diagnostics.
        blocking_on: SmallVec<[FiberId; 2]>,
    },
}

impl FiberStatus {
    pub(crate) const fn is_interrupting(&self) -> bool {
        match self {
            Self::Running { interrupting } | Self::Suspended { interrupting, .. } => *interrupting,
        }
    }

    pub(crate) fn set_interrupting(&mut self, value: bool) {
        match self {
            Self::Running { interrupting } | Self::Suspended { interrupting, .. } => {
                *interrupting = value;
            }
        }
    }
}

/// State while the fiber has not yet completed.
pub(crate) struct Executing {
    pub(crate) status: FiberStatus,
    /// Keyed so a blocking joiner can deregister on timeout/poison paths.
    pub(crate) observers: Vec<(u64, Observer)>,
    /// Causes accumulated while winding down (finalizer failures, child
    /// interruption results), merged into the final exit.
    pub(crate) suppressed: DynCause,
    /// Fibers that requested interruption, in arrival order.
    pub(crate) interruptors: SmallVec<[FiberId; 2]>,
    pub(crate) canceler: CancelerState,
    /// Effects other fibers asked this one to run, FIFO via `zip_right`
    /// chaining.
    pub(crate) mailbox: Option<Repr>,
    /// Live children forked into this fiber's scope; interrupted and
    /// awaited before the fiber completes.
    pub(crate) children: Vec<std::sync::Arc<super::context::FiberContext>>,
}

impl Executing {
    pub(crate) fn new() -> Self {
        Self {
            status: FiberStatus::Running {
                interrupting: false,
            },
            observers: Vec::new(),
            suppressed: DynCause::Empty,
            interruptors: SmallVec::new(),
            canceler: CancelerState::Empty,
            mailbox: None,
            children: Vec::new(),
        }
    }

    /// Records an interruption request; first request wins attribution
    /// order, duplicates are dropped.
    pub(crate) fn add_interruptor(&mut self, id: FiberId) {
        if !self.interruptors.contains(&id) {
            self.interruptors.push(id);
        }
    }

    /// Appends an effect to the mailbox, preserving FIFO order.
    pub(crate) fn enqueue_mailbox(&mut self, effect: Repr) {
        self.mailbox = Some(match self.mailbox.take() {
            Some(pending) => pending.zip_right(effect),
            None => effect,
        });
    }
}

/// The fiber's lifecycle: executing, then done. One-way.
pub(crate) enum FiberState {
    Executing(Executing),
    Done(ExitCell),
}

impl FiberState {
    pub(crate) fn new() -> Self {
        Self::Executing(Executing::new())
    }

    pub(crate) fn executing_mut(&mut self) -> Option<&mut Executing> {
        match self {
            Self::Executing(executing) => Some(executing),
            Self::Done(_) => None,
        }
    }

    pub(crate) fn done_exit(&self) -> Option<ExitCell> {
        match self {
            Self::Executing(_) => None,
            Self::Done(exit) => Some(exit.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruptors_deduplicate() {
        let mut executing = Executing::new();
        let a = FiberId::new_for_test(1);
        let b = FiberId::new_for_test(2);
        executing.add_interruptor(a);
        executing.add_interruptor(b);
        executing.add_interruptor(a);
        assert_eq!(executing.interruptors.as_slice(), &[a, b]);
    }

    #[test]
    fn status_interrupting_flag_round_trips() {
        let mut status = FiberStatus::Running {
            interrupting: false,
        };
        assert!(!status.is_interrupting());
        status.set_interrupting(true);
        assert!(status.is_interrupting());
    }
}
