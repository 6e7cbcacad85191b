//! The explicit continuation stack.
//!
//! Frames stand in for the native call stack: fold handlers, pending
//! finalizers, and interruptibility-restore markers. Only the fiber's own
//! interpreter pushes and pops, so no synchronization is involved; each
//! frame is popped exactly once, either by normal continuation or by the
//! failure unwind.

use crate::effect::repr::{Cont, DynCause, ErrCont, Repr};
use smallvec::SmallVec;

/// One pending frame.
pub(crate) enum Frame {
    /// Plain continuation from a bind.
    Apply(Cont),
    /// Error boundary from a fold; the nearest one catches an unwind.
    Fold { failure: ErrCont, success: Cont },
    /// Finalizer from `ensuring`, not yet started.
    Finalizer(Repr),
    /// A finalizer is running during an unwind; when it completes, its
    /// own outcome is merged into `cause` and the unwind continues.
    FinalizerDone { cause: DynCause },
    /// Marker restoring the previous interruptibility on the way out.
    InterruptRestore,
}

impl Frame {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Self::Apply(_) => "Apply",
            Self::Fold { .. } => "Fold",
            Self::Finalizer(_) => "Finalizer",
            Self::FinalizerDone { .. } => "FinalizerDone",
            Self::InterruptRestore => "InterruptRestore",
        }
    }
}

/// LIFO stack of frames, inline for shallow programs.
#[derive(Default)]
pub(crate) struct ContStack {
    frames: SmallVec<[Frame; 8]>,
}

impl ContStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }
}

impl core::fmt::Debug for ContStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let tags: Vec<&'static str> = self.frames.iter().map(Frame::tag).collect();
        write!(f, "ContStack{tags:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_pop_in_reverse_order() {
        let mut stack = ContStack::new();
        stack.push(Frame::InterruptRestore);
        stack.push(Frame::Finalizer(Repr::unit()));
        assert!(matches!(stack.pop(), Some(Frame::Finalizer(_))));
        assert!(matches!(stack.pop(), Some(Frame::InterruptRestore)));
        assert!(stack.pop().is_none());
    }
}
