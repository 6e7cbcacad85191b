//! Composable description of why a fiber did not succeed.
//!
//! A [`Cause`] is an algebraic failure value: a typed error (`Fail`), an
//! unrecoverable defect (`Die`), an interruption marker (`Interrupt`,
//! tagged with the interrupting fiber's identity), and sequential (`Then`)
//! or parallel (`Both`) composition of these, with `Empty` as the identity
//! of both compositions.
//!
//! # Algebra
//!
//! - `Then` and `Both` are associative.
//! - `Empty` is the identity for both: `then(Empty, c) == c`,
//!   `both(c, Empty) == c`.
//! - [`Cause::strip_failures`] replaces every `Fail` node with a `Die`
//!   while preserving `Interrupt` nodes. It is applied when error handlers
//!   were discarded during interruption: a typed error is no longer sound
//!   to report once the fold that knew its type was skipped.

use crate::types::{Defect, FiberId};
use core::fmt;

/// An algebraic failure value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// No failure. Identity of `Then` and `Both`.
    Empty,
    /// A typed, expected error.
    Fail(E),
    /// An unexpected, unrecoverable defect.
    Die(Defect),
    /// Interruption, attributed to the requesting fiber.
    Interrupt(FiberId),
    /// Sequential composition: the left cause happened, then the right.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Parallel composition: both causes happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// Creates a typed failure cause.
    #[must_use]
    pub const fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// Creates a defect cause.
    #[must_use]
    pub const fn die(defect: Defect) -> Self {
        Self::Die(defect)
    }

    /// Creates an interruption cause attributed to `id`.
    #[must_use]
    pub const fn interrupt(id: FiberId) -> Self {
        Self::Interrupt(id)
    }

    /// Sequentially composes two causes, collapsing the `Empty` identity.
    #[must_use]
    pub fn then(first: Self, second: Self) -> Self {
        match (first, second) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (a, b) => Self::Then(Box::new(a), Box::new(b)),
        }
    }

    /// Composes two causes in parallel, collapsing the `Empty` identity.
    #[must_use]
    pub fn both(left: Self, right: Self) -> Self {
        match (left, right) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (a, b) => Self::Both(Box::new(a), Box::new(b)),
        }
    }

    /// Returns true if this cause is `Empty`.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns true if any node of this cause is an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupt(_) => true,
            Self::Then(a, b) | Self::Both(a, b) => a.is_interrupted() || b.is_interrupted(),
            _ => false,
        }
    }

    /// Returns true if this cause consists only of interruptions (and is
    /// non-empty).
    #[must_use]
    pub fn is_interrupted_only(&self) -> bool {
        fn only<E>(cause: &Cause<E>) -> bool {
            match cause {
                Cause::Empty | Cause::Interrupt(_) => true,
                Cause::Then(a, b) | Cause::Both(a, b) => only(a) && only(b),
                _ => false,
            }
        }
        self.is_interrupted() && only(self)
    }

    /// Returns the ids of all fibers that contributed interruptions.
    #[must_use]
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut ids = Vec::new();
        self.collect_interruptors(&mut ids);
        ids
    }

    fn collect_interruptors(&self, ids: &mut Vec<FiberId>) {
        match self {
            Self::Interrupt(id) => {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
            Self::Then(a, b) | Self::Both(a, b) => {
                a.collect_interruptors(ids);
                b.collect_interruptors(ids);
            }
            _ => {}
        }
    }

    /// Returns true if an `Interrupt(id)` node is present.
    #[must_use]
    pub fn contains_interruptor(&self, id: FiberId) -> bool {
        match self {
            Self::Interrupt(i) => *i == id,
            Self::Then(a, b) | Self::Both(a, b) => {
                a.contains_interruptor(id) || b.contains_interruptor(id)
            }
            _ => false,
        }
    }

    /// Returns references to all typed failures, left to right.
    #[must_use]
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.collect_failures(&mut out);
        out
    }

    fn collect_failures<'a>(&'a self, out: &mut Vec<&'a E>) {
        match self {
            Self::Fail(e) => out.push(e),
            Self::Then(a, b) | Self::Both(a, b) => {
                a.collect_failures(out);
                b.collect_failures(out);
            }
            _ => {}
        }
    }

    /// Returns clones of all defects, left to right.
    #[must_use]
    pub fn defects(&self) -> Vec<Defect> {
        let mut out = Vec::new();
        self.collect_defects(&mut out);
        out
    }

    fn collect_defects(&self, out: &mut Vec<Defect>) {
        match self {
            Self::Die(d) => out.push(d.clone()),
            Self::Then(a, b) | Self::Both(a, b) => {
                a.collect_defects(out);
                b.collect_defects(out);
            }
            _ => {}
        }
    }

    /// Maps every typed failure with `f`, preserving the cause structure.
    #[must_use]
    pub fn map<E2>(self, f: &impl Fn(E) -> E2) -> Cause<E2> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(e) => Cause::Fail(f(e)),
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            Self::Then(a, b) => Cause::Then(Box::new(a.map(f)), Box::new(b.map(f))),
            Self::Both(a, b) => Cause::Both(Box::new(a.map(f)), Box::new(b.map(f))),
        }
    }

    /// Extracts the first typed failure, or returns the remaining cause.
    ///
    /// Used by typed fold combinators: a typed handler only fires when a
    /// `Fail` node is present; defects and interruptions propagate.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        match self {
            Self::Fail(e) => Ok(e),
            Self::Then(a, b) => match a.failure_or_cause() {
                Ok(e) => Ok(e),
                Err(a2) => match b.failure_or_cause() {
                    Ok(e) => Ok(e),
                    Err(b2) => Err(Cause::Then(Box::new(a2), Box::new(b2))),
                },
            },
            Self::Both(a, b) => match a.failure_or_cause() {
                Ok(e) => Ok(e),
                Err(a2) => match b.failure_or_cause() {
                    Ok(e) => Ok(e),
                    Err(b2) => Err(Cause::Both(Box::new(a2), Box::new(b2))),
                },
            },
            other => Err(other),
        }
    }

    /// Replaces every `Fail` node with a `Die`, rendering the error through
    /// `render`. `Interrupt` nodes are preserved.
    #[must_use]
    pub fn strip_failures_with(self, render: &impl Fn(E) -> Defect) -> Cause<E> {
        match self {
            Self::Fail(e) => Cause::Die(render(e)),
            Self::Then(a, b) => Cause::Then(
                Box::new(a.strip_failures_with(render)),
                Box::new(b.strip_failures_with(render)),
            ),
            Self::Both(a, b) => Cause::Both(
                Box::new(a.strip_failures_with(render)),
                Box::new(b.strip_failures_with(render)),
            ),
            other => other,
        }
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Replaces every `Fail` node with a `Die` carrying the error's debug
    /// rendering. `Interrupt` nodes are preserved.
    #[must_use]
    pub fn strip_failures(self) -> Self {
        self.strip_failures_with(&|e| Defect::new(format!("{e:?}")))
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "<empty>"),
            Self::Fail(e) => write!(f, "fail: {e}"),
            Self::Die(d) => write!(f, "{d}"),
            Self::Interrupt(id) => write!(f, "interrupted by {id}"),
            Self::Then(a, b) => write!(f, "({a}) then ({b})"),
            Self::Both(a, b) => write!(f, "({a}) both ({b})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(n: u64) -> FiberId {
        FiberId::new_for_test(n)
    }

    #[test]
    fn empty_is_identity_for_then_and_both() {
        let c: Cause<&str> = Cause::fail("e");
        assert_eq!(Cause::then(Cause::Empty, c.clone()), c);
        assert_eq!(Cause::then(c.clone(), Cause::Empty), c);
        assert_eq!(Cause::both(Cause::Empty, c.clone()), c);
        assert_eq!(Cause::both(c.clone(), Cause::Empty), c);
    }

    #[test]
    fn strip_failures_preserves_interrupts() {
        let cause = Cause::then(Cause::fail("x"), Cause::interrupt(fid(7)));
        let stripped = cause.strip_failures();
        assert!(stripped.failures().is_empty());
        assert!(stripped.contains_interruptor(fid(7)));
        assert_eq!(stripped.defects(), vec![Defect::new("\"x\"")]);
    }

    #[test]
    fn interruptors_deduplicates() {
        let cause: Cause<()> = Cause::both(
            Cause::interrupt(fid(1)),
            Cause::then(Cause::interrupt(fid(1)), Cause::interrupt(fid(2))),
        );
        assert_eq!(cause.interruptors(), vec![fid(1), fid(2)]);
    }

    #[test]
    fn interrupted_only_excludes_failures() {
        let pure: Cause<&str> = Cause::then(Cause::interrupt(fid(1)), Cause::interrupt(fid(2)));
        assert!(pure.is_interrupted_only());

        let mixed = Cause::then(Cause::fail("e"), Cause::interrupt(fid(1)));
        assert!(mixed.is_interrupted());
        assert!(!mixed.is_interrupted_only());

        let none: Cause<&str> = Cause::Empty;
        assert!(!none.is_interrupted_only());
    }

    #[test]
    fn failure_or_cause_prefers_first_failure() {
        let cause = Cause::then(Cause::fail("first"), Cause::fail("second"));
        assert_eq!(cause.failure_or_cause(), Ok("first"));

        let no_fail: Cause<&str> = Cause::then(Cause::die(Defect::new("d")), Cause::interrupt(fid(3)));
        let residual = no_fail.clone().failure_or_cause().unwrap_err();
        assert_eq!(residual, no_fail);
    }
}
