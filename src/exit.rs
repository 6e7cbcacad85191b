//! The terminal outcome of a fiber.

use crate::cause::Cause;
use crate::types::{Defect, FiberId};
use core::fmt;

/// The terminal outcome of a fiber: success with a value, or failure with
/// a [`Cause`]. Immutable once produced; every observer of a fiber sees
/// the same exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit<A, E> {
    /// The fiber completed with a value.
    Success(A),
    /// The fiber terminated with a cause.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// Creates a successful exit.
    #[must_use]
    pub const fn succeed(value: A) -> Self {
        Self::Success(value)
    }

    /// Creates a failed exit from a typed error.
    #[must_use]
    pub const fn fail(error: E) -> Self {
        Self::Failure(Cause::Fail(error))
    }

    /// Creates a failed exit from a cause.
    #[must_use]
    pub const fn fail_cause(cause: Cause<E>) -> Self {
        Self::Failure(cause)
    }

    /// Creates an exit terminated by a defect.
    #[must_use]
    pub const fn die(defect: Defect) -> Self {
        Self::Failure(Cause::Die(defect))
    }

    /// Creates an exit terminated by interruption attributed to `id`.
    #[must_use]
    pub const fn interrupt(id: FiberId) -> Self {
        Self::Failure(Cause::Interrupt(id))
    }

    /// Returns true if the exit is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns true if the exit is a failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns true if the exit's cause contains an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Success(_) => false,
            Self::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// Returns the success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Self::Success(v) => Some(v),
            Self::Failure(_) => None,
        }
    }

    /// Returns the failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(c) => Some(c),
        }
    }

    /// Maps the success value.
    pub fn map<B, F: FnOnce(A) -> B>(self, f: F) -> Exit<B, E> {
        match self {
            Self::Success(v) => Exit::Success(f(v)),
            Self::Failure(c) => Exit::Failure(c),
        }
    }

    /// Maps every typed error in the cause.
    pub fn map_error<E2>(self, f: &impl Fn(E) -> E2) -> Exit<A, E2> {
        match self {
            Self::Success(v) => Exit::Success(v),
            Self::Failure(c) => Exit::Failure(c.map(f)),
        }
    }

    /// Maps the failure cause.
    pub fn map_error_cause<E2>(self, f: impl FnOnce(Cause<E>) -> Cause<E2>) -> Exit<A, E2> {
        match self {
            Self::Success(v) => Exit::Success(v),
            Self::Failure(c) => Exit::Failure(f(c)),
        }
    }

    /// Folds both sides of the exit into one value.
    pub fn fold<B>(self, failure: impl FnOnce(Cause<E>) -> B, success: impl FnOnce(A) -> B) -> B {
        match self {
            Self::Success(v) => success(v),
            Self::Failure(c) => failure(c),
        }
    }

    /// Converts into a `Result`, collapsing the cause into its first typed
    /// failure where one exists.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Self::Success(v) => Ok(v),
            Self::Failure(c) => Err(c),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(v) => Self::Success(v),
            Err(e) => Self::fail(e),
        }
    }
}

impl<A: fmt::Display, E: fmt::Display> fmt::Display for Exit<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(v) => write!(f, "success: {v}"),
            Self::Failure(c) => write!(f, "failure: {c}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_touches_only_success() {
        let ok: Exit<i32, &str> = Exit::succeed(1);
        assert_eq!(ok.map(|v| v + 1), Exit::succeed(2));

        let err: Exit<i32, &str> = Exit::fail("e");
        assert_eq!(err.map(|v| v + 1), Exit::fail("e"));
    }

    #[test]
    fn from_result_round_trip() {
        let exit: Exit<i32, &str> = Ok::<_, &str>(3).into();
        assert_eq!(exit, Exit::succeed(3));
        let exit: Exit<i32, &str> = Err::<i32, _>("bad").into();
        assert!(exit.is_failure());
    }

    #[test]
    fn interruption_is_visible() {
        let exit: Exit<(), ()> = Exit::interrupt(FiberId::new_for_test(9));
        assert!(exit.is_interrupted());
        assert!(exit.cause().is_some());
    }
}
