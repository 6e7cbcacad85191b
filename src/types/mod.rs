//! Identifier and payload types for runtime entities.
//!
//! These types provide type-safe identifiers for fibers and the defect
//! payload carried by unrecoverable failures.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static FIBER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a fiber.
///
/// Fiber ids are process-unique and monotonically allocated. Interruption
/// causes carry the id of the fiber that requested the interruption.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// The reserved id attributed to runtime-internal actions (for example
    /// interrupting a child whose scope was already closed).
    pub const RUNTIME: Self = Self(0);

    /// Allocates a fresh fiber id.
    #[must_use]
    pub fn fresh() -> Self {
        Self(FIBER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value of this id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Creates a fiber id with a fixed value for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Payload of an unrecoverable defect.
///
/// Defects are produced by caught panics, by explicit [`die`] calls, and by
/// stripping typed failures whose handlers were discarded during
/// interruption. The payload carries a rendered message only, so it can be
/// cloned and transported across fiber boundaries safely.
///
/// [`die`]: crate::effect::Effect::die
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defect {
    message: String,
}

impl Defect {
    /// Creates a new defect with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Creates a defect from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        Self { message }
    }

    /// Returns the defect message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "defect: {}", self.message)
    }
}

impl std::error::Error for Defect {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_ids_are_unique() {
        let a = FiberId::fresh();
        let b = FiberId::fresh();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn runtime_id_is_reserved() {
        assert_eq!(FiberId::RUNTIME.as_u64(), 0);
        assert_ne!(FiberId::fresh(), FiberId::RUNTIME);
    }

    #[test]
    fn defect_from_panic_payloads() {
        let s: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(Defect::from_panic(s.as_ref()).message(), "boom");

        let owned: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
        assert_eq!(Defect::from_panic(owned.as_ref()).message(), "owned");

        let opaque: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(
            Defect::from_panic(opaque.as_ref()).message(),
            "panic with non-string payload"
        );
    }
}
