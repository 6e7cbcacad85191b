//! Supervision hooks invoked at well-defined points of the interpreter loop.
//!
//! A [`Supervisor`] observes fiber lifecycle events: fork, completion,
//! per-operation execution, suspension and resumption. The default
//! supervisor is a no-op; `Effect::supervised` composes an additional
//! supervisor for the extent of an effect.

use crate::types::FiberId;
use parking_lot::Mutex;
use std::sync::Arc;

/// Observer of fiber lifecycle events.
///
/// All hooks have empty default implementations, so a supervisor only
/// implements the events it cares about. Hooks run inline on the worker
/// executing the fiber and must not block.
pub trait Supervisor: Send + Sync + 'static {
    /// A fiber was forked. `parent` is `None` for root fibers.
    fn on_start(&self, parent: Option<FiberId>, fiber: FiberId) {
        let _ = (parent, fiber);
    }

    /// A fiber transitioned to its terminal state.
    fn on_end(&self, fiber: FiberId, success: bool, interrupted: bool) {
        let _ = (fiber, success, interrupted);
    }

    /// The interpreter is about to execute one operation of the fiber.
    fn on_effect(&self, fiber: FiberId, op: &'static str) {
        let _ = (fiber, op);
    }

    /// The fiber's loop is leaving a worker (suspension, yield, or end).
    fn on_suspend(&self, fiber: FiberId) {
        let _ = fiber;
    }

    /// The fiber's loop was handed to a worker.
    fn on_resume(&self, fiber: FiberId) {
        let _ = fiber;
    }
}

/// The zero-overhead default supervisor.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSupervisor;

impl Supervisor for NoopSupervisor {}

/// Composes two supervisors; both receive every event, `first` first.
#[must_use]
pub fn and(first: Arc<dyn Supervisor>, second: Arc<dyn Supervisor>) -> Arc<dyn Supervisor> {
    Arc::new(AndSupervisor { first, second })
}

struct AndSupervisor {
    first: Arc<dyn Supervisor>,
    second: Arc<dyn Supervisor>,
}

impl Supervisor for AndSupervisor {
    fn on_start(&self, parent: Option<FiberId>, fiber: FiberId) {
        self.first.on_start(parent, fiber);
        self.second.on_start(parent, fiber);
    }

    fn on_end(&self, fiber: FiberId, success: bool, interrupted: bool) {
        self.first.on_end(fiber, success, interrupted);
        self.second.on_end(fiber, success, interrupted);
    }

    fn on_effect(&self, fiber: FiberId, op: &'static str) {
        self.first.on_effect(fiber, op);
        self.second.on_effect(fiber, op);
    }

    fn on_suspend(&self, fiber: FiberId) {
        self.first.on_suspend(fiber);
        self.second.on_suspend(fiber);
    }

    fn on_resume(&self, fiber: FiberId) {
        self.first.on_resume(fiber);
        self.second.on_resume(fiber);
    }
}

/// A supervision event captured by [`RecordingSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A fiber started.
    Start {
        /// Forking fiber, if any.
        parent: Option<FiberId>,
        /// The new fiber.
        fiber: FiberId,
    },
    /// A fiber ended.
    End {
        /// The finished fiber.
        fiber: FiberId,
        /// Whether the exit was a success.
        success: bool,
        /// Whether the exit cause contains an interruption.
        interrupted: bool,
    },
    /// A fiber's loop suspended.
    Suspend(FiberId),
    /// A fiber's loop resumed.
    Resume(FiberId),
}

/// Supervisor that records lifecycle events in memory, for tests.
///
/// Per-operation events are counted rather than stored, since a single
/// fiber can execute millions of operations.
#[derive(Debug, Default)]
pub struct RecordingSupervisor {
    events: Mutex<Vec<SupervisorEvent>>,
    ops: Mutex<u64>,
}

impl RecordingSupervisor {
    /// Creates an empty recording supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded lifecycle events.
    #[must_use]
    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.events.lock().clone()
    }

    /// Returns the number of operations observed.
    #[must_use]
    pub fn op_count(&self) -> u64 {
        *self.ops.lock()
    }
}

impl Supervisor for RecordingSupervisor {
    fn on_start(&self, parent: Option<FiberId>, fiber: FiberId) {
        self.events
            .lock()
            .push(SupervisorEvent::Start { parent, fiber });
    }

    fn on_end(&self, fiber: FiberId, success: bool, interrupted: bool) {
        self.events.lock().push(SupervisorEvent::End {
            fiber,
            success,
            interrupted,
        });
    }

    fn on_effect(&self, _fiber: FiberId, _op: &'static str) {
        *self.ops.lock() += 1;
    }

    fn on_suspend(&self, fiber: FiberId) {
        self.events.lock().push(SupervisorEvent::Suspend(fiber));
    }

    fn on_resume(&self, fiber: FiberId) {
        self.events.lock().push(SupervisorEvent::Resume(fiber));
    }
}
