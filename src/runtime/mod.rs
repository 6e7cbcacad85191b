//! Runtime configuration and the entry point for executing effects.
//!
//! A [`Runtime`] is little more than a [`RuntimeConfig`]: the executor to
//! run fiber slices on, the operation budget per slice, the root
//! supervisor, the loggers, and the fatal-defect policy. The config is
//! explicit state threaded through every fiber (no process-wide global);
//! a fiber can swap its own config mid-flight with `Effect::set_config`.

pub mod executor;

use crate::effect::Effect;
use crate::fiber::context::FiberContext;
use crate::fiber::Fiber;
use crate::fiber_ref::FiberRef;
use crate::log::{LogEntry, Logger, TracingLogger};
use crate::scope::Scope;
use crate::supervisor::{NoopSupervisor, Supervisor};
use crate::types::Defect;
use core::fmt;
use executor::Executor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type FatalFn = Arc<dyn Fn(&Defect) -> bool + Send + Sync>;
type ReportFatalFn = Arc<dyn Fn(&Defect) + Send + Sync>;

/// Per-fiber runtime configuration.
///
/// Cloning is cheap; clones share the executor, loggers, the catastrophic
/// flag, and the fork-scope override ref. Forked fibers inherit the
/// parent's config.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) budget: u32,
    pub(crate) supervisor: Arc<dyn Supervisor>,
    pub(crate) loggers: Arc<Vec<Arc<dyn Logger>>>,
    pub(crate) fatal: FatalFn,
    pub(crate) report_fatal: ReportFatalFn,
    pub(crate) catastrophic: Arc<AtomicBool>,
    pub(crate) fork_scope_override: FiberRef<Option<Scope>>,
}

impl RuntimeConfig {
    /// Config with defaults: a 2048-operation budget, no supervisor, a
    /// single [`TracingLogger`], and no defect considered fatal.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            budget: 2048,
            supervisor: Arc::new(NoopSupervisor),
            loggers: Arc::new(vec![Arc::new(TracingLogger)]),
            fatal: Arc::new(|_| false),
            report_fatal: Arc::new(|defect| {
                tracing::error!("fatal defect: {defect}");
            }),
            catastrophic: Arc::new(AtomicBool::new(false)),
            fork_scope_override: FiberRef::new(None),
        }
    }

    /// Sets how many operations a fiber executes before yielding its
    /// worker. Clamped to at least 1.
    #[must_use]
    pub fn with_budget(mut self, budget: u32) -> Self {
        self.budget = budget.max(1);
        self
    }

    /// Sets the root supervisor every fiber reports to.
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Replaces the logger set.
    #[must_use]
    pub fn with_loggers(mut self, loggers: Vec<Arc<dyn Logger>>) -> Self {
        self.loggers = Arc::new(loggers);
        self
    }

    /// Adds a logger to the current set.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        let mut loggers = self.loggers.as_ref().clone();
        loggers.push(logger);
        self.loggers = Arc::new(loggers);
        self
    }

    /// Sets the predicate deciding which defects are fatal. A fatal defect
    /// bypasses fiber-local handling, marks the runtime catastrophic, and
    /// invokes the report hook.
    #[must_use]
    pub fn with_fatal(mut self, fatal: impl Fn(&Defect) -> bool + Send + Sync + 'static) -> Self {
        self.fatal = Arc::new(fatal);
        self
    }

    /// Sets the hook invoked with a fatal defect before the runtime halts.
    #[must_use]
    pub fn with_report_fatal(mut self, report: impl Fn(&Defect) + Send + Sync + 'static) -> Self {
        self.report_fatal = Arc::new(report);
        self
    }

    /// Whether a fatal defect has been observed. Once set, fibers halt at
    /// their next slice instead of continuing.
    #[must_use]
    pub fn is_catastrophic(&self) -> bool {
        self.catastrophic.load(Ordering::Acquire)
    }

    pub(crate) fn mark_catastrophic(&self) {
        self.catastrophic.store(true, Ordering::Release);
    }

    pub(crate) fn log(&self, entry: &LogEntry) {
        for logger in self.loggers.iter() {
            logger.log(entry);
        }
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("budget", &self.budget)
            .field("loggers", &self.loggers.len())
            .field("catastrophic", &self.is_catastrophic())
            .finish_non_exhaustive()
    }
}

/// Executes effects on fibers.
#[derive(Debug, Clone)]
pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    /// Runtime over an explicit configuration.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Runtime with default configuration over the given executor.
    #[must_use]
    pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
        Self::new(RuntimeConfig::new(executor))
    }

    /// The runtime's configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Starts `effect` on a fresh root fiber and returns its handle. The
    /// fiber's first slice is submitted to the executor immediately.
    pub fn run<A, E>(&self, effect: Effect<A, E>) -> Fiber<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let context = FiberContext::spawn_root(self.config.clone(), effect.into_repr());
        Fiber::from_context(context)
    }
}
