//! Fibra: effects as data, executed on cooperatively scheduled fibers.
//!
//! # Overview
//!
//! Fibra represents computations as immutable effect descriptions and runs
//! them on lightweight fibers with a trampolined interpreter. Concurrency
//! is structured: fibers fork into scopes, interruption is a protocol with
//! exactly-once resume semantics, and finalizers run on every termination
//! path.
//!
//! # Core Guarantees
//!
//! - **Exits are final**: a fiber transitions to Done once; every observer
//!   sees the same exit, and awaiting is idempotent
//! - **Resume exactly once**: async suspensions are epoch-guarded; stale
//!   or duplicate resumes are ignored
//! - **No orphan children**: a fiber interrupts and awaits its children
//!   before completing
//! - **Finalizers always run**: reverse registration order, interruption
//!   disabled, under success, failure, and interruption alike
//! - **Failures are algebraic**: typed errors, defects, and interruption
//!   compose in a [`Cause`] instead of being collapsed
//!
//! # Module Structure
//!
//! - [`types`]: Identifier and defect payload types
//! - [`cause`]: The failure algebra
//! - [`exit`]: Terminal fiber outcomes
//! - [`effect`]: The typed effect builder API
//! - [`fiber`]: Fiber handles and the interpreter
//! - [`fiber_ref`]: Fiber-local variables
//! - [`scope`]: Child-fiber and finalizer ownership
//! - [`supervisor`]: Lifecycle observation hooks
//! - [`runtime`]: Configuration, executors, and the entry point
//! - [`log`]: Structured logging seam
//! - [`error`]: API-level error types
//!
//! # Example
//!
//! ```
//! use fibra::{Effect, Runtime, ThreadPoolExecutor};
//! use std::sync::Arc;
//!
//! let runtime = Runtime::with_executor(Arc::new(ThreadPoolExecutor::new(2)));
//! let effect: fibra::Effect<i32> = fibra::Effect::succeed(20).map(|n| n * 2 + 2);
//! let fiber = runtime.run(effect);
//! let exit = fiber.join().unwrap();
//! assert_eq!(exit.value(), Some(&42));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod cause;
pub mod effect;
pub mod error;
pub mod exit;
pub mod fiber;
pub mod fiber_ref;
pub mod log;
pub mod runtime;
pub mod scope;
pub mod supervisor;
pub mod types;

pub use cause::Cause;
pub use effect::{AsyncOutcome, AsyncResume, Effect};
pub use error::JoinError;
pub use exit::Exit;
pub use fiber::{Fiber, FiberDescriptor};
pub use fiber_ref::{FiberRef, ForkBehavior};
pub use log::{CollectingLogger, LogEntry, LogLevel, Logger, TracingLogger};
pub use runtime::executor::{Executor, Job, TestExecutor, ThreadPoolExecutor};
pub use runtime::{Runtime, RuntimeConfig};
pub use scope::Scope;
pub use supervisor::{NoopSupervisor, RecordingSupervisor, Supervisor, SupervisorEvent};
pub use types::{Defect, FiberId};
