//! Fiber scopes: ownership of child fibers and finalizers.
//!
//! Every fiber forks its children into a scope. The default is the forking
//! fiber's own scope, so children cannot outlive their parent; the global
//! scope detaches a child as a daemon; a local scope groups fibers and
//! finalizers under an explicit lifetime closed by `close`.
//!
//! Closing is multi-phase and the ordering is invariant: stop admitting,
//! interrupt and await children, run finalizers in reverse registration
//! order, become inert.

use crate::effect::repr::Repr;
use crate::effect::Effect;
use crate::fiber::context::FiberContext;
use crate::types::FiberId;
use core::fmt;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A scope fibers can be forked into.
///
/// Cheap to clone; clones refer to the same underlying scope.
#[derive(Clone)]
pub struct Scope {
    kind: ScopeKind,
}

#[derive(Clone)]
enum ScopeKind {
    Global,
    Fiber { id: FiberId, ctx: Weak<FiberContext> },
    Local(Arc<LocalScope>),
}

struct LocalScope {
    state: Mutex<LocalState>,
}

struct LocalState {
    open: bool,
    children: Vec<Weak<FiberContext>>,
    finalizers: Vec<Repr>,
}

impl Scope {
    /// The global scope. Fibers forked here are daemons: nothing tracks
    /// or interrupts them, and it never closes.
    #[must_use]
    pub const fn global() -> Self {
        Self {
            kind: ScopeKind::Global,
        }
    }

    /// Creates an open local scope.
    #[must_use]
    pub fn make() -> Self {
        Self {
            kind: ScopeKind::Local(Arc::new(LocalScope {
                state: Mutex::new(LocalState {
                    open: true,
                    children: Vec::new(),
                    finalizers: Vec::new(),
                }),
            })),
        }
    }

    pub(crate) fn fiber(ctx: &Arc<FiberContext>) -> Self {
        Self {
            kind: ScopeKind::Fiber {
                id: ctx.id(),
                ctx: Arc::downgrade(ctx),
            },
        }
    }

    /// The fiber interruption is attributed to when a fork into this scope
    /// is refused because the scope already closed.
    #[must_use]
    pub(crate) fn owner(&self) -> FiberId {
        match &self.kind {
            ScopeKind::Global | ScopeKind::Local(_) => FiberId::RUNTIME,
            ScopeKind::Fiber { id, .. } => *id,
        }
    }

    /// Registers a child with the scope. Returns false when the scope is
    /// closed (or its owning fiber is already done), in which case the
    /// child must start interrupted.
    pub(crate) fn add(&self, child: &Arc<FiberContext>) -> bool {
        match &self.kind {
            ScopeKind::Global => true,
            ScopeKind::Fiber { ctx, .. } => match ctx.upgrade() {
                Some(owner) => owner.add_child(child),
                None => false,
            },
            ScopeKind::Local(local) => {
                let mut state = local.state.lock();
                if state.open {
                    state.children.push(Arc::downgrade(child));
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Registers a finalizer to run when the scope closes. Returns false
    /// when the scope no longer admits finalizers: closed local scopes,
    /// and the global scope (which never closes).
    pub fn add_finalizer(&self, finalizer: Effect<()>) -> bool {
        match &self.kind {
            ScopeKind::Global | ScopeKind::Fiber { .. } => false,
            ScopeKind::Local(local) => {
                let mut state = local.state.lock();
                if state.open {
                    state.finalizers.push(finalizer.into_repr());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Closes the scope: interrupts and awaits its children, then runs the
    /// registered finalizers in reverse order with interruption disabled.
    /// Finalizers are unconditional; the close sequence does not depend on
    /// how the closing fiber is exiting. A second close is a no-op; closing
    /// the global or a fiber scope is always a no-op (a fiber's scope
    /// closes with the fiber).
    #[must_use]
    pub fn close(&self) -> Effect<()> {
        let ScopeKind::Local(local) = &self.kind else {
            return Effect::unit();
        };
        let local = Arc::clone(local);
        Effect::suspend(move || {
            let (children, finalizers) = {
                let mut state = local.state.lock();
                if !state.open {
                    return Effect::unit();
                }
                state.open = false;
                (
                    std::mem::take(&mut state.children),
                    std::mem::take(&mut state.finalizers),
                )
            };
            Effect::from_repr(Repr::Descriptor(Box::new(move |desc| {
                let closer = desc.id;
                let mut chain = Repr::unit();
                for child in children {
                    if let Some(child) = child.upgrade() {
                        chain = chain.zip_right(child.interrupt_and_await_repr(closer));
                    }
                }
                // Each registration wraps the chain built so far as its
                // finalizer: the last-registered runs first, and earlier
                // ones still run when it fails.
                let mut cleanup = Repr::unit();
                for finalizer in finalizers {
                    cleanup = Repr::Ensuring {
                        effect: Box::new(finalizer),
                        finalizer: Box::new(cleanup),
                    };
                }
                chain.zip_right(Repr::InterruptStatus {
                    interruptible: false,
                    effect: Box::new(cleanup),
                })
            })))
        })
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ScopeKind::Global => f.write_str("Scope::Global"),
            ScopeKind::Fiber { id, .. } => write!(f, "Scope::Fiber({id:?})"),
            ScopeKind::Local(local) => {
                let state = local.state.lock();
                write!(
                    f,
                    "Scope::Local(open: {}, children: {}, finalizers: {})",
                    state.open,
                    state.children.len(),
                    state.finalizers.len()
                )
            }
        }
    }
}
