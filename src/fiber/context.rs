//! The fiber interpreter.
//!
//! A [`FiberContext`] owns everything one fiber needs: the shared state
//! cell other fibers interact with, and the [`RunState`] — stack,
//! interruptibility stack, fiber refs, config, and the next node — which
//! exactly one worker owns at a time. While the fiber is suspended the run
//! state is parked in a mutex slot; whoever wins the epoch-guarded
//! `exit_async` transition takes it and becomes the loop's next runner.
//! That single-owner hand-off is what makes resume exactly-once: a stale
//! resume finds a mismatched epoch and does nothing.
//!
//! Completion is multi-phase (`finish`): drain the mailbox, interrupt and
//! await children, then publish the exit to observers — in that order on
//! every termination path.

use crate::cause::Cause;
use crate::effect::repr::{
    AnyValue, AsyncAction, Cont, DynCause, DynExit, ExitCell, RaceCont, RaceSpec, Repr,
    ResumeInner,
};
use crate::exit::Exit;
use crate::fiber_ref::FiberRefs;
use crate::log::{LogEntry, LogLevel};
use crate::runtime::RuntimeConfig;
use crate::scope::Scope;
use crate::supervisor;
use crate::types::{Defect, FiberId};
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::state::{CancelerState, FiberState, FiberStatus, Observer};
use super::stack::{ContStack, Frame};
use super::FiberDescriptor;

/// Loop-owned state, moved between workers, never shared.
pub(crate) struct RunState {
    pub(crate) stack: ContStack,
    /// Interruptibility stack; top is current, pushed by `InterruptStatus`
    /// and popped by its restore frame.
    pub(crate) interrupt_status: SmallVec<[bool; 4]>,
    pub(crate) refs: FiberRefs,
    pub(crate) config: RuntimeConfig,
    /// Epoch of the next suspension; bumped on every exit from one.
    pub(crate) async_epoch: u64,
    /// Node to interpret when the loop next runs.
    pub(crate) next: Option<Repr>,
}

impl RunState {
    fn interruptible(&self) -> bool {
        self.interrupt_status.last().copied().unwrap_or(true)
    }
}

/// What an interpreter step decided.
enum Step {
    Continue(Repr),
    /// The worker is released: suspended, yielded, or done.
    Stop,
}

/// A panic caught at a user-code boundary.
enum UserPanic {
    Die(Defect),
    Fatal(Defect),
}

pub(crate) struct FiberContext {
    id: FiberId,
    me: Weak<FiberContext>,
    state: Mutex<FiberState>,
    /// Parked run state while suspended; `None` while a worker owns it.
    run_state: Mutex<Option<Box<RunState>>>,
    /// The fiber's final ref table, for joiners inheriting fiber locals.
    final_refs: Mutex<Option<FiberRefs>>,
    next_observer_key: AtomicU64,
    /// Whether anyone outside the runtime observes this fiber's exit;
    /// unobserved failures are reported to the loggers.
    has_external_observer: AtomicBool,
}

impl FiberContext {
    fn new_arc(id: FiberId) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            state: Mutex::new(FiberState::new()),
            run_state: Mutex::new(None),
            final_refs: Mutex::new(None),
            next_observer_key: AtomicU64::new(0),
            has_external_observer: AtomicBool::new(false),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("fiber context is alive")
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    /// Starts a root fiber (no parent) on the config's executor.
    pub(crate) fn spawn_root(config: RuntimeConfig, effect: Repr) -> Arc<Self> {
        let ctx = Self::new_arc(FiberId::fresh());
        config.supervisor.on_start(None, ctx.id);
        ctx.register_end_observer(config.supervisor.clone(), None);
        let rs = Box::new(RunState {
            stack: ContStack::new(),
            interrupt_status: smallvec![true],
            refs: FiberRefs::new(),
            config,
            async_epoch: 0,
            next: Some(effect),
        });
        ctx.submit_slice(rs);
        ctx
    }

    fn submit_slice(&self, rs: Box<RunState>) {
        let this = self.arc();
        let executor = Arc::clone(&rs.config.executor);
        executor.submit(Box::new(move || this.run_loop(rs)));
    }

    // ------------------------------------------------------------------
    // The interpreter loop.
    // ------------------------------------------------------------------

    pub(crate) fn run_loop(self: Arc<Self>, mut rs: Box<RunState>) {
        rs.config.supervisor.on_resume(self.id);
        if rs.config.is_catastrophic() {
            let exit = Exit::Failure(Cause::Die(Defect::new(
                "runtime halted after a fatal defect",
            )));
            self.publish_exit(&mut rs, exit);
            return;
        }
        let mut budget = rs.config.budget;
        let mut current = rs.next.take().unwrap_or_else(Repr::unit);
        loop {
            if budget == 0 {
                rs.next = Some(current);
                rs.config.supervisor.on_suspend(self.id);
                self.submit_slice(rs);
                return;
            }
            budget -= 1;

            if self.should_interrupt(&rs) {
                self.set_interrupting(true);
                current = Repr::fail_cause_now(self.interruptors_cause());
            }

            // Cross-fiber requests run before the fiber's own next node,
            // even when that node is the interruption above.
            if let Some(mail) = self.take_mailbox() {
                current = mail.zip_right(current);
            }

            rs.config.supervisor.on_effect(self.id, current.tag());

            let step = match current {
                Repr::SucceedNow(value) => self.step_value(&mut rs, value),
                Repr::Succeed(thunk) => {
                    let config = rs.config.clone();
                    match self.run_user(&config, thunk) {
                        Ok(value) => self.step_value(&mut rs, value),
                        Err(panic) => self.after_panic(&mut rs, panic),
                    }
                }
                Repr::Suspend(make) => {
                    let config = rs.config.clone();
                    match self.run_user(&config, make) {
                        Ok(node) => Step::Continue(node),
                        Err(panic) => self.after_panic(&mut rs, panic),
                    }
                }
                Repr::FlatMap(inner, k) => self.step_flat_map(&mut rs, *inner, k),
                Repr::Fail(make_cause) => {
                    let config = rs.config.clone();
                    match self.run_user(&config, make_cause) {
                        Ok(cause) => self.unwind_step(&mut rs, cause),
                        Err(panic) => self.after_panic(&mut rs, panic),
                    }
                }
                Repr::Fold {
                    effect,
                    failure,
                    success,
                } => {
                    rs.stack.push(Frame::Fold { failure, success });
                    Step::Continue(*effect)
                }
                Repr::Async {
                    register,
                    blocking_on,
                } => match self.enter_async(rs, register, blocking_on) {
                    Some((taken, next)) => {
                        rs = taken;
                        Step::Continue(next)
                    }
                    None => return,
                },
                Repr::Fork { effect, scope } => {
                    let child = self.fork_child(&mut rs, *effect, scope);
                    self.step_value(&mut rs, Box::new(child))
                }
                Repr::InterruptStatus {
                    interruptible,
                    effect,
                } => {
                    rs.interrupt_status.push(interruptible);
                    rs.stack.push(Frame::InterruptRestore);
                    Step::Continue(*effect)
                }
                Repr::CheckInterruptible(f) => {
                    let flag = rs.interruptible();
                    let config = rs.config.clone();
                    match self.run_user(&config, move || f(flag)) {
                        Ok(node) => Step::Continue(node),
                        Err(panic) => self.after_panic(&mut rs, panic),
                    }
                }
                Repr::RaceWith(spec) => {
                    let RaceSpec {
                        left,
                        right,
                        left_wins,
                        right_wins,
                        scope,
                    } = *spec;
                    let left_ctx = self.fork_child(&mut rs, left, scope.clone());
                    let right_ctx = self.fork_child(&mut rs, right, scope);
                    Step::Continue(race_arbiter(left_ctx, right_ctx, left_wins, right_wins))
                }
                Repr::GetForkScope(f) => {
                    let scope = self.current_fork_scope(&mut rs);
                    let config = rs.config.clone();
                    match self.run_user(&config, move || f(scope)) {
                        Ok(node) => Step::Continue(node),
                        Err(panic) => self.after_panic(&mut rs, panic),
                    }
                }
                Repr::OverrideForkScope { scope, effect } => {
                    let fiber_ref = rs.config.fork_scope_override.erased();
                    Step::Continue(Repr::FiberRefLocally {
                        fiber_ref,
                        value: Box::new(scope),
                        effect,
                    })
                }
                Repr::Ensuring { effect, finalizer } => {
                    rs.stack.push(Frame::Finalizer(*finalizer));
                    Step::Continue(*effect)
                }
                Repr::FiberRefModify { fiber_ref, modify } => {
                    let config = rs.config.clone();
                    let refs = &mut rs.refs;
                    match panic::catch_unwind(AssertUnwindSafe(|| refs.modify(&fiber_ref, modify)))
                    {
                        Ok(result) => self.step_value(&mut rs, result),
                        Err(payload) => {
                            let panic = self.classify_panic(&config, payload);
                            self.after_panic(&mut rs, panic)
                        }
                    }
                }
                Repr::FiberRefLocally {
                    fiber_ref,
                    value,
                    effect,
                } => {
                    let previous = rs.refs.get_cloned(&fiber_ref);
                    rs.refs.set(&fiber_ref, value);
                    let restore = Repr::FiberRefModify {
                        fiber_ref,
                        modify: Box::new(move |_| (Box::new(()) as AnyValue, previous)),
                    };
                    rs.stack.push(Frame::Finalizer(restore));
                    Step::Continue(*effect)
                }
                Repr::FiberRefDelete(fiber_ref) => {
                    rs.refs.delete(&fiber_ref);
                    self.step_value(&mut rs, Box::new(()))
                }
                Repr::FiberRefWith { fiber_ref, with } => {
                    let value = rs.refs.get_cloned(&fiber_ref);
                    let config = rs.config.clone();
                    match self.run_user(&config, move || with(value)) {
                        Ok(node) => Step::Continue(node),
                        Err(panic) => self.after_panic(&mut rs, panic),
                    }
                }
                Repr::Supervise { supervisor, effect } => {
                    let previous = rs.config.supervisor.clone();
                    rs.config.supervisor = supervisor::and(supervisor, previous.clone());
                    rs.stack.push(Frame::Finalizer(Repr::SetSupervisor(previous)));
                    Step::Continue(*effect)
                }
                Repr::SetSupervisor(supervisor) => {
                    rs.config.supervisor = supervisor;
                    self.step_value(&mut rs, Box::new(()))
                }
                Repr::Descriptor(f) => {
                    let descriptor = FiberDescriptor {
                        id: self.id,
                        interruptors: self.interruptors(),
                        interrupting: self.is_interrupting(),
                        interruptible: rs.interruptible(),
                    };
                    let config = rs.config.clone();
                    match self.run_user(&config, move || f(descriptor)) {
                        Ok(node) => Step::Continue(node),
                        Err(panic) => self.after_panic(&mut rs, panic),
                    }
                }
                Repr::Yield => {
                    rs.next = Some(Repr::unit());
                    rs.config.supervisor.on_suspend(self.id);
                    self.submit_slice(rs);
                    return;
                }
                Repr::Logged { level, message } => {
                    let config = rs.config.clone();
                    match self.run_user(&config, message) {
                        Ok(message) => {
                            config.log(&LogEntry {
                                level,
                                message,
                                fiber: self.id,
                            });
                            self.step_value(&mut rs, Box::new(()))
                        }
                        Err(panic) => self.after_panic(&mut rs, panic),
                    }
                }
                Repr::SetConfig(config) => {
                    rs.config = config;
                    self.step_value(&mut rs, Box::new(()))
                }
                Repr::InheritRefs(child) => {
                    if let Some(child_refs) = child.take_final_refs() {
                        rs.refs.join(child_refs);
                    }
                    self.step_value(&mut rs, Box::new(()))
                }
            };

            match step {
                Step::Continue(next) => current = next,
                Step::Stop => return,
            }
        }
    }

    fn step_flat_map(&self, rs: &mut RunState, inner: Repr, k: Cont) -> Step {
        // One-level inlining of already-resolved inner nodes.
        match inner {
            Repr::SucceedNow(value) => {
                let config = rs.config.clone();
                match self.run_user(&config, move || k(value)) {
                    Ok(node) => Step::Continue(node),
                    Err(panic) => self.after_panic(rs, panic),
                }
            }
            Repr::Succeed(thunk) => {
                let config = rs.config.clone();
                match self.run_user(&config, move || k(thunk())) {
                    Ok(node) => Step::Continue(node),
                    Err(panic) => self.after_panic(rs, panic),
                }
            }
            other => {
                rs.stack.push(Frame::Apply(k));
                Step::Continue(other)
            }
        }
    }

    /// Feeds a value to the continuation stack.
    fn step_value(&self, rs: &mut RunState, value: AnyValue) -> Step {
        loop {
            match rs.stack.pop() {
                None => return self.finish(rs, Exit::Success(value)),
                Some(Frame::Apply(k)) => {
                    let config = rs.config.clone();
                    return match self.run_user(&config, move || k(value)) {
                        Ok(node) => Step::Continue(node),
                        Err(panic) => self.after_panic(rs, panic),
                    };
                }
                Some(Frame::Fold { success, .. }) => {
                    let config = rs.config.clone();
                    return match self.run_user(&config, move || success(value)) {
                        Ok(node) => Step::Continue(node),
                        Err(panic) => self.after_panic(rs, panic),
                    };
                }
                Some(Frame::Finalizer(finalizer)) => {
                    let finalizer = Repr::InterruptStatus {
                        interruptible: false,
                        effect: Box::new(finalizer),
                    };
                    return Step::Continue(
                        finalizer.flat_map(move |_| Repr::SucceedNow(value)),
                    );
                }
                Some(Frame::FinalizerDone { cause }) => {
                    // A finalizer running during an unwind completed;
                    // resume the unwind.
                    return self.unwind_step(rs, cause);
                }
                Some(Frame::InterruptRestore) => {
                    rs.interrupt_status.pop();
                }
            }
        }
    }

    /// Unwinds the stack with a cause, to the nearest live handler or to
    /// fiber completion, running finalizers on the way.
    fn unwind_step(&self, rs: &mut RunState, mut cause: DynCause) -> Step {
        loop {
            match rs.stack.pop() {
                None => {
                    self.set_interrupting(true);
                    let full = Cause::then(cause, self.clear_suppressed());
                    return self.finish(rs, Exit::Failure(full));
                }
                Some(Frame::Apply(_)) => {}
                Some(Frame::Fold { failure, .. }) => {
                    if self.is_interrupting() {
                        // Handler discarded: the typed errors it knew how
                        // to catch become defects.
                        cause = cause
                            .strip_failures_with(&|e| Defect::new(e.rendered));
                    } else {
                        let config = rs.config.clone();
                        return match self.run_user(&config, move || failure(cause)) {
                            Ok(node) => Step::Continue(node),
                            Err(panic) => self.after_panic(rs, panic),
                        };
                    }
                }
                Some(Frame::FinalizerDone { cause: original }) => {
                    // The finalizer itself failed; keep the original cause
                    // first and append the finalizer's.
                    cause = Cause::then(original, cause);
                }
                Some(Frame::Finalizer(finalizer)) => {
                    rs.stack.push(Frame::FinalizerDone { cause });
                    return Step::Continue(Repr::InterruptStatus {
                        interruptible: false,
                        effect: Box::new(finalizer),
                    });
                }
                Some(Frame::InterruptRestore) => {
                    rs.interrupt_status.pop();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Async suspension.
    // ------------------------------------------------------------------

    /// Parks the run state and invokes the async registration. Returns the
    /// re-taken state when the suspension resolved before the worker left
    /// (synchronous result or an interrupt that arrived while running).
    fn enter_async(
        &self,
        rs: Box<RunState>,
        register: Box<dyn FnOnce(ResumeInner) -> AsyncAction + Send>,
        blocking_on: SmallVec<[FiberId; 2]>,
    ) -> Option<(Box<RunState>, Repr)> {
        let epoch = rs.async_epoch;
        let interruptible = rs.interruptible();
        let config = rs.config.clone();

        // Park before making the suspension visible: once the status says
        // Suspended, any winner of exit_async may take the slot.
        *self.run_state.lock() = Some(rs);
        {
            let mut st = self.state.lock();
            let ex = st
                .executing_mut()
                .expect("running fiber has not completed");
            let interrupting = ex.status.is_interrupting();
            ex.status = FiberStatus::Suspended {
                interrupting,
                interruptible,
                epoch,
                blocking_on,
            };
            ex.canceler = CancelerState::Pending;
        }
        config.supervisor.on_suspend(self.id);

        // An interrupt that arrived while we were still Running took the
        // slow path; honor it now instead of sleeping through it.
        if interruptible && !self.is_interrupting() && self.has_interruptors() {
            return match self.exit_async(epoch) {
                Some(taken) => {
                    self.set_interrupting(true);
                    config.supervisor.on_resume(self.id);
                    Some((taken, Repr::fail_cause_now(self.interruptors_cause())))
                }
                // Someone else won the suspension; they own the fiber.
                None => None,
            };
        }

        let this = self.arc();
        let resume: ResumeInner = Box::new(move |node| this.resume_async(epoch, node));
        match panic::catch_unwind(AssertUnwindSafe(move || register(resume))) {
            Ok(AsyncAction::Ready(node)) => match self.exit_async(epoch) {
                Some(taken) => {
                    config.supervisor.on_resume(self.id);
                    Some((taken, node))
                }
                None => None,
            },
            Ok(AsyncAction::Pending(canceler)) => {
                if let Some(canceler) = canceler {
                    let mut st = self.state.lock();
                    if let Some(ex) = st.executing_mut() {
                        let current = matches!(
                            ex.status,
                            FiberStatus::Suspended { epoch: e, .. } if e == epoch
                        );
                        if current && matches!(ex.canceler, CancelerState::Pending) {
                            ex.canceler = CancelerState::Registered(canceler);
                        }
                    }
                }
                None
            }
            Err(payload) => {
                let defect = Defect::from_panic(payload.as_ref());
                if (config.fatal)(&defect) {
                    config.mark_catastrophic();
                    (config.report_fatal)(&defect);
                }
                // Fail the suspension unless a resume already won it.
                self.resume_async(epoch, Repr::fail_cause_now(Cause::Die(defect)));
                None
            }
        }
    }

    /// Resume callback target: wins the suspension (or does nothing if
    /// stale) and reschedules the loop with `node`.
    pub(crate) fn resume_async(&self, epoch: u64, node: Repr) {
        if let Some(mut rs) = self.exit_async(epoch) {
            rs.next = Some(node);
            self.submit_slice(rs);
        }
    }

    /// The one transition out of a suspension: succeeds for exactly one
    /// caller per epoch, who receives the parked run state.
    fn exit_async(&self, epoch: u64) -> Option<Box<RunState>> {
        {
            let mut st = self.state.lock();
            let ex = st.executing_mut()?;
            match ex.status {
                FiberStatus::Suspended {
                    epoch: e,
                    interrupting,
                    ..
                } if e == epoch => {
                    ex.status = FiberStatus::Running { interrupting };
                    ex.canceler = CancelerState::Empty;
                }
                _ => return None,
            }
        }
        let mut rs = self
            .run_state
            .lock()
            .take()
            .expect("suspended fiber has a parked run state");
        rs.async_epoch = rs.async_epoch.wrapping_add(1);
        Some(rs)
    }

    // ------------------------------------------------------------------
    // Interruption.
    // ------------------------------------------------------------------

    /// Records an interruption request. If the fiber is suspended and
    /// interruptible this also wins the suspension, so the loop resumes
    /// immediately with the interruption (running any registered canceler
    /// first); otherwise the running loop notices at its next step.
    pub(crate) fn interrupt_now(&self, interruptor: FiberId) {
        let canceler = {
            let mut st = self.state.lock();
            let Some(ex) = st.executing_mut() else {
                return;
            };
            ex.add_interruptor(interruptor);
            match ex.status {
                FiberStatus::Suspended {
                    interruptible: true,
                    interrupting: false,
                    ..
                } => {
                    let canceler = std::mem::replace(&mut ex.canceler, CancelerState::Empty);
                    ex.status = FiberStatus::Running { interrupting: true };
                    canceler
                }
                _ => return,
            }
        };
        let mut rs = self
            .run_state
            .lock()
            .take()
            .expect("suspended fiber has a parked run state");
        rs.async_epoch = rs.async_epoch.wrapping_add(1);
        let fail = Repr::fail_cause_now(Cause::interrupt(interruptor));
        rs.next = Some(match canceler {
            CancelerState::Registered(cancel) => Repr::InterruptStatus {
                interruptible: false,
                effect: Box::new(cancel),
            }
            .zip_right(fail),
            CancelerState::Empty | CancelerState::Pending => fail,
        });
        self.submit_slice(rs);
    }

    /// Effect that interrupts the fiber and waits for it to terminate,
    /// discarding its exit.
    pub(crate) fn interrupt_and_await_repr(&self, interruptor: FiberId) -> Repr {
        let this = self.arc();
        Repr::Suspend(Box::new(move || {
            this.interrupt_now(interruptor);
            this.await_repr().flat_map(|_| Repr::unit())
        }))
    }

    fn should_interrupt(&self, rs: &RunState) -> bool {
        if !rs.interruptible() {
            return false;
        }
        let st = self.state.lock();
        match &*st {
            FiberState::Executing(ex) => {
                !ex.interruptors.is_empty() && !ex.status.is_interrupting()
            }
            FiberState::Done(_) => false,
        }
    }

    fn interruptors_cause(&self) -> DynCause {
        let mut cause = DynCause::Empty;
        for id in self.interruptors() {
            cause = Cause::then(cause, Cause::Interrupt(id));
        }
        cause
    }

    fn interruptors(&self) -> Vec<FiberId> {
        match &*self.state.lock() {
            FiberState::Executing(ex) => ex.interruptors.iter().copied().collect(),
            FiberState::Done(_) => Vec::new(),
        }
    }

    fn has_interruptors(&self) -> bool {
        matches!(&*self.state.lock(), FiberState::Executing(ex) if !ex.interruptors.is_empty())
    }

    fn is_interrupting(&self) -> bool {
        matches!(&*self.state.lock(), FiberState::Executing(ex) if ex.status.is_interrupting())
    }

    fn set_interrupting(&self, value: bool) {
        if let Some(ex) = self.state.lock().executing_mut() {
            ex.status.set_interrupting(value);
        }
    }

    fn clear_suppressed(&self) -> DynCause {
        match self.state.lock().executing_mut() {
            Some(ex) => std::mem::replace(&mut ex.suppressed, DynCause::Empty),
            None => DynCause::Empty,
        }
    }

    fn take_mailbox(&self) -> Option<Repr> {
        self.state.lock().executing_mut().and_then(|ex| ex.mailbox.take())
    }

    /// Queues an effect to run on this fiber, FIFO, before its own next
    /// node (or during its completion drain). False if already done.
    pub(crate) fn eval_on(&self, effect: Repr) -> bool {
        match self.state.lock().executing_mut() {
            Some(ex) => {
                ex.enqueue_mailbox(effect);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Fork, scope, race.
    // ------------------------------------------------------------------

    fn current_fork_scope(&self, rs: &mut RunState) -> Scope {
        let erased = rs.config.fork_scope_override.erased();
        let value = rs.refs.get_cloned(&erased);
        match value.downcast::<Option<Scope>>() {
            Ok(boxed) => (*boxed).unwrap_or_else(|| Scope::fiber(&self.arc())),
            Err(_) => Scope::fiber(&self.arc()),
        }
    }

    pub(crate) fn fork_child(
        &self,
        rs: &mut RunState,
        effect: Repr,
        scope_override: Option<Scope>,
    ) -> Arc<FiberContext> {
        let scope = match scope_override {
            Some(scope) => scope,
            None => self.current_fork_scope(rs),
        };
        let child = FiberContext::new_arc(FiberId::fresh());
        let mut child_rs = Box::new(RunState {
            stack: ContStack::new(),
            interrupt_status: smallvec![rs.interruptible()],
            refs: rs.refs.fork_child(),
            config: rs.config.clone(),
            async_epoch: 0,
            next: Some(effect),
        });
        rs.config.supervisor.on_start(Some(self.id), child.id);
        child.register_end_observer(rs.config.supervisor.clone(), Some(self.me.clone()));
        if !scope.add(&child) {
            // The scope is already closed; the child never runs its body.
            child.set_interrupting(true);
            child_rs.next = Some(Repr::fail_cause_now(Cause::Interrupt(scope.owner())));
        }
        child.submit_slice(child_rs);
        child
    }

    pub(crate) fn add_child(&self, child: &Arc<FiberContext>) -> bool {
        match self.state.lock().executing_mut() {
            Some(ex) => {
                ex.children.push(Arc::clone(child));
                true
            }
            None => false,
        }
    }

    fn remove_child(&self, id: FiberId) {
        if let Some(ex) = self.state.lock().executing_mut() {
            ex.children.retain(|c| c.id != id);
        }
    }

    pub(crate) fn children_ids(&self) -> Vec<FiberId> {
        match &*self.state.lock() {
            FiberState::Executing(ex) => ex.children.iter().map(|c| c.id).collect(),
            FiberState::Done(_) => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Observation and completion.
    // ------------------------------------------------------------------

    /// Registers a completion observer. A late observer (fiber already
    /// done) is invoked synchronously and `None` is returned; otherwise
    /// the key for deregistration.
    pub(crate) fn observe(&self, external: bool, observer: Observer) -> Option<u64> {
        if external {
            self.has_external_observer.store(true, Ordering::Relaxed);
        }
        let key = self.next_observer_key.fetch_add(1, Ordering::Relaxed);
        let late = {
            let mut st = self.state.lock();
            match &mut *st {
                FiberState::Executing(ex) => {
                    ex.observers.push((key, observer));
                    None
                }
                FiberState::Done(cell) => Some((observer, cell.clone())),
            }
        };
        match late {
            None => Some(key),
            Some((observer, cell)) => {
                observer(cell);
                None
            }
        }
    }

    pub(crate) fn remove_observer(&self, key: u64) {
        if let Some(ex) = self.state.lock().executing_mut() {
            ex.observers.retain(|(k, _)| *k != key);
        }
    }

    fn register_end_observer(
        &self,
        supervisor: Arc<dyn supervisor::Supervisor>,
        parent: Option<Weak<FiberContext>>,
    ) {
        let fiber = self.id;
        let _ = self.observe(
            false,
            Box::new(move |cell| {
                let (success, interrupted) =
                    cell.with(|exit| (exit.is_success(), exit.is_interrupted()));
                supervisor.on_end(fiber, success, interrupted);
                if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
                    parent.remove_child(fiber);
                }
            }),
        );
    }

    /// Effect resolving with this fiber's [`ExitCell`] once it is done.
    pub(crate) fn await_repr(&self) -> Repr {
        let this = self.arc();
        let blocking_on = smallvec![self.id];
        Repr::Async {
            register: Box::new(move |resume| {
                let target = Arc::clone(&this);
                let key = this.observe(
                    true,
                    Box::new(move |cell| resume(Repr::SucceedNow(Box::new(cell)))),
                );
                match key {
                    Some(key) => AsyncAction::Pending(Some(Repr::Suspend(Box::new(move || {
                        target.remove_observer(key);
                        Repr::unit()
                    })))),
                    // Already done; the observer resumed us synchronously.
                    None => AsyncAction::Pending(None),
                }
            }),
            blocking_on,
        }
    }

    pub(crate) fn poll_exit(&self) -> Option<ExitCell> {
        self.state.lock().done_exit()
    }

    pub(crate) fn take_final_refs(&self) -> Option<FiberRefs> {
        self.final_refs.lock().take()
    }

    /// Drives completion: the exit only becomes final once the mailbox is
    /// empty and every child has been interrupted and awaited.
    fn finish(&self, rs: &mut RunState, exit: DynExit) -> Step {
        if let Some(mail) = self.take_mailbox() {
            self.set_interrupting(true);
            return Step::Continue(mail.zip_right(Repr::from_exit(exit)));
        }
        let children = match self.state.lock().executing_mut() {
            Some(ex) => std::mem::take(&mut ex.children),
            None => Vec::new(),
        };
        if !children.is_empty() {
            self.set_interrupting(true);
            let this = self.arc();
            let mut chain = Repr::unit();
            for child in children {
                let parent = Arc::clone(&this);
                let shutdown = Repr::Suspend(Box::new(move || {
                    child.interrupt_now(parent.id);
                    let await_child = child.await_repr();
                    await_child.flat_map(move |cell| {
                        if let Ok(cell) = cell.downcast::<ExitCell>() {
                            parent.merge_child_defects(&cell);
                        }
                        Repr::unit()
                    })
                }));
                chain = chain.zip_right(shutdown);
            }
            return Step::Continue(chain.zip_right(Repr::from_exit(exit)));
        }
        self.publish_exit(rs, exit);
        Step::Stop
    }

    /// Child defects survive the parent's shutdown as suppressed causes.
    fn merge_child_defects(&self, cell: &ExitCell) {
        let defects = cell.with(|exit| match exit {
            Exit::Success(_) => Vec::new(),
            Exit::Failure(cause) => cause.defects(),
        });
        if defects.is_empty() {
            return;
        }
        if let Some(ex) = self.state.lock().executing_mut() {
            for defect in defects {
                ex.suppressed = Cause::then(
                    std::mem::replace(&mut ex.suppressed, DynCause::Empty),
                    Cause::Die(defect),
                );
            }
        }
    }

    /// The terminal transition: attributes outstanding interruptors,
    /// publishes `Done`, and notifies observers outside the lock.
    fn publish_exit(&self, rs: &mut RunState, exit: DynExit) {
        let supervisor = rs.config.supervisor.clone();
        let published = {
            let mut st = self.state.lock();
            let Some(ex) = st.executing_mut() else {
                return;
            };
            let final_exit = match exit {
                Exit::Success(value) => Exit::Success(value),
                Exit::Failure(mut cause) => {
                    for id in ex.interruptors.iter().copied() {
                        if !cause.contains_interruptor(id) {
                            cause = Cause::then(cause, Cause::Interrupt(id));
                        }
                    }
                    Exit::Failure(cause)
                }
            };
            let report = if self.has_external_observer.load(Ordering::Relaxed) {
                None
            } else {
                match &final_exit {
                    Exit::Failure(cause) if !cause.is_interrupted_only() => Some(format!(
                        "fiber failed with an unobserved cause: {cause:?}"
                    )),
                    _ => None,
                }
            };
            let cell = ExitCell::new(final_exit);
            let observers = std::mem::take(&mut ex.observers);
            *st = FiberState::Done(cell.clone());
            (cell, observers, report)
        };
        let (cell, observers, report) = published;
        *self.final_refs.lock() = Some(std::mem::take(&mut rs.refs));
        if let Some(message) = report {
            rs.config.log(&LogEntry {
                level: LogLevel::Debug,
                message,
                fiber: self.id,
            });
        }
        for (_, observer) in observers {
            observer(cell.clone());
        }
        supervisor.on_suspend(self.id);
    }

    // ------------------------------------------------------------------
    // User-code boundary.
    // ------------------------------------------------------------------

    fn run_user<T>(
        &self,
        config: &RuntimeConfig,
        f: impl FnOnce() -> T,
    ) -> Result<T, UserPanic> {
        panic::catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| self.classify_panic(config, payload))
    }

    fn classify_panic(
        &self,
        config: &RuntimeConfig,
        payload: Box<dyn std::any::Any + Send>,
    ) -> UserPanic {
        let defect = Defect::from_panic(payload.as_ref());
        if (config.fatal)(&defect) {
            config.mark_catastrophic();
            (config.report_fatal)(&defect);
            UserPanic::Fatal(defect)
        } else {
            UserPanic::Die(defect)
        }
    }

    fn after_panic(&self, rs: &mut RunState, panic: UserPanic) -> Step {
        match panic {
            UserPanic::Die(defect) => {
                Step::Continue(Repr::fail_cause_now(Cause::Die(defect)))
            }
            UserPanic::Fatal(defect) => {
                // Bypasses fiber-local handling and finalizers.
                self.publish_exit(rs, Exit::Failure(Cause::Die(defect)));
                Step::Stop
            }
        }
    }
}

impl core::fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let status = match &*self.state.lock() {
            FiberState::Done(_) => "done".to_string(),
            FiberState::Executing(ex) => match &ex.status {
                FiberStatus::Running { interrupting } => {
                    format!("running(interrupting: {interrupting})")
                }
                FiberStatus::Suspended {
                    interrupting,
                    interruptible,
                    epoch,
                    blocking_on,
                } => format!(
                    "suspended(interrupting: {interrupting}, interruptible: {interruptible}, \
                     epoch: {epoch}, blocking on {blocking_on:?})"
                ),
            },
        };
        write!(f, "FiberContext({:?}, {status})", self.id)
    }
}

/// Builds the suspension that settles a race: both fibers get observers,
/// the first to fire wins, the winner's handler decides the continuation.
/// The winner's fiber refs are inherited on success before the handler's
/// effect runs.
fn race_arbiter(
    left: Arc<FiberContext>,
    right: Arc<FiberContext>,
    left_wins: RaceCont,
    right_wins: RaceCont,
) -> Repr {
    let blocking_on = smallvec![left.id(), right.id()];
    Repr::Async {
        register: Box::new(move |resume| {
            let gate = Arc::new(AtomicBool::new(false));
            let slot: Arc<Mutex<Option<ResumeInner>>> = Arc::new(Mutex::new(Some(resume)));
            install_race_observer(
                Arc::clone(&left),
                Arc::clone(&right),
                left_wins,
                Arc::clone(&gate),
                Arc::clone(&slot),
            );
            install_race_observer(right, left, right_wins, gate, slot);
            AsyncAction::Pending(None)
        }),
        blocking_on,
    }
}

fn install_race_observer(
    contender: Arc<FiberContext>,
    other: Arc<FiberContext>,
    handler: RaceCont,
    gate: Arc<AtomicBool>,
    slot: Arc<Mutex<Option<ResumeInner>>>,
) {
    let winner = Arc::clone(&contender);
    let _ = contender.observe(
        true,
        Box::new(move |cell| {
            if gate
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let Some(resume) = slot.lock().take() {
                    let inherit_first = cell.is_success();
                    let next = handler(cell, other);
                    let next = if inherit_first {
                        Repr::InheritRefs(winner).zip_right(next)
                    } else {
                        next
                    };
                    resume(next);
                }
            }
        }),
    );
}
