//! Structured concurrency: forking, child shutdown, scopes, and races.

use fibra::{Effect, Fiber, FiberId, Runtime, Scope, TestExecutor};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

fn runtime() -> (Arc<TestExecutor>, Runtime) {
    let exec = Arc::new(TestExecutor::new());
    let runtime = Runtime::with_executor(exec.clone());
    (exec, runtime)
}

fn push(order: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Effect<()> {
    let order = Arc::clone(order);
    Effect::succeed_with(move || order.lock().unwrap().push(label))
}

#[test]
fn forked_fibers_run_and_can_be_awaited() {
    let (exec, rt) = runtime();
    let eff = Effect::<i32>::succeed(21)
        .map(|n| n * 2)
        .fork()
        .and_then(|child| child.await_())
        .map(|exit| exit.value().copied());
    let fiber = rt.run(eff);
    exec.run_all();
    assert_eq!(
        fiber.poll().and_then(|e| e.value().copied()),
        Some(Some(42))
    );
}

#[test]
fn children_are_interrupted_before_the_parent_completes() {
    let (exec, rt) = runtime();
    let slot: Arc<Mutex<Option<Fiber<(), Infallible>>>> = Arc::new(Mutex::new(None));
    let stash = Arc::clone(&slot);
    let parent = rt.run(Effect::<(), Infallible>::never().fork().map(move |child| {
        *stash.lock().unwrap() = Some(child);
    }));
    exec.run_all();

    assert!(parent.poll().expect("parent is done").is_success());
    let child = slot.lock().unwrap().take().expect("child was stashed");
    let exit = child.poll().expect("child is done");
    assert!(exit.is_interrupted());
    assert!(exit
        .cause()
        .expect("exit is a failure")
        .contains_interruptor(parent.id()));
}

#[test]
fn daemons_outlive_their_parent() {
    let (exec, rt) = runtime();
    let slot: Arc<Mutex<Option<Fiber<(), Infallible>>>> = Arc::new(Mutex::new(None));
    let stash = Arc::clone(&slot);
    let parent = rt.run(
        Effect::<(), Infallible>::never()
            .fork_daemon()
            .map(move |daemon| {
                *stash.lock().unwrap() = Some(daemon);
            }),
    );
    exec.run_all();

    assert!(parent.poll().expect("parent is done").is_success());
    let daemon = slot.lock().unwrap().take().expect("daemon was stashed");
    assert_eq!(daemon.poll(), None);

    daemon.interrupt_now(FiberId::new_for_test(1));
    exec.run_all();
    assert!(daemon.poll().expect("daemon is done").is_interrupted());
}

#[test]
fn forking_into_a_closed_scope_interrupts_the_child_at_birth() {
    let (exec, rt) = runtime();
    let scope = Scope::make();
    let target = scope.clone();
    let eff = scope
        .close()
        .and_then(move |()| Effect::<i32, Infallible>::succeed(1).fork_in(target))
        .and_then(|child| child.await_());
    let fiber = rt.run(eff);
    exec.run_all();

    let exit = fiber.poll().expect("fiber is done");
    let child_exit = exit.value().expect("await succeeded");
    assert!(child_exit.is_interrupted());
    assert!(child_exit
        .cause()
        .expect("exit is a failure")
        .contains_interruptor(FiberId::RUNTIME));
}

#[test]
fn closing_a_scope_stops_children_then_runs_finalizers_in_reverse() {
    let (exec, rt) = runtime();
    let order = Arc::new(Mutex::new(Vec::new()));
    let scope = Scope::make();
    assert!(scope.add_finalizer(push(&order, "f1")));
    assert!(scope.add_finalizer(push(&order, "f2")));
    assert!(scope.add_finalizer(push(&order, "f3")));

    let closer = scope.clone();
    let eff = Effect::<(), Infallible>::never()
        .fork_in(scope.clone())
        .and_then(move |child| closer.close().zip_right(child.await_()))
        .map(|exit| exit.is_interrupted());
    let fiber = rt.run(eff);
    exec.run_all();

    assert_eq!(fiber.poll().and_then(|e| e.value().copied()), Some(true));
    assert_eq!(*order.lock().unwrap(), ["f3", "f2", "f1"]);
    // The scope is spent: late registrations are refused.
    assert!(!scope.add_finalizer(Effect::unit()));
}

#[test]
fn race_adopts_the_winner_and_interrupts_the_loser() {
    let (exec, rt) = runtime();
    let eff = Effect::<i32, &str>::never().race(Effect::succeed(7));
    let fiber = rt.run(eff);
    exec.run_all();
    assert_eq!(fiber.poll().and_then(|e| e.value().copied()), Some(7));
}

#[test]
fn race_with_leaves_the_loser_running() {
    let (exec, rt) = runtime();
    let slot: Arc<Mutex<Option<Fiber<i32, Infallible>>>> = Arc::new(Mutex::new(None));
    let stash = Arc::clone(&slot);
    let eff = Effect::<i32, Infallible>::never()
        .race_with(
            Effect::<i32, Infallible>::succeed(3),
            |_, _| Effect::<i32, Infallible>::succeed(-1),
            move |exit, loser| {
                *stash.lock().unwrap() = Some(loser);
                Effect::succeed(exit.value().copied().unwrap_or(-1))
            },
        )
        // Contenders become daemons so the parent's own shutdown does not
        // interrupt the loser we want to observe.
        .override_fork_scope(Some(Scope::global()));
    let fiber = rt.run(eff);
    exec.run_all();

    assert_eq!(fiber.poll().and_then(|e| e.value().copied()), Some(3));
    let loser = slot.lock().unwrap().take().expect("loser was stashed");
    assert_eq!(loser.poll(), None);

    loser.interrupt_now(FiberId::new_for_test(9));
    exec.run_all();
    assert!(loser.poll().expect("loser is done").is_interrupted());
}

#[test]
fn descriptor_reflects_the_running_fiber() {
    let (exec, rt) = runtime();
    let fiber = rt.run(fibra::Effect::descriptor());
    exec.run_all();
    let exit = fiber.poll().expect("fiber is done");
    let descriptor = exit.value().expect("descriptor succeeded");
    assert_eq!(descriptor.id, fiber.id());
    assert!(descriptor.interruptible);
    assert!(!descriptor.interrupting);
    assert!(descriptor.interruptors.is_empty());
}
