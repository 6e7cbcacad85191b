//! The interruption protocol: requests land exactly once, suspended
//! fibers are cancelled through their epoch guard, and uninterruptible
//! regions defer rather than drop pending requests.

use fibra::{AsyncOutcome, AsyncResume, Effect, FiberId, Runtime, TestExecutor};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn runtime() -> (Arc<TestExecutor>, Runtime) {
    let exec = Arc::new(TestExecutor::new());
    let runtime = Runtime::with_executor(exec.clone());
    (exec, runtime)
}

fn fid(n: u64) -> FiberId {
    FiberId::new_for_test(n)
}

#[test]
fn interrupting_a_suspended_fiber_terminates_it() {
    let (exec, rt) = runtime();
    let fiber = rt.run(Effect::<(), Infallible>::never());
    exec.run_all();
    assert_eq!(fiber.poll(), None);

    fiber.interrupt_now(fid(77));
    exec.run_all();
    let exit = fiber.poll().expect("fiber is done");
    assert!(exit.is_interrupted());
    assert!(exit
        .cause()
        .expect("exit is a failure")
        .contains_interruptor(fid(77)));
}

#[test]
fn interrupt_as_resolves_with_the_final_exit() {
    let (exec, rt) = runtime();
    let eff = Effect::<(), Infallible>::never()
        .fork()
        .and_then(|child| child.interrupt_as(fid(5)).map(|exit| exit.is_interrupted()));
    let fiber = rt.run(eff);
    exec.run_all();
    assert_eq!(fiber.poll().and_then(|e| e.value().copied()), Some(true));
}

#[test]
fn stale_resumes_are_ignored_after_interruption() {
    let (exec, rt) = runtime();
    let stash: Arc<Mutex<Option<AsyncResume<i32, Infallible>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&stash);
    let fiber = rt.run(Effect::async_(move |resume| {
        *slot.lock().unwrap() = Some(resume);
        AsyncOutcome::Pending(None)
    }));
    exec.run_all();

    fiber.interrupt_now(fid(3));
    exec.run_all();
    let exit = fiber.poll().expect("fiber is done");
    assert!(exit.is_interrupted());

    // The registration's resume handle lost the race; using it now must
    // change nothing and schedule nothing.
    let resume = stash.lock().unwrap().take().expect("resume was stashed");
    resume.succeed(9);
    assert_eq!(exec.run_all(), 0);
    assert_eq!(fiber.poll(), Some(exit));
}

#[test]
fn uninterruptible_regions_finish_before_interruption_lands() {
    let (exec, rt) = runtime();
    let stash: Arc<Mutex<Option<AsyncResume<i32, Infallible>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&stash);
    let finished = Arc::new(AtomicBool::new(false));
    let marker = Arc::clone(&finished);

    let shielded = Effect::async_(move |resume| {
        *slot.lock().unwrap() = Some(resume);
        AsyncOutcome::Pending(None)
    })
    .map(move |n: i32| {
        marker.store(true, Ordering::SeqCst);
        n
    })
    .uninterruptible();
    let fiber = rt.run(shielded.and_then(Effect::succeed));
    exec.run_all();

    // No fast path through the shield: the request is only recorded.
    fiber.interrupt_now(fid(4));
    assert_eq!(exec.run_all(), 0);
    assert_eq!(fiber.poll(), None);

    let resume = stash.lock().unwrap().take().expect("resume was stashed");
    resume.succeed(10);
    exec.run_all();
    let exit = fiber.poll().expect("fiber is done");
    assert!(finished.load(Ordering::SeqCst));
    assert!(exit.is_interrupted());
}

#[test]
fn cancelers_run_when_interrupted_while_suspended() {
    let (exec, rt) = runtime();
    let cancelled = Arc::new(AtomicBool::new(false));
    let marker = Arc::clone(&cancelled);
    let fiber = rt.run(Effect::<(), Infallible>::async_(move |_resume| {
        let marker = Arc::clone(&marker);
        AsyncOutcome::Pending(Some(Effect::succeed_with(move || {
            marker.store(true, Ordering::SeqCst);
        })))
    }));
    exec.run_all();

    fiber.interrupt_now(fid(2));
    exec.run_all();
    assert!(cancelled.load(Ordering::SeqCst));
    assert!(fiber.poll().expect("fiber is done").is_interrupted());
}

#[test]
fn interruption_before_the_first_slice_wins() {
    let (exec, rt) = runtime();
    let ran = Arc::new(AtomicBool::new(false));
    let probe = Arc::clone(&ran);
    let fiber = rt.run(Effect::<()>::succeed_with(move || {
        probe.store(true, Ordering::SeqCst);
    }));
    fiber.interrupt_now(fid(8));
    exec.run_all();
    assert!(!ran.load(Ordering::SeqCst));
    assert!(fiber.poll().expect("fiber is done").is_interrupted());
}

#[test]
fn self_interruption_is_attributed_to_the_fiber() {
    let (exec, rt) = runtime();
    let fiber = rt.run(Effect::<(), Infallible>::interrupt());
    exec.run_all();
    let exit = fiber.poll().expect("fiber is done");
    assert!(exit
        .cause()
        .expect("exit is a failure")
        .contains_interruptor(fiber.id()));
}

#[test]
fn every_interruptor_appears_in_the_exit() {
    let (exec, rt) = runtime();
    let fiber = rt.run(Effect::<(), Infallible>::never());
    exec.run_all();

    fiber.interrupt_now(fid(21));
    fiber.interrupt_now(fid(22));
    exec.run_all();
    let exit = fiber.poll().expect("fiber is done");
    let cause = exit.cause().expect("exit is a failure");
    assert!(cause.contains_interruptor(fid(21)));
    assert!(cause.contains_interruptor(fid(22)));
}
