//! End-to-end interpreter behavior: value flow, the error channels,
//! panics, and cooperative scheduling, driven by the deterministic
//! executor.

use fibra::{Cause, Defect, Effect, Exit, Runtime, RuntimeConfig, TestExecutor};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn runtime() -> (Arc<TestExecutor>, Runtime) {
    let exec = Arc::new(TestExecutor::new());
    let runtime = Runtime::with_executor(exec.clone());
    (exec, runtime)
}

#[test]
fn pure_values_flow_to_the_exit() {
    let (exec, rt) = runtime();
    let eff = Effect::<i32>::succeed(20)
        .map(|n| n * 2)
        .and_then(|n| Effect::succeed(n + 2));
    let fiber = rt.run(eff);
    exec.run_all();
    assert_eq!(fiber.poll(), Some(Exit::Success(42)));
}

#[test]
fn typed_failures_surface_in_the_cause() {
    let (exec, rt) = runtime();
    let fiber = rt.run(Effect::<i32, &str>::fail("nope"));
    exec.run_all();
    assert_eq!(fiber.poll(), Some(Exit::Failure(Cause::Fail("nope"))));
}

#[test]
fn catch_all_recovers_typed_errors() {
    let (exec, rt) = runtime();
    let eff = Effect::<usize, &str>::fail("nope")
        .catch_all(|e| Effect::<usize, Infallible>::succeed(e.len()));
    let fiber = rt.run(eff);
    exec.run_all();
    assert_eq!(fiber.poll(), Some(Exit::Success(4)));
}

#[test]
fn defects_bypass_typed_handlers() {
    let (exec, rt) = runtime();
    let eff = Effect::<i32, &str>::die(Defect::new("boom"))
        .catch_all(|_| Effect::<i32, Infallible>::succeed(0));
    let fiber = rt.run(eff);
    exec.run_all();
    let exit = fiber.poll().expect("fiber is done");
    assert_eq!(
        exit.cause().expect("exit is a failure").defects(),
        vec![Defect::new("boom")]
    );
}

#[test]
fn panics_in_user_code_become_defects() {
    let (exec, rt) = runtime();
    let fiber = rt.run(Effect::<i32>::succeed_with(|| panic!("kaboom")));
    exec.run_all();
    let exit = fiber.poll().expect("fiber is done");
    assert!(exit.is_failure());
    assert_eq!(
        exit.cause().expect("exit is a failure").defects(),
        vec![Defect::new("kaboom")]
    );
}

#[test]
fn panics_during_async_registration_become_defects() {
    let (exec, rt) = runtime();
    let fiber = rt.run(Effect::<i32>::async_(|_resume| panic!("register blew up")));
    exec.run_all();
    let exit = fiber.poll().expect("fiber is done");
    assert_eq!(
        exit.cause().expect("exit is a failure").defects(),
        vec![Defect::new("register blew up")]
    );
}

#[test]
fn fold_cause_sees_the_full_cause() {
    let (exec, rt) = runtime();
    let eff = Effect::<i32, &str>::fail("first").fold_cause(
        |cause| Effect::<usize, Infallible>::succeed(cause.failures().len()),
        |_| Effect::succeed(0),
    );
    let fiber = rt.run(eff);
    exec.run_all();
    assert_eq!(fiber.poll(), Some(Exit::Success(1)));
}

#[test]
fn exit_materializes_failures_as_values() {
    let (exec, rt) = runtime();
    let fiber = rt.run(Effect::<i32, &str>::fail("oops").exit());
    exec.run_all();
    assert_eq!(
        fiber.poll(),
        Some(Exit::Success(Exit::Failure(Cause::Fail("oops"))))
    );
}

#[test]
fn suspend_defers_effect_construction() {
    let built = Arc::new(AtomicBool::new(false));
    let probe = Arc::clone(&built);
    let eff = Effect::<i32>::suspend(move || {
        probe.store(true, Ordering::SeqCst);
        Effect::succeed(1)
    });
    let (exec, rt) = runtime();
    let fiber = rt.run(eff);
    // Starting the fiber queues a slice; nothing has run yet.
    assert!(!built.load(Ordering::SeqCst));
    exec.run_all();
    assert!(built.load(Ordering::SeqCst));
    assert_eq!(fiber.poll(), Some(Exit::Success(1)));
}

#[test]
fn long_bind_chains_stay_on_the_heap() {
    let (exec, rt) = runtime();
    let eff = (0..4000).fold(Effect::<i64>::succeed(0), |eff, _| eff.map(|n| n + 1));
    let fiber = rt.run(eff);
    exec.run_all();
    assert_eq!(fiber.poll(), Some(Exit::Success(4000)));
}

#[test]
fn yield_now_splits_the_fiber_across_slices() {
    let (exec, rt) = runtime();
    let fiber = rt.run(Effect::yield_now().zip_right(Effect::succeed(5)));
    assert!(exec.run_next());
    assert_eq!(fiber.poll(), None);
    exec.run_all();
    assert_eq!(fiber.poll(), Some(Exit::Success(5)));
}

#[test]
fn budget_exhaustion_yields_the_worker() {
    let exec = Arc::new(TestExecutor::new());
    let rt = Runtime::new(RuntimeConfig::new(exec.clone()).with_budget(3));
    let eff = (0..30).fold(Effect::<i64>::succeed(0), |eff, _| eff.map(|n| n + 1));
    let fiber = rt.run(eff);
    let slices = exec.run_all();
    assert!(slices > 1, "expected multiple slices, got {slices}");
    assert_eq!(fiber.poll(), Some(Exit::Success(30)));
}

#[test]
fn two_fibers_interleave_under_a_small_budget() {
    let exec = Arc::new(TestExecutor::new());
    let rt = Runtime::new(RuntimeConfig::new(exec.clone()).with_budget(2));
    let chain = |n: i64| (0..n).fold(Effect::<i64>::succeed(0), |eff, _| eff.map(|v| v + 1));
    let first = rt.run(chain(50));
    let second = rt.run(chain(50));
    exec.run_all();
    assert_eq!(first.poll(), Some(Exit::Success(50)));
    assert_eq!(second.poll(), Some(Exit::Success(50)));
}

#[test]
fn every_observer_sees_the_same_exit() {
    let (exec, rt) = runtime();
    let fiber = rt.run(Effect::<i32>::succeed(5));
    let first = rt.run(fiber.await_());
    let second = rt.run(fiber.await_());
    exec.run_all();
    // Polling is idempotent and awaiting an already-done fiber resolves
    // with the same exit.
    assert_eq!(fiber.poll(), Some(Exit::Success(5)));
    assert_eq!(fiber.poll(), Some(Exit::Success(5)));
    assert_eq!(first.poll(), Some(Exit::Success(Exit::Success(5))));
    assert_eq!(second.poll(), Some(Exit::Success(Exit::Success(5))));
}
