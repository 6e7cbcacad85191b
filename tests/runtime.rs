//! Runtime-level seams: the mailbox, supervision, log routing, the
//! fatal-defect policy, and blocking joins on the thread pool.

use fibra::{
    AsyncOutcome, CollectingLogger, Effect, Exit, FiberId, LogLevel, Logger, Runtime,
    RuntimeConfig, SupervisorEvent, RecordingSupervisor, TestExecutor, ThreadPoolExecutor,
};
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
fn mailbox_effects_run_in_fifo_order_before_the_fiber_resumes() {
    let (exec, rt) = runtime();
    let order = Arc::new(Mutex::new(Vec::new()));
    let fiber = rt.run(Effect::<(), Infallible>::never());
    exec.run_all();

    assert!(fiber.eval_on(push(&order, "first")));
    assert!(fiber.eval_on(push(&order, "second")));
    assert!(order.lock().unwrap().is_empty());

    fiber.interrupt_now(FiberId::new_for_test(9));
    exec.run_all();
    assert_eq!(*order.lock().unwrap(), ["first", "second"]);
    assert!(fiber.poll().expect("fiber is done").is_interrupted());
}

#[test]
fn eval_on_refuses_terminated_fibers() {
    let (exec, rt) = runtime();
    let order = Arc::new(Mutex::new(Vec::new()));
    let fiber = rt.run(Effect::<i32>::succeed(1));
    exec.run_all();

    assert!(!fiber.eval_on(push(&order, "late")));
    exec.run_all();
    assert!(order.lock().unwrap().is_empty());
}

#[test]
fn supervisors_observe_the_fiber_lifecycle() {
    let exec = Arc::new(TestExecutor::new());
    let supervisor = Arc::new(RecordingSupervisor::new());
    let rt = Runtime::new(RuntimeConfig::new(exec.clone()).with_supervisor(supervisor.clone()));
    let eff = Effect::<i32>::succeed(1)
        .fork()
        .and_then(|child| child.await_())
        .map(|exit| exit.value().copied().unwrap_or(-1));
    let fiber = rt.run(eff);
    exec.run_all();
    assert_eq!(fiber.poll(), Some(Exit::Success(1)));

    let events = supervisor.events();
    let root = fiber.id();
    assert_eq!(
        events[0],
        SupervisorEvent::Start {
            parent: None,
            fiber: root
        }
    );
    let child = events
        .iter()
        .find_map(|event| match event {
            SupervisorEvent::Start {
                parent: Some(parent),
                fiber,
            } if *parent == root => Some(*fiber),
            _ => None,
        })
        .expect("the fork was reported");
    let end_of = |id: FiberId| {
        events
            .iter()
            .position(|event| matches!(event, SupervisorEvent::End { fiber, .. } if *fiber == id))
            .expect("the end was reported")
    };
    assert!(end_of(child) < end_of(root));
    assert!(events.contains(&SupervisorEvent::End {
        fiber: root,
        success: true,
        interrupted: false
    }));
    assert!(events.contains(&SupervisorEvent::Resume(root)));
    assert!(supervisor.op_count() > 0);
}

#[test]
fn log_entries_reach_every_configured_logger() {
    let exec = Arc::new(TestExecutor::new());
    let logger = Arc::new(CollectingLogger::new());
    let rt = Runtime::new(
        RuntimeConfig::new(exec.clone())
            .with_loggers(vec![Arc::clone(&logger) as Arc<dyn Logger>]),
    );
    let eff = Effect::log(LogLevel::Info, "hello").zip_right(Effect::log_with(
        LogLevel::Warn,
        || format!("renders {}", "lazily"),
    ));
    let fiber = rt.run(eff);
    exec.run_all();

    let entries = logger.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].level, LogLevel::Info);
    assert_eq!(entries[0].message, "hello");
    assert_eq!(entries[1].message, "renders lazily");
    assert!(entries.iter().all(|entry| entry.fiber == fiber.id()));
}

#[test]
fn unobserved_failures_are_reported_to_the_loggers() {
    let exec = Arc::new(TestExecutor::new());
    let logger = Arc::new(CollectingLogger::new());
    let rt = Runtime::new(
        RuntimeConfig::new(exec.clone())
            .with_loggers(vec![Arc::clone(&logger) as Arc<dyn Logger>]),
    );
    let _fiber = rt.run(Effect::<i32, &str>::fail("dropped"));
    exec.run_all();

    let reports = logger.messages_at(LogLevel::Debug);
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("dropped"), "report: {}", reports[0]);
}

#[test]
fn awaited_failures_are_not_reported() {
    let exec = Arc::new(TestExecutor::new());
    let logger = Arc::new(CollectingLogger::new());
    let rt = Runtime::new(
        RuntimeConfig::new(exec.clone())
            .with_loggers(vec![Arc::clone(&logger) as Arc<dyn Logger>]),
    );
    // The extra slice lets the awaiting fiber register before the failure.
    let target = rt.run(
        Effect::yield_now()
            .map_error(|never: Infallible| match never {})
            .zip_right(Effect::<i32, &str>::fail("seen")),
    );
    let waiter = rt.run(target.await_());
    exec.run_all();

    assert!(waiter.poll().expect("waiter is done").is_success());
    assert!(logger.entries().is_empty());
}

#[test]
fn fatal_defects_halt_the_runtime() {
    let exec = Arc::new(TestExecutor::new());
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let rt = Runtime::new(
        RuntimeConfig::new(exec.clone())
            .with_fatal(|defect| defect.message().contains("fatal"))
            .with_report_fatal(move |defect| {
                sink.lock().unwrap().push(defect.message().to_string());
            })
            .with_loggers(Vec::new()),
    );

    let doomed = rt.run(Effect::<i32>::succeed_with(|| panic!("fatal: no memory")));
    exec.run_all();
    let exit = doomed.poll().expect("fiber is done");
    assert!(exit
        .cause()
        .expect("exit is a failure")
        .defects()
        .iter()
        .any(|d| d.message().contains("fatal: no memory")));
    assert_eq!(reports.lock().unwrap().as_slice(), ["fatal: no memory"]);
    assert!(rt.config().is_catastrophic());

    // Every later slice halts instead of running fiber code.
    let bystander = rt.run(Effect::<i32>::succeed(1));
    exec.run_all();
    let exit = bystander.poll().expect("fiber is done");
    assert!(exit
        .cause()
        .expect("exit is a failure")
        .defects()
        .iter()
        .any(|d| d.message().contains("halted")));
}

#[test]
fn fatal_defects_bypass_finalizers() {
    let exec = Arc::new(TestExecutor::new());
    let rt = Runtime::new(
        RuntimeConfig::new(exec.clone())
            .with_fatal(|defect| defect.message().contains("fatal"))
            .with_report_fatal(|_| {})
            .with_loggers(Vec::new()),
    );
    let order = Arc::new(Mutex::new(Vec::new()));
    let eff =
        Effect::<i32>::succeed_with(|| panic!("fatal crash")).ensuring(push(&order, "cleanup"));
    let fiber = rt.run(eff);
    exec.run_all();

    assert!(fiber.poll().expect("fiber is done").is_failure());
    assert!(order.lock().unwrap().is_empty());
}

#[test]
fn join_blocks_until_a_cross_thread_resume() {
    let rt = Runtime::with_executor(Arc::new(ThreadPoolExecutor::new(2)));
    let eff = Effect::<i32>::async_(|resume| {
        std::thread::spawn(move || resume.succeed(99));
        AsyncOutcome::Pending(None)
    })
    .map(|n| n + 1);
    let fiber = rt.run(eff);
    assert_eq!(fiber.join().expect("executor stays alive"), Exit::Success(100));
}
