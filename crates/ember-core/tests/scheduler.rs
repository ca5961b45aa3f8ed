//! Integration tests for the execution scheduler.
//!
//! Exercises ordering, exclusivity and interrupt escalation from several
//! caller threads, the way the kernel's channel threads use it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use ember_core::config::SchedulerConfig;
use ember_core::{Error, ExecutionResult, ExecutionScheduler, Fault, InterruptOutcome};

fn scheduler() -> Arc<ExecutionScheduler> {
    Arc::new(ExecutionScheduler::new(SchedulerConfig::default()).unwrap())
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

/// No two task bodies ever overlap, whichever thread submitted them.
#[test]
fn test_at_most_one_task_in_progress() {
    let scheduler = scheduler();
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let scheduler = scheduler.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let active = active.clone();
                    let max_seen = max_seen.clone();
                    let result = scheduler
                        .submit(format!("task {}-{}", t, i), None, move |_| {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_micros(200));
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    assert!(result.is_success());
                }
            })
        })
        .collect();

    for submitter in submitters {
        submitter.join().unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(!scheduler.is_executing());
}

/// Tasks run in the order they were queued.
#[test]
fn test_fifo_order() {
    const N: usize = 8;
    let scheduler = scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Hold the slot so every later task lands in the queue.
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let gate = {
        let scheduler = scheduler.clone();
        thread::spawn(move || {
            scheduler.submit("gate", None, move |_| {
                release_rx.recv_timeout(Duration::from_secs(10)).ok();
                Ok(())
            })
        })
    };
    wait_until("gate to start", || scheduler.is_executing());

    let mut submitters = Vec::new();
    for i in 0..N {
        let scheduler_for_thread = scheduler.clone();
        let order = order.clone();
        submitters.push(thread::spawn(move || {
            scheduler_for_thread.submit(format!("task {}", i), None, move |_| {
                order.lock().unwrap().push(i);
                Ok(i)
            })
        }));
        wait_until("task to be queued", || scheduler.queued_tasks() == i + 1);
    }

    release_tx.send(()).unwrap();
    assert!(gate.join().unwrap().unwrap().is_success());
    for (i, submitter) in submitters.into_iter().enumerate() {
        assert_eq!(submitter.join().unwrap().unwrap(), ExecutionResult::Success(i));
    }
    assert_eq!(*order.lock().unwrap(), (0..N).collect::<Vec<_>>());
}

/// A task that polls its interrupt flag unwinds within the grace period.
#[test]
fn test_cooperative_interrupt() {
    let scheduler = scheduler();
    let runner = {
        let scheduler = scheduler.clone();
        thread::spawn(move || {
            scheduler.submit("polite loop", None, |ctx| -> Result<(), Fault> {
                loop {
                    ctx.check_interrupted()?;
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
    };
    wait_until("loop to start", || scheduler.is_executing());
    assert_eq!(scheduler.current_task_name().as_deref(), Some("polite loop"));

    assert_eq!(scheduler.interrupt_current(), InterruptOutcome::Cooperative);
    assert_eq!(runner.join().unwrap().unwrap(), ExecutionResult::Interrupted);
    assert!(!scheduler.is_executing());
}

/// A task ignoring the interrupt is abandoned and the worker keeps serving.
#[test]
fn test_forced_interrupt_then_new_task_runs() {
    let scheduler = scheduler();
    let release = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let runner = {
        let scheduler = scheduler.clone();
        let release = release.clone();
        let finished = finished.clone();
        thread::spawn(move || {
            scheduler.submit("stubborn loop", None, move |_| {
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                finished.store(true, Ordering::SeqCst);
                Ok("finished anyway")
            })
        })
    };
    wait_until("loop to start", || scheduler.is_executing());

    let started = Instant::now();
    assert_eq!(scheduler.interrupt_current(), InterruptOutcome::Forced);
    assert!(started.elapsed() >= scheduler.config().interrupt_grace());
    assert_eq!(runner.join().unwrap().unwrap(), ExecutionResult::Interrupted);
    assert!(!scheduler.is_executing());

    // Replacement worker takes new work while the old body is still stuck.
    let result = scheduler.submit("after", None, |_| Ok(7)).unwrap();
    assert_eq!(result, ExecutionResult::Success(7));
    assert!(!finished.load(Ordering::SeqCst));

    release.store(true, Ordering::SeqCst);
    wait_until("abandoned body to finish", || finished.load(Ordering::SeqCst));

    // The abandoned result never leaks into later tasks.
    let result = scheduler.submit("later", None, |_| Ok(8)).unwrap();
    assert_eq!(result, ExecutionResult::Success(8));
}

/// Interrupts only target the in-flight task, never queued ones.
#[test]
fn test_interrupt_leaves_queue_alone() {
    let scheduler = scheduler();
    let first = {
        let scheduler = scheduler.clone();
        thread::spawn(move || {
            scheduler.submit("first", None, |ctx| -> Result<(), Fault> {
                loop {
                    ctx.check_interrupted()?;
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
    };
    wait_until("first to start", || scheduler.is_executing());

    let second = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.submit("second", None, |_| Ok("ran")))
    };
    wait_until("second to be queued", || scheduler.queued_tasks() == 1);

    scheduler.interrupt_current();
    assert_eq!(first.join().unwrap().unwrap(), ExecutionResult::Interrupted);
    assert_eq!(second.join().unwrap().unwrap(), ExecutionResult::Success("ran"));
}

/// Close drops queued work without running it and interrupts the running task.
#[test]
fn test_close_drains_queue() {
    let scheduler = scheduler();
    let ran = Arc::new(AtomicUsize::new(0));

    let running = {
        let scheduler = scheduler.clone();
        thread::spawn(move || {
            scheduler.submit("running", None, |ctx| -> Result<(), Fault> {
                loop {
                    ctx.check_interrupted()?;
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
    };
    wait_until("running task", || scheduler.is_executing());

    let queued: Vec<_> = (0..3)
        .map(|i| {
            let scheduler_for_thread = scheduler.clone();
            let ran = ran.clone();
            let handle = thread::spawn(move || {
                scheduler_for_thread.submit(format!("queued {}", i), None, move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
            wait_until("task to be queued", || scheduler.queued_tasks() == i + 1);
            handle
        })
        .collect();

    scheduler.close();

    assert_eq!(running.join().unwrap().unwrap(), ExecutionResult::Interrupted);
    for handle in queued {
        assert!(matches!(handle.join().unwrap(), Err(Error::SchedulerClosed)));
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(scheduler.is_closed());
}

/// Background jobs are not stuck behind a long execution.
#[test]
fn test_jobs_bypass_execution_slot() {
    let scheduler = scheduler();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let long = {
        let scheduler = scheduler.clone();
        thread::spawn(move || {
            scheduler.submit("long", None, move |_| {
                release_rx.recv_timeout(Duration::from_secs(10)).ok();
                Ok(())
            })
        })
    };
    wait_until("long task", || scheduler.is_executing());

    let (tx, rx) = mpsc::channel();
    scheduler
        .jobs()
        .launch_blocking("completion", move || {
            let _ = tx.send("completed");
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "completed");
    assert!(scheduler.is_executing());

    release_tx.send(()).unwrap();
    assert!(long.join().unwrap().unwrap().is_success());
}

/// The async submit path shares the same queue.
#[tokio::test(flavor = "multi_thread")]
async fn test_submit_async() {
    let scheduler = scheduler();
    let result = scheduler
        .submit_async("async", Some("ctx".to_string()), |ctx| {
            Ok(ctx.context().map(str::to_string))
        })
        .await
        .unwrap();
    assert_eq!(result, ExecutionResult::Success(Some("ctx".to_string())));
}
