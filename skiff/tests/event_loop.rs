mod common;

use common::{Trace, init_test_logging, run};
use skiff::scheduler::Domain;
use skiff::{Environment, EventLoop, ScriptError, ScriptResult, ScriptStatus, Timer};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[skiff::test]
fn empty_script_exits_cleanly(_lp: &mut EventLoop) -> ScriptResult {
    Ok(())
}

#[test]
fn phases_run_in_loop_order() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        let t = trace.clone();
        lp.set_timeout(Duration::ZERO, move |_| {
            t.push("timer");
            Ok(())
        });

        let t = trace.clone();
        lp.set_immediate(move |_| {
            t.push("immediate");
            Ok(())
        });

        let t = trace.clone();
        lp.enqueue_task(move |_| {
            t.push("task");
            Ok(())
        });

        let t = trace.clone();
        lp.next_tick(move |_| {
            t.push("tick");
            Ok(())
        });

        trace.push("main");
        Ok(())
    });

    assert_eq!(status, ScriptStatus::Ok);
    assert_eq!(seen.entries(), ["main", "tick", "task", "immediate", "timer"]);
}

#[test]
fn ticks_queued_by_ticks_run_in_the_same_drain() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        let t = trace.clone();
        lp.set_immediate(move |_| {
            t.push("immediate");
            Ok(())
        });

        let t = trace.clone();
        lp.next_tick(move |lp| {
            t.push("tick 1");
            let t = t.clone();
            lp.next_tick(move |_| {
                t.push("tick 2");
                Ok(())
            });
            Ok(())
        });

        Ok(())
    });

    assert!(status.is_success());
    assert_eq!(seen.entries(), ["tick 1", "tick 2", "immediate"]);
}

#[test]
fn immediates_queued_during_a_batch_wait_for_the_next_turn() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        let t = trace.clone();
        lp.set_immediate(move |lp| {
            t.push("a");

            let later = t.clone();
            lp.set_immediate(move |_| {
                later.push("b");
                Ok(())
            });

            let tick = t.clone();
            lp.next_tick(move |_| {
                tick.push("tick");
                Ok(())
            });
            Ok(())
        });

        Ok(())
    });

    assert!(status.is_success());
    assert_eq!(seen.entries(), ["a", "tick", "b"]);
}

#[test]
fn tasks_run_in_enqueue_order() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        for i in 0..100 {
            let t = trace.clone();
            lp.enqueue_task(move |_| {
                t.push(i.to_string());
                Ok(())
            });
        }
        Ok(())
    });

    assert!(status.is_success());
    let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    assert_eq!(seen.entries(), expected);
}

#[test]
fn timers_fire_in_deadline_order() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        for (delay, label) in [(100, "100a"), (50, "50"), (100, "100b")] {
            let t = trace.clone();
            lp.set_timeout(Duration::from_millis(delay), move |_| {
                t.push(label);
                Ok(())
            });
        }
        Ok(())
    });

    assert!(status.is_success());
    assert_eq!(seen.entries(), ["50", "100a", "100b"]);
}

#[test]
fn equal_deadlines_fire_in_creation_order() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        for label in ["first", "second", "third"] {
            let t = trace.clone();
            lp.set_timeout(Duration::ZERO, move |_| {
                t.push(label);
                Ok(())
            });
        }
        Ok(())
    });

    assert!(status.is_success());
    assert_eq!(seen.entries(), ["first", "second", "third"]);
}

#[test]
fn cancelled_interval_stops_and_releases_the_loop() {
    let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count = fired.clone();

    let status = run(move |lp| {
        let slot: Rc<RefCell<Option<Timer>>> = Rc::default();
        let own = slot.clone();

        let timer = lp.set_interval(Duration::from_millis(5), move |_| {
            let n = count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if n == 3 {
                if let Some(timer) = own.borrow().as_ref() {
                    timer.cancel();
                }
            }
            Ok(())
        });

        *slot.borrow_mut() = Some(timer);
        Ok(())
    });

    assert!(status.is_success());
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[test]
fn cancelling_twice_is_harmless() {
    let status = run(|lp| {
        let timer = lp.set_timeout(Duration::from_secs(30), |_| Err(ScriptError::thrown("must not fire")));
        timer.cancel();
        timer.cancel();
        assert!(timer.is_cancelled());

        if lp.handle().pin_count() != 0 {
            return Err(ScriptError::thrown("cancelled timer still pins the loop"));
        }
        Ok(())
    });

    assert!(status.is_success(), "{status}");
}

#[test]
fn unmatched_unpin_does_not_hide_later_timers() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        lp.unpin();
        if lp.handle().pin_count() != 0 {
            return Err(ScriptError::thrown("pin count went below zero"));
        }

        lp.set_timeout(Duration::from_millis(20), move |_| {
            trace.push("timer fired");
            Ok(())
        });
        Ok(())
    });

    assert!(status.is_success(), "{status}");
    assert_eq!(seen.entries(), ["timer fired"]);
}

#[test]
fn unreferenced_timer_does_not_keep_the_loop_alive() {
    let started = Instant::now();

    let status = run(|lp| {
        let timer = lp.set_timeout(Duration::from_secs(30), |_| Ok(()));
        timer.unref();
        Ok(())
    });

    assert!(status.is_success());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn pinned_loop_waits_for_work_from_other_threads() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        lp.pin();
        let handle = lp.handle();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.enqueue_task(move |lp| {
                trace.push("released");
                lp.unpin();
                Ok(())
            });
        });

        Ok(())
    });

    assert!(status.is_success());
    assert_eq!(seen.entries(), ["released"]);
}

#[test]
fn timers_can_be_scheduled_from_other_threads() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        let handle = lp.handle();
        lp.pin();

        thread::spawn(move || {
            let t = trace.clone();
            handle.schedule_timer(Duration::from_millis(10), None, move |_| {
                t.push("fired");
                Ok(())
            });
            handle.unpin();
        });

        Ok(())
    });

    assert!(status.is_success());
    assert_eq!(seen.entries(), ["fired"]);
}

#[test]
fn uncaught_timer_error_terminates_the_session() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        lp.set_timeout(Duration::from_millis(10), |_| Err(ScriptError::thrown("boom")));

        lp.set_timeout(Duration::from_millis(50), move |_| {
            trace.push("late");
            Ok(())
        });
        Ok(())
    });

    assert_eq!(status, ScriptStatus::Failed(ScriptError::thrown("boom")));
    assert_eq!(status.exit_code(), -1);
    assert!(seen.entries().is_empty());
}

#[test]
fn handled_errors_let_the_loop_continue() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        let t = trace.clone();
        lp.set_fatal_handler(move |_, err| {
            t.push(format!("handled: {err}"));
            true
        });

        lp.set_timeout(Duration::from_millis(5), |_| Err(ScriptError::thrown("first")));

        lp.set_timeout(Duration::from_millis(20), move |_| {
            trace.push("after");
            Ok(())
        });
        Ok(())
    });

    assert_eq!(status, ScriptStatus::Ok);
    assert_eq!(seen.entries(), ["handled: uncaught exception: first", "after"]);
}

#[test]
fn errors_in_main_reach_the_fatal_handler() {
    let status = run(|lp| {
        lp.set_fatal_handler(|_, _| false);
        Err(ScriptError::thrown("from main"))
    });

    assert_eq!(status.error(), Some(&ScriptError::thrown("from main")));
}

#[test]
fn explicit_exit_wins_over_later_failures() {
    let status = run(|lp| {
        lp.set_fatal_handler(|_, _| true);
        lp.exit(7);
        Err(ScriptError::thrown("ignored"))
    });

    assert_eq!(status, ScriptStatus::Exit(7));
    assert_eq!(status.exit_code(), 7);
}

#[test]
fn exit_from_a_timer_skips_remaining_work() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        lp.set_timeout(Duration::from_millis(5), |lp| Err(lp.exit(3)));

        lp.set_timeout(Duration::from_millis(200), move |_| {
            trace.push("never");
            Ok(())
        });
        Ok(())
    });

    assert_eq!(status, ScriptStatus::Exit(3));
    assert!(seen.entries().is_empty());
}

#[test]
fn exit_hooks_see_the_code_and_may_replace_it() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        lp.on_exit(move |lp, code| {
            trace.push(format!("exit {code}"));
            Err(lp.exit(5))
        });
        Ok(())
    });

    assert_eq!(status, ScriptStatus::Exit(5));
    assert_eq!(seen.entries(), ["exit 0"]);
}

#[test]
fn exit_hooks_do_not_run_after_a_fatal_error() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        lp.on_exit(move |_, _| {
            trace.push("hook");
            Ok(())
        });
        Err(ScriptError::thrown("fatal"))
    });

    assert_eq!(status.exit_code(), -1);
    assert!(seen.entries().is_empty());
}

#[test]
fn cancelled_session_reports_cancellation() {
    init_test_logging();

    let future = Environment::default()
        .create_session_with(|_: &mut EventLoop| Ok(()))
        .pinned(true)
        .execute()
        .expect("session starts");

    thread::sleep(Duration::from_millis(20));
    assert!(!future.is_done());
    assert!(future.cancel());

    let status = future.get();
    assert_eq!(status, ScriptStatus::Cancelled);
    assert_eq!(status.exit_code(), -2);
    assert!(!future.cancel());
}

fn domain_label(lp: &EventLoop) -> String {
    lp.domain()
        .and_then(|d| d.downcast_ref::<&str>())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

#[test]
fn tasks_carry_their_domain_into_timers() {
    let trace = Trace::new();
    let seen = trace.clone();

    let status = run(move |lp| {
        let domain: Domain = Arc::new("request-7");

        lp.handle().enqueue_task_in(domain, move |lp| {
            trace.push(domain_label(lp));

            let t = trace.clone();
            lp.set_timeout(Duration::ZERO, move |lp| {
                t.push(domain_label(lp));
                Ok(())
            });
            Ok(())
        });

        if lp.domain().is_some() {
            return Err(ScriptError::thrown("main runs outside any domain"));
        }
        Ok(())
    });

    assert!(status.is_success(), "{status}");
    assert_eq!(seen.entries(), ["request-7", "request-7"]);
}

#[test]
fn leaked_handles_are_closed_at_shutdown() {
    let status = run(|lp| {
        let socket = lp.tcp();
        socket.bind("127.0.0.1", 0)?;

        if lp.open_handles() != 1 {
            return Err(ScriptError::thrown("socket not registered"));
        }
        Ok(())
    });

    assert!(status.is_success(), "{status}");
}

#[skiff::test]
fn deferred_callbacks_need_not_be_send(lp: &mut EventLoop) -> ScriptResult {
    let local = Rc::new(Cell::new(0));
    let inner = local.clone();

    lp.defer(move |_| {
        inner.set(inner.get() + 1);
        Ok(())
    });

    lp.on_exit(move |_, _| match local.get() {
        1 => Ok(()),
        n => Err(ScriptError::thrown(format!("deferred ran {n} times"))),
    });
    Ok(())
}
