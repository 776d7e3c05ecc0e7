mod common;

use common::{Trace, init_test_logging};
use skiff::runtime::{Implementation, OutputStream, Script, ScriptOptions, SharedBuffer};
use skiff::{Environment, EventLoop, Sandbox, ScriptError, ScriptResult, ScriptStatus, SessionError};

use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::mpsc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::Duration;

/// Records its version whenever one of its scripts runs.
struct Versioned {
    version: &'static str,
    trace: Trace,
}

impl Implementation for Versioned {
    fn version(&self) -> &str {
        self.version
    }

    fn load(&self, options: &ScriptOptions) -> Result<Box<dyn Script>, SessionError> {
        if options.script_path().is_none() {
            return Err(SessionError::Load {
                reason: "no script given".into(),
            });
        }

        let trace = self.trace.clone();
        let version = self.version;
        Ok(Box::new(move |_: &mut EventLoop| -> ScriptResult {
            trace.push(version);
            Ok(())
        }))
    }
}

fn environment(trace: &Trace) -> Environment {
    init_test_logging();

    Environment::builder()
        .implementation(Versioned {
            version: "0.10.48",
            trace: trace.clone(),
        })
        .implementation(Versioned {
            version: "0.12.7",
            trace: trace.clone(),
        })
        .build()
}

#[test]
fn version_flag_prints_the_selected_version() {
    let trace = Trace::new();
    let buffer = SharedBuffer::default();

    let status = environment(&trace)
        .create_session(["-v"])
        .unwrap()
        .with_sandbox(Sandbox::new().with_stdout(OutputStream::new(buffer.clone())))
        .run()
        .unwrap();

    assert_eq!(status, ScriptStatus::Ok);
    assert_eq!(buffer.to_string_lossy(), "v0.10.48\n");
    assert!(trace.entries().is_empty());
}

#[test]
fn version_patterns_pick_the_implementation() {
    let trace = Trace::new();
    let env = environment(&trace);

    for version in [None, Some("0.12.x"), Some("v0.10"), Some("*")] {
        let mut session = env.create_session(["app.js"]).unwrap();
        if let Some(version) = version {
            session = session.with_version(version);
        }
        assert!(session.run().unwrap().is_success());
    }

    assert_eq!(trace.entries(), ["0.10.48", "0.12.7", "0.10.48", "0.12.7"]);
}

#[test]
fn unmatched_versions_are_rejected() {
    let trace = Trace::new();

    let err = environment(&trace)
        .create_session(["app.js"])
        .unwrap()
        .with_version("4.x")
        .execute()
        .unwrap_err();
    assert!(matches!(err, SessionError::NoImplementation(v) if v == "4.x"));

    let err = Environment::default()
        .create_session(["app.js"])
        .unwrap()
        .execute()
        .unwrap_err();
    assert!(matches!(err, SessionError::NoImplementation(_)));
}

#[test]
fn eval_without_source_is_a_missing_argument() {
    let err = Environment::default().create_session(["--no-deprecation", "-e"]).err();

    match err {
        Some(SessionError::MissingArgument { flag }) => assert_eq!(flag, "-e"),
        other => panic!("expected MissingArgument, got {other:?}"),
    }
}

#[test]
fn load_failures_surface_from_execute() {
    let trace = Trace::new();

    let err = environment(&trace).create_session(["-i"]).unwrap().execute().unwrap_err();
    assert!(matches!(err, SessionError::Load { .. }));
}

#[test]
fn sessions_expose_their_configuration() {
    init_test_logging();

    let vars = HashMap::from([("MODE".to_string(), "test".to_string())]);
    let args = vec!["app.js".to_string(), "--port".to_string(), "80".to_string()];

    let status = Environment::default()
        .create_session_with(|lp: &mut EventLoop| {
            let checks = [
                lp.argv() == ["node", "app.js", "--port", "80"],
                lp.options().script_path() == Some("app.js"),
                lp.env_vars().get("MODE").map(String::as_str) == Some("test"),
                lp.env_vars().len() == 1,
                lp.umask() == 0o077,
                lp.pid() == std::process::id(),
                !lp.ipc_enabled(),
            ];

            match checks.iter().position(|ok| !ok) {
                None => Ok(()),
                Some(i) => Err(ScriptError::thrown(format!("check {i} failed"))),
            }
        })
        .with_args(args)
        .with_environment(vars)
        .with_umask(0o077)
        .run()
        .unwrap();

    assert_eq!(status, ScriptStatus::Ok);
}

#[test]
fn futures_report_completion_to_listeners() {
    init_test_logging();

    let future = Environment::default()
        .create_session_with(|lp: &mut EventLoop| {
            lp.set_timeout(Duration::from_millis(200), |lp| Err(lp.exit(4)));
            Ok(())
        })
        .execute()
        .unwrap();

    assert_eq!(future.get_timeout(Duration::from_millis(10)), None);

    let (tx, rx) = mpsc::channel();
    future.set_listener(move |status| {
        let _ = tx.send(status);
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), ScriptStatus::Exit(4));
    assert!(future.is_done());
    assert_eq!(future.get().exit_code(), 4);

    // Late listeners run immediately.
    let (tx, rx) = mpsc::channel();
    future.set_listener(move |status| {
        let _ = tx.send(status.exit_code());
    });
    assert_eq!(rx.try_recv().unwrap(), 4);
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }
}

fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);

    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        thread::park();
    }
}

#[test]
fn futures_can_be_awaited() {
    init_test_logging();

    let future = Environment::default()
        .create_session_with(|lp: &mut EventLoop| {
            lp.set_timeout(Duration::from_millis(20), |_| Ok(()));
            Ok(())
        })
        .execute()
        .unwrap();

    assert_eq!(block_on(future), ScriptStatus::Ok);
}

#[test]
fn panicking_scripts_fail_the_session() {
    init_test_logging();

    let status = Environment::default().run(|lp| {
        lp.set_timeout(Duration::ZERO, |_| panic!("script bug"));
        Ok(())
    });

    assert_eq!(status.exit_code(), -1);
    assert!(status.error().is_some());
}

#[skiff::test(executable_name = "iojs", async_threads = 2)]
fn macro_options_configure_the_environment(lp: &mut EventLoop) -> ScriptResult {
    if lp.argv() != ["iojs"] || lp.environment().executable_name() != "iojs" {
        return Err(ScriptError::thrown(format!("unexpected argv {:?}", lp.argv())));
    }
    Ok(())
}
