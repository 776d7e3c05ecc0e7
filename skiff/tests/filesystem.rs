mod common;

use common::{Trace, init_test_logging};
use skiff::fs::constants::{O_CREAT, O_RDONLY, O_RDWR, O_WRONLY};
use skiff::runtime::WorkerPool;
use skiff::{Environment, Errno, EventLoop, Handle, ReadEvent, Sandbox, ScriptError, ScriptResult, ScriptStatus};

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

/// Runs `script` with the filesystem rooted at `root`.
fn run_rooted<F>(root: &Path, script: F) -> ScriptStatus
where
    F: FnOnce(&mut EventLoop) -> ScriptResult + Send + 'static,
{
    init_test_logging();

    Environment::default()
        .create_session_with(script)
        .with_sandbox(Sandbox::new().with_root(root))
        .run()
        .expect("session runs")
}

#[test]
fn sequential_implicit_reads_see_consecutive_ranges() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.txt"), b"0123456789abcdefghijABCDEFGHIJ").unwrap();

    let trace = Trace::new();
    let seen = trace.clone();

    let status = run_rooted(dir.path(), move |lp| {
        let fd = lp.fs().open_sync("/data.txt", O_RDONLY, 0)?;

        for _ in 0..3 {
            let t = trace.clone();
            lp.fs().read(fd, 10, None, move |_, result| {
                t.push(String::from_utf8_lossy(&result?).into_owned());
                Ok(())
            });
        }

        lp.fs().read(fd, 10, None, move |lp, result| {
            if !result?.is_empty() {
                return Err(ScriptError::thrown("read past end of file returned data"));
            }
            lp.fs().close_sync(fd)?;
            Ok(())
        });
        Ok(())
    });

    assert!(status.is_success(), "{status}");
    assert_eq!(seen.entries(), ["0123456789", "abcdefghij", "ABCDEFGHIJ"]);
}

#[test]
fn sequential_implicit_writes_append_in_order() {
    let dir = tempfile::tempdir().unwrap();

    let status = run_rooted(dir.path(), |lp| {
        let fd = lp.fs().open_sync("/out.txt", O_WRONLY | O_CREAT, 0o644)?;

        for chunk in ["aa", "bb", "cc"] {
            lp.fs().write(fd, chunk.as_bytes().to_vec(), None, |_, result| {
                if result? != 2 {
                    return Err(ScriptError::thrown("short write"));
                }
                Ok(())
            });
        }

        lp.fs().close(fd, |_, result| result.map_err(Into::into));
        Ok(())
    });

    assert!(status.is_success(), "{status}");
    assert_eq!(std::fs::read(dir.path().join("out.txt")).unwrap(), b"aabbcc");
}

#[test]
fn positioned_reads_leave_the_cursor_alone() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.txt"), b"hello world").unwrap();

    let trace = Trace::new();
    let seen = trace.clone();

    let status = run_rooted(dir.path(), move |lp| {
        let fd = lp.fs().open_sync("/data.txt", O_RDONLY, 0)?;

        let t = trace.clone();
        lp.fs().read(fd, 5, Some(6), move |lp, result| {
            t.push(String::from_utf8_lossy(&result?).into_owned());

            let t = t.clone();
            lp.fs().read(fd, 5, None, move |_, result| {
                t.push(String::from_utf8_lossy(&result?).into_owned());
                Ok(())
            });
            Ok(())
        });
        Ok(())
    });

    assert!(status.is_success(), "{status}");
    assert_eq!(seen.entries(), ["world", "hello"]);
}

#[test]
fn errors_arrive_through_the_callback() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("file"), b"x").unwrap();

    let trace = Trace::new();
    let seen = trace.clone();

    let status = run_rooted(dir.path(), move |lp| {
        let t = trace.clone();
        lp.fs().read(999, 1, None, move |_, result| {
            t.push(result.map(|_| "ok").unwrap_or_else(|e| e.code()));
            Ok(())
        });

        let t = trace.clone();
        lp.fs().open("/missing", O_RDONLY, 0, move |_, result| {
            t.push(result.map(|_| "ok").unwrap_or_else(|e| e.code()));
            Ok(())
        });

        let t = trace.clone();
        lp.fs().open("/sub", O_RDWR, 0, move |_, result| {
            t.push(result.map(|_| "ok").unwrap_or_else(|e| e.code()));
            Ok(())
        });

        let t = trace.clone();
        lp.fs().readdir("/file", move |_, result| {
            t.push(result.map(|_| "ok").unwrap_or_else(|e| e.code()));
            Ok(())
        });
        Ok(())
    });

    assert!(status.is_success(), "{status}");

    let mut codes = seen.entries();
    codes.sort();
    assert_eq!(codes, ["EBADF", "EISDIR", "ENOENT", "ENOTDIR"]);
}

#[test]
fn paths_cannot_escape_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let inner = dir.path().join("jail");
    std::fs::create_dir(&inner).unwrap();
    std::fs::write(dir.path().join("secret"), b"x").unwrap();

    let status = run_rooted(&inner, |lp| match lp.fs().stat_sync("/../secret") {
        Err(err) if err.errno() == Errno::NotFound => Ok(()),
        other => Err(ScriptError::thrown(format!("escaped the root: {other:?}"))),
    });

    assert!(status.is_success(), "{status}");
}

#[test]
fn directory_operations_respect_the_umask() {
    let dir = tempfile::tempdir().unwrap();

    let trace = Trace::new();
    let seen = trace.clone();

    let status = run_rooted(dir.path(), move |lp| {
        let previous = lp.set_umask(0o027);
        if previous != 0o022 {
            return Err(ScriptError::thrown(format!("default umask was {previous:o}")));
        }

        lp.fs().mkdir("/logs", 0o777, move |lp, result| {
            result?;
            let mode = lp.fs().stat_sync("/logs")?.permissions();
            trace.push(format!("{mode:o}"));

            for name in ["b.log", "a.log"] {
                let fd = lp.fs().open_sync(&format!("/logs/{name}"), O_WRONLY | O_CREAT, 0o666)?;
                lp.fs().close_sync(fd)?;
            }

            let t = trace.clone();
            lp.fs().readdir("/logs", move |_, result| {
                t.push(result?.join(","));
                Ok(())
            });
            Ok(())
        });
        Ok(())
    });

    assert!(status.is_success(), "{status}");
    assert_eq!(seen.entries(), ["750", "a.log,b.log"]);
}

#[test]
fn relative_paths_follow_the_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("work")).unwrap();
    std::fs::write(dir.path().join("work/notes.txt"), b"12345").unwrap();

    let status = run_rooted(dir.path(), |lp| {
        if lp.working_directory() != "/" {
            return Err(ScriptError::thrown("rooted sessions start at /"));
        }

        lp.chdir("work")?;
        lp.fs().stat("notes.txt", |lp, result| {
            if result?.size != 5 || lp.working_directory() != "/work" {
                return Err(ScriptError::thrown("relative lookup missed"));
            }
            Ok(())
        });
        Ok(())
    });

    assert!(status.is_success(), "{status}");
}

#[test]
fn rejected_work_fails_with_eio_from_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let pool = WorkerPool::bounded("closed", 1, 0, Duration::from_secs(1));
    pool.shutdown();

    init_test_logging();

    let trace = Trace::new();
    let seen = trace.clone();

    let status = Environment::default()
        .create_session_with(move |lp: &mut EventLoop| {
            let returned = Rc::new(Cell::new(false));
            let flag = returned.clone();

            lp.fs().stat("/", move |_, result| {
                if !flag.get() {
                    return Err(ScriptError::thrown("callback ran inside the call"));
                }
                trace.push(result.map(|_| "ok").unwrap_or_else(|e| e.code()));
                Ok(())
            });

            returned.set(true);
            Ok(())
        })
        .with_sandbox(Sandbox::new().with_root(dir.path()).with_async_pool(pool))
        .run()
        .expect("session runs");

    assert!(status.is_success(), "{status}");
    assert_eq!(seen.entries(), ["EIO"]);
}

#[test]
fn file_streams_write_then_read_back() {
    let dir = tempfile::tempdir().unwrap();

    let status = run_rooted(dir.path(), |lp| {
        let writer = lp.fs().create_write_stream("/stream.txt", false)?;

        writer.write(lp, b"hello ".to_vec(), Box::new(|_, result| result.map_err(Into::into)))?;
        writer.write(lp, b"stream".to_vec(), Box::new(|_, result| result.map_err(Into::into)))?;

        let own = writer.clone();
        writer.shutdown(
            lp,
            Box::new(move |lp, result| {
                result?;
                own.close(lp);

                let reader = lp.fs().create_read_stream("/stream.txt")?;
                let collected = Rc::new(RefCell::new(Vec::new()));
                let done = reader.clone();

                reader.start_reading(
                    lp,
                    Box::new(move |lp, event| match event {
                        ReadEvent::Data(bytes) => {
                            collected.borrow_mut().extend(bytes);
                            Ok(())
                        }
                        ReadEvent::Eof => {
                            done.close(lp);
                            match collected.borrow().as_slice() {
                                b"hello stream" => Ok(()),
                                other => Err(ScriptError::thrown(format!(
                                    "read back {:?}",
                                    String::from_utf8_lossy(other)
                                ))),
                            }
                        }
                        ReadEvent::Error(err) => Err(err.into()),
                    }),
                )?;
                Ok(())
            }),
        )?;
        Ok(())
    });

    assert!(status.is_success(), "{status}");
    assert_eq!(std::fs::read(dir.path().join("stream.txt")).unwrap(), b"hello stream");
}

#[test]
fn append_streams_keep_existing_content() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("log.txt"), b"old ").unwrap();

    let status = run_rooted(dir.path(), |lp| {
        let writer = lp.fs().create_write_stream("/log.txt", true)?;
        writer.write(lp, b"new".to_vec(), Box::new(|_, result| result.map_err(Into::into)))?;

        let own = writer.clone();
        writer.shutdown(
            lp,
            Box::new(move |lp, result| {
                result?;
                own.close(lp);
                Ok(())
            }),
        )?;
        Ok(())
    });

    assert!(status.is_success(), "{status}");
    assert_eq!(std::fs::read(dir.path().join("log.txt")).unwrap(), b"old new");
}
