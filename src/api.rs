//! The host module scripts call back into, registered under the configured
//! name (`exim` by default): `exim::log("...")`, `exim::expand("$primary_hostname")`.

use crate::child::{self, ChildError, SpawnOptions};
use crate::constants::{script_constants, LOG_MAIN};
use crate::error::EngineResult;
use crate::format::{format_safe, terminate_line};
use crate::host::HostServices;
use crate::session::SharedSession;
use rhai::{Array, Dynamic, EvalAltResult, ImmutableString, Map, Module, Position, INT};
use std::sync::Arc;
use std::time::Duration;

/// Raise a child-process failure as an object map so scripts can tell the
/// cases apart: `catch (err) { if err.kind == "timeout" { ... } }`.
fn child_error(err: ChildError) -> Box<EvalAltResult> {
    let kind = match &err {
        ChildError::Signaled { .. } => "signal",
        ChildError::TimedOut { .. } => "timeout",
        ChildError::Os(_) => "os",
    };

    let mut map = Map::new();
    map.insert("kind".into(), Dynamic::from(kind.to_string()));
    map.insert("message".into(), Dynamic::from(err.to_string()));
    match &err {
        ChildError::Signaled { pid, signal } => {
            map.insert("pid".into(), Dynamic::from(INT::from(*pid)));
            map.insert("signal".into(), Dynamic::from(INT::from(*signal)));
        }
        ChildError::TimedOut { pid, .. } => {
            map.insert("pid".into(), Dynamic::from(INT::from(*pid)));
        }
        ChildError::Os(io) => {
            if let Some(errno) = io.raw_os_error() {
                map.insert("errno".into(), Dynamic::from(INT::from(errno)));
            }
        }
    }

    Box::new(EvalAltResult::ErrorRuntime(Dynamic::from_map(map), Position::NONE))
}

fn to_i32(value: INT, what: &str) -> EngineResult<i32> {
    i32::try_from(value).map_err(|_| format!("{what} {value} is out of range").into())
}

fn string_list(array: Array, what: &str) -> EngineResult<Vec<String>> {
    array
        .into_iter()
        .map(|item| {
            item.into_string().map_err(|type_name| -> Box<EvalAltResult> {
                format!("{what} must only hold strings, found {type_name}").into()
            })
        })
        .collect()
}

fn log_line(services: &dyn HostServices, text: &str, selector: INT) -> EngineResult<()> {
    let selector = to_i32(selector, "log selector")?;
    services.log_write(selector, &format_safe(text, false));
    Ok(())
}

fn spawn(argv: Array, envp: Array, umask: INT, make_leader: bool) -> EngineResult<Array> {
    let argv = string_list(argv, "argv")?;
    let options = SpawnOptions {
        envp: string_list(envp, "envp")?,
        umask: u32::try_from(umask).map_err(|_| format!("umask {umask} is out of range"))?,
        make_leader,
    };

    let child = child::open(&argv, &options).map_err(child_error)?;
    Ok(vec![
        Dynamic::from(INT::from(child.stdout_fd)),
        Dynamic::from(INT::from(child.stdin_fd)),
        Dynamic::from(INT::from(child.pid)),
    ])
}

fn reap(pid: INT, timeout_seconds: Option<INT>) -> EngineResult<INT> {
    let pid = to_i32(pid, "pid")?;
    let timeout = match timeout_seconds {
        Some(seconds) => {
            let seconds = u64::try_from(seconds)
                .map_err(|_| format!("timeout {seconds} must not be negative"))?;
            Some(Duration::from_secs(seconds))
        }
        None => None,
    };
    child::close(pid, timeout)
        .map(INT::from)
        .map_err(child_error)
}

fn reinject(
    services: &dyn HostServices,
    message: &str,
    sender: &str,
    sender_auth: Option<&str>,
) -> EngineResult<INT> {
    let sender_auth = sender_auth.filter(|auth| !auth.is_empty());
    let child = services
        .child_open_exim(sender, sender_auth)
        .map_err(child_error)?;

    let written = child::write_fd(child.stdin_fd, message.as_bytes());
    let closed = child::close_fd(child.stdin_fd);
    if child.stdout_fd >= 0 {
        if let Err(e) = child::close_fd(child.stdout_fd) {
            log::debug!("Closing stdout of submission process {} failed: {e}", child.pid);
        }
    }
    written.map_err(|e| child_error(e.into()))?;
    closed.map_err(|e| child_error(e.into()))?;

    log::debug!("Handed {} bytes to submission process {}", message.len(), child.pid);
    Ok(INT::from(child.pid))
}

/// Build the host module bound to `services` and the shared message session.
pub fn host_module(services: Arc<dyn HostServices>, session: SharedSession) -> Module {
    let mut module = Module::new();

    for (name, value) in script_constants() {
        module.set_var(name, value);
    }

    let host = Arc::clone(&services);
    module.set_native_fn(
        "expand",
        move |template: ImmutableString| -> EngineResult<String> {
            host.expand_string(&template)
                .map_err(|reason| format!("expansion [{template}] failed: {reason}").into())
        },
    );

    let host = Arc::clone(&services);
    module.set_native_fn("log", move |text: ImmutableString| -> EngineResult<()> {
        log_line(&*host, &text, INT::from(LOG_MAIN))
    });

    let host = Arc::clone(&services);
    module.set_native_fn(
        "log",
        move |text: ImmutableString, selector: INT| -> EngineResult<()> {
            log_line(&*host, &text, selector)
        },
    );

    let host = Arc::clone(&services);
    let debug_session = session.clone();
    module.set_native_fn("debug_print", move |text: ImmutableString| -> EngineResult<()> {
        if debug_session.debug_enabled() {
            host.debug_printf(&format_safe(&text, true));
        }
        Ok(())
    });

    let header_session = session;
    module.set_native_fn("add_header", move |text: ImmutableString| -> EngineResult<()> {
        header_session
            .add_header(terminate_line(&text).into_owned())
            .map_err(|_| "add_header can only be used while a message is being scanned".into())
    });

    module.set_native_fn(
        "child_open",
        |argv: Array, envp: Array, umask: INT| -> EngineResult<Array> {
            spawn(argv, envp, umask, false)
        },
    );
    module.set_native_fn(
        "child_open",
        |argv: Array, envp: Array, umask: INT, make_leader: bool| -> EngineResult<Array> {
            spawn(argv, envp, umask, make_leader)
        },
    );

    module.set_native_fn("child_close", |pid: INT| -> EngineResult<INT> { reap(pid, None) });
    module.set_native_fn("child_close", |pid: INT, timeout: INT| -> EngineResult<INT> {
        reap(pid, Some(timeout))
    });

    let host = Arc::clone(&services);
    module.set_native_fn(
        "child_open_exim",
        move |message: ImmutableString| -> EngineResult<INT> {
            reinject(&*host, &message, "<>", None)
        },
    );
    let host = Arc::clone(&services);
    module.set_native_fn(
        "child_open_exim",
        move |message: ImmutableString, sender: ImmutableString| -> EngineResult<INT> {
            reinject(&*host, &message, &sender, None)
        },
    );
    let host = services;
    module.set_native_fn(
        "child_open_exim",
        move |message: ImmutableString,
              sender: ImmutableString,
              sender_auth: ImmutableString|
              -> EngineResult<INT> {
            reinject(&*host, &message, &sender, Some(sender_auth.as_str()))
        },
    );

    module.set_native_fn("fd_read", |fd: INT| -> EngineResult<String> {
        let fd = to_i32(fd, "descriptor")?;
        child::read_fd(fd)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(|e| child_error(e.into()))
    });
    module.set_native_fn("fd_write", |fd: INT, text: ImmutableString| -> EngineResult<INT> {
        let fd = to_i32(fd, "descriptor")?;
        child::write_fd(fd, text.as_bytes())
            .map(|n| INT::try_from(n).unwrap_or(INT::MAX))
            .map_err(|e| child_error(e.into()))
    });
    module.set_native_fn("fd_close", |fd: INT| -> EngineResult<()> {
        let fd = to_i32(fd, "descriptor")?;
        child::close_fd(fd).map_err(|e| child_error(e.into()))
    });

    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::ChildProcess;
    use crate::message::{HeaderLine, HEADER_OTHER};
    use rhai::Engine;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHost {
        logs: Mutex<Vec<(i32, String)>>,
        debug: Mutex<Vec<String>>,
    }

    impl HostServices for RecordingHost {
        fn expand_string(&self, template: &str) -> Result<String, String> {
            match template {
                "$primary_hostname" => Ok("mx.example.com".to_string()),
                _ => Err("unknown variable".to_string()),
            }
        }

        fn log_write(&self, selector: i32, format: &str) {
            self.logs.lock().unwrap().push((selector, format.to_string()));
        }

        fn debug_printf(&self, format: &str) {
            self.debug.lock().unwrap().push(format.to_string());
        }

        fn child_open_exim(
            &self,
            _sender: &str,
            _sender_auth: Option<&str>,
        ) -> Result<ChildProcess, ChildError> {
            let argv = ["sh", "-c", "cat > /dev/null"].map(String::from);
            child::open(&argv, &SpawnOptions::default())
        }
    }

    fn engine_with(host: Arc<RecordingHost>, session: SharedSession) -> Engine {
        let mut engine = Engine::new();
        engine.register_static_module("exim", host_module(host, session).into());
        engine
    }

    #[test]
    fn test_constants_visible() {
        let engine = engine_with(Arc::new(RecordingHost::default()), SharedSession::new());
        let reject: INT = engine.eval("exim::LOCAL_SCAN_REJECT").unwrap();
        assert_eq!(reject, 11);
        let offset: INT = engine.eval("exim::SPOOL_DATA_START_OFFSET").unwrap();
        assert_eq!(offset, 19);
    }

    #[test]
    fn test_expand() {
        let engine = engine_with(Arc::new(RecordingHost::default()), SharedSession::new());
        let host: String = engine.eval(r#"exim::expand("$primary_hostname")"#).unwrap();
        assert_eq!(host, "mx.example.com");

        let err = engine.eval::<String>(r#"exim::expand("$nope")"#).unwrap_err();
        assert!(err.to_string().contains("expansion [$nope] failed: unknown variable"));
    }

    #[test]
    fn test_log_escapes_and_defaults_to_main() {
        let host = Arc::new(RecordingHost::default());
        let engine = engine_with(Arc::clone(&host), SharedSession::new());

        engine
            .run(r#"exim::log("50% spam"); exim::log("panic", exim::LOG_PANIC);"#)
            .unwrap();

        let logs = host.logs.lock().unwrap();
        assert_eq!(logs[0], (LOG_MAIN, "50%% spam".to_string()));
        assert_eq!(logs[1], (crate::constants::LOG_PANIC, "panic".to_string()));
    }

    #[test]
    fn test_debug_print_follows_message_debug_flag() {
        let host = Arc::new(RecordingHost::default());
        let session = SharedSession::new();
        let engine = engine_with(Arc::clone(&host), session.clone());

        session.open(Vec::new(), 0);
        engine.run(r#"exim::debug_print("quiet")"#).unwrap();
        session.close();
        assert!(host.debug.lock().unwrap().is_empty());

        session.open(Vec::new(), 1);
        engine.run(r#"exim::debug_print("loud 100%")"#).unwrap();
        session.close();
        assert_eq!(*host.debug.lock().unwrap(), vec!["loud 100%%\n".to_string()]);
    }

    #[test]
    fn test_add_header() {
        let session = SharedSession::new();
        let engine = engine_with(Arc::new(RecordingHost::default()), session.clone());

        assert!(engine.run(r#"exim::add_header("X-Early: 1")"#).is_err());

        session.open(Vec::new(), 0);
        engine.run(r#"exim::add_header("X-Scanned: 100%")"#).unwrap();
        let headers = session.close().unwrap();
        assert_eq!(headers, vec![HeaderLine::new(HEADER_OTHER, "X-Scanned: 100%\n")]);
    }

    #[test]
    fn test_child_round_trip_from_script() {
        let engine = engine_with(Arc::new(RecordingHost::default()), SharedSession::new());
        let output: String = engine
            .eval(
                r#"
                let child = exim::child_open(["cat"], [], 0o022);
                exim::fd_write(child[1], "ping");
                exim::fd_close(child[1]);
                let out = exim::fd_read(child[0]);
                exim::fd_close(child[0]);
                let status = exim::child_close(child[2], 10);
                `${out}:${status}`
                "#,
            )
            .unwrap();
        assert_eq!(output, "ping:0");
    }

    #[test]
    fn test_child_timeout_is_catchable() {
        let engine = engine_with(Arc::new(RecordingHost::default()), SharedSession::new());
        let kind: String = engine
            .eval(
                r#"
                let child = exim::child_open(["sleep", "2"], [], 0, true);
                let kind = "";
                try {
                    exim::child_close(child[2], 1);
                    kind = "exited";
                } catch (err) {
                    kind = err.kind;
                }
                exim::child_close(child[2]);
                exim::fd_close(child[0]);
                exim::fd_close(child[1]);
                kind
                "#,
            )
            .unwrap();
        assert_eq!(kind, "timeout");
    }

    #[test]
    fn test_reinjection_writes_message() {
        let engine = engine_with(Arc::new(RecordingHost::default()), SharedSession::new());
        let pid: INT = engine
            .eval(r#"exim::child_open_exim("Subject: bounce\n\nbody\n", "postmaster@example.com")"#)
            .unwrap();
        assert!(pid > 0);
        assert_eq!(child::close(pid as i32, Some(Duration::from_secs(10))).unwrap(), 0);
    }
}
