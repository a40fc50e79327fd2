//! Spawning and reaping helper processes on behalf of scripts.

use std::ffi::OsStr;
use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("child process {pid} was terminated by signal {signal}")]
    Signaled { pid: i32, signal: i32 },
    #[error("timed out after {timeout:?} waiting for child process {pid}")]
    TimedOut { pid: i32, timeout: Duration },
    #[error("child process error: {0}")]
    Os(#[from] io::Error),
}

/// A spawned child, described by raw descriptors the caller now owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildProcess {
    pub pid: i32,
    /// Read end of the child's stdout.
    pub stdout_fd: RawFd,
    /// Write end of the child's stdin.
    pub stdin_fd: RawFd,
}

/// Options for [`open`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// `NAME=value` pairs. Empty means inherit the current environment.
    pub envp: Vec<String>,
    pub umask: u32,
    pub make_leader: bool,
}

/// Start `argv[0]` with piped stdin and stdout.
pub fn open(argv: &[String], options: &SpawnOptions) -> Result<ChildProcess, ChildError> {
    let (program, args) = argv.split_first().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "child_open needs a program name")
    })?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped());

    if !options.envp.is_empty() {
        command.env_clear();
        for entry in &options.envp {
            let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            command.env(OsStr::from_bytes(name.as_bytes()), value);
        }
    }

    if options.make_leader {
        command.process_group(0);
    }

    let umask = options.umask as libc::mode_t;
    // SAFETY: umask(2) is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(move || {
            libc::umask(umask);
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let pid = i32::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "pid out of range"))?;

    let stdout_fd = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdout not piped"))?
        .into_raw_fd();
    let stdin_fd = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdin not piped"))?
        .into_raw_fd();

    log::debug!("Started child process {pid}: {program}");

    Ok(ChildProcess {
        pid,
        stdout_fd,
        stdin_fd,
    })
}

/// Wait for `pid` to exit and return its exit status.
///
/// `None` (or a zero timeout) waits forever. A process killed by a signal,
/// a wait that runs out of time, and an OS failure are distinct errors.
/// A timed-out child is left running.
pub fn close(pid: i32, timeout: Option<Duration>) -> Result<i32, ChildError> {
    let deadline = timeout
        .filter(|t| !t.is_zero())
        .map(|t| (t, Instant::now() + t));
    let flags = if deadline.is_some() { libc::WNOHANG } else { 0 };

    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid out-pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid, &mut status, flags) };

        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ChildError::Os(err));
        }

        if rc == pid {
            if libc::WIFEXITED(status) {
                return Ok(libc::WEXITSTATUS(status));
            }
            if libc::WIFSIGNALED(status) {
                return Err(ChildError::Signaled {
                    pid,
                    signal: libc::WTERMSIG(status),
                });
            }
            continue;
        }

        if let Some((timeout, deadline)) = deadline {
            if Instant::now() >= deadline {
                return Err(ChildError::TimedOut { pid, timeout });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Read from `fd` until end of file.
pub fn read_fd(fd: RawFd) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        // SAFETY: buf is valid for buf.len() bytes; a bad fd yields EBADF.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            0 => return Ok(out),
            n if n > 0 => out.extend_from_slice(&buf[..n as usize]),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}

/// Write all of `data` to `fd`.
pub fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        let rest = &data[written..];
        // SAFETY: rest is valid for rest.len() bytes; a bad fd yields EBADF.
        let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        written += n as usize;
    }
    Ok(written)
}

pub fn close_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: closing an fd we do not own only affects this process's table.
    if unsafe { libc::close(fd) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
